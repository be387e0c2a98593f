/// Tracing and structured logging configuration
use std::str::FromStr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for logging
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable format for development
    Human,
    /// JSON format for production/log aggregation
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            _ => Ok(OutputFormat::Human),
        }
    }
}

/// Initialize the tracing subscriber with the given format.
///
/// `RUST_LOG` filters as usual; `LOG_LEVEL` sets the default level when
/// `RUST_LOG` is unset.
pub fn init_tracing(format: OutputFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(format!("s3lite={log_level}"))
    });

    match format {
        OutputFormat::Human => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_level(true)
                        .with_ansi(true),
                )
                .init();
        }
        OutputFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_level(true),
                )
                .init();
        }
    }
}

/// Initialize tracing with the format taken from `LOG_FORMAT` ("json" or
/// anything else for human-readable).
pub fn init_tracing_from_env() {
    let format_str = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "human".to_string());
    let format = OutputFormat::from_str(&format_str).unwrap_or(OutputFormat::Human);
    init_tracing(format);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_parsing() {
        assert!(matches!(OutputFormat::from_str("json"), Ok(OutputFormat::Json)));
        assert!(matches!(OutputFormat::from_str("JSON"), Ok(OutputFormat::Json)));
        assert!(matches!(OutputFormat::from_str("human"), Ok(OutputFormat::Human)));
        assert!(matches!(OutputFormat::from_str("invalid"), Ok(OutputFormat::Human)));
    }
}
