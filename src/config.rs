// Copyright PingCAP Inc. 2025.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; version 2 of the License.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use serde::Deserialize;
use std::path::PathBuf;

/// Process-wide configuration, read once at startup. Values come from an
/// optional TOML file, overridden by `S3_*` environment variables, overridden
/// by command-line flags.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Root directory for metadata files and object bodies. A leading `~`
    /// expands from `$HOME`.
    #[serde(default = "default_data_root")]
    pub data_root: String,

    /// Administrator access key.
    #[serde(default = "default_access_key")]
    pub access_key: String,

    /// Administrator secret key.
    #[serde(default = "default_secret_key")]
    pub secret_key: String,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Requested payload bytes per buffer unit (rounded up to a 4 KiB
    /// multiple by the pool).
    #[serde(default = "default_buffer_payload_size")]
    pub buffer_payload_size: u32,

    /// Number of buffer units in the pool.
    #[serde(default = "default_buffer_count")]
    pub buffer_count: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            access_key: default_access_key(),
            secret_key: default_secret_key(),
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            buffer_payload_size: default_buffer_payload_size(),
            buffer_count: default_buffer_count(),
        }
    }
}

impl Config {
    pub fn from_path(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let s = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&s)?;
        Ok(cfg)
    }

    /// Load the effective configuration: file (when given), then environment
    /// overrides, then tilde expansion on the data root.
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        let mut cfg = match path {
            Some(p) => Self::from_path(p)?,
            None => Self::default(),
        };
        cfg.apply_env();
        cfg.data_root = expand_tilde(&cfg.data_root);
        Ok(cfg)
    }

    pub fn data_root_path(&self) -> PathBuf {
        PathBuf::from(&self.data_root)
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_nonempty("S3_DATA_ROOT") {
            self.data_root = v;
        }
        if let Some(v) = env_nonempty("S3_ACCESS_KEY") {
            self.access_key = v;
        }
        if let Some(v) = env_nonempty("S3_SECRET_KEY") {
            self.secret_key = v;
        }
        if let Some(v) = env_nonempty("S3_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = env_nonempty("S3_LISTEN_PORT").and_then(|v| v.parse().ok()) {
            self.listen_port = v;
        }
        if let Some(v) = env_nonempty("S3_BUFFER_PAYLOAD_SIZE").and_then(|v| v.parse().ok()) {
            self.buffer_payload_size = v;
        }
        if let Some(v) = env_nonempty("S3_BUFFER_COUNT").and_then(|v| v.parse().ok()) {
            self.buffer_count = v;
        }
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Expand a leading `~` or `~/` from `$HOME`; `~user` forms pass through.
fn expand_tilde(path: &str) -> String {
    if path != "~" && !path.starts_with("~/") {
        return path.to_string();
    }
    match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => format!("{home}{}", &path[1..]),
        _ => path.to_string(),
    }
}

fn default_data_root() -> String {
    "~/s3data".to_string()
}

fn default_access_key() -> String {
    "testkey".to_string()
}

fn default_secret_key() -> String {
    "testsecret".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_buffer_payload_size() -> u32 {
    65536
}

fn default_buffer_count() -> u32 {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.data_root, "~/s3data");
        assert_eq!(cfg.listen_addr, "0.0.0.0");
        assert_eq!(cfg.listen_port, 8080);
        assert_eq!(cfg.buffer_payload_size, 65536);
        assert_eq!(cfg.buffer_count, 1024);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: Config = toml::from_str("listen_port = 9000\naccess_key = \"AK\"")
            .expect("parse");
        assert_eq!(cfg.listen_port, 9000);
        assert_eq!(cfg.access_key, "AK");
        assert_eq!(cfg.buffer_count, 1024);
    }

    #[test]
    fn tilde_expands_from_home() {
        let home = std::env::var("HOME").unwrap_or_default();
        if home.is_empty() {
            return;
        }
        assert_eq!(expand_tilde("~/s3data"), format!("{home}/s3data"));
        assert_eq!(expand_tilde("/abs/path"), "/abs/path");
        assert_eq!(expand_tilde("~user/x"), "~user/x");
    }
}
