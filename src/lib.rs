pub mod auth;
pub mod buffer;
pub mod config;
pub mod file_io;
pub mod handler;
pub mod http;
pub mod meta;
pub mod observability;
pub mod response;
pub mod server;

pub use auth::{AuthContext, AuthError};
pub use buffer::{BufRef, BufferPool, Msg};
pub use config::Config;
pub use meta::MetaStore;
