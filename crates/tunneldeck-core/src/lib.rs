pub mod config;
pub mod error;
pub mod models;
pub mod ports;
pub mod tree;
pub mod variables;

pub use error::{Result, TunnelDeckError, VariableError};
pub use models::*;
pub use tree::{PersistedNode, TunnelTree};

/// Application version, resolved at compile time from the workspace Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
