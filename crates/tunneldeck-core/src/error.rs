use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TunnelDeckError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Keychain error: {0}")]
    Keychain(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Node not found: {0}")]
    NodeNotFound(Uuid),
    #[error("Tree error: {0}")]
    Tree(String),
    #[error(transparent)]
    Variable(#[from] VariableError),
}

/// Failures of template expansion.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VariableError {
    #[error("Variable reference cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("Unclosed quote in arguments: {0}")]
    UnclosedQuote(String),
}

pub type Result<T> = std::result::Result<T, TunnelDeckError>;
