use thiserror::Error;
use tunneldeck_core::{TunnelDeckError, VariableError};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Failed to start {program}: {reason}")]
    SpawnFailed { program: String, reason: String },
    #[error("Failed to kill process: {0}")]
    KillFailed(String),
    #[error("No SSH host configured for '{0}'")]
    EmptyHost(String),
    #[error("Local port {port} is already used by '{holder}'")]
    PortInUse { port: u16, holder: String },
    #[error("No free local port left for '{0}'")]
    NoFreePort(String),
    #[error("Node not found: {0}")]
    NodeNotFound(Uuid),
    #[error("'{0}' is a folder without a child command")]
    NotPopulatable(String),
    #[error("Process stdin is closed")]
    StdinClosed,
    #[error("Timeout")]
    Timeout,
    #[error(transparent)]
    Variable(#[from] VariableError),
    #[error(transparent)]
    Core(#[from] TunnelDeckError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a populate run produced no usable host list.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PopulateError {
    #[error("Output contains no BEGIN_DST_JSON_DATA/END_DST_JSON_DATA block")]
    MissingMarkers,
    #[error("Unparsable JSON between the data markers: {0}")]
    InvalidJson(String),
    #[error("JSON data has no \"Hosts\" key")]
    MissingHosts,
}

impl SshError {
    /// Configuration problems are reported once and never retried.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SshError::EmptyHost(_)
                | SshError::PortInUse { .. }
                | SshError::NoFreePort(_)
                | SshError::Variable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SshError>;
