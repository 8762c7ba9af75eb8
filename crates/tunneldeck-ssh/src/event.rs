use tokio::sync::mpsc;
use tunneldeck_core::ConnectStatus;
use uuid::Uuid;

/// Identifies one spawn of a node's process. Events from an older spawn
/// carry a stale generation and are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessTag {
    pub node: Uuid,
    pub generation: u64,
}

/// Combined output and exit code of a program run to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub code: Option<i32>,
    pub output: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Everything that wakes the connector up.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Output {
        tag: ProcessTag,
        data: String,
    },
    Exited {
        tag: ProcessTag,
        code: Option<i32>,
    },
    ReconnectDue {
        node: Uuid,
        token: u64,
    },
    PopulateFinished {
        folder: Uuid,
        result: Result<CapturedOutput, String>,
    },
}

pub type EventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Published on every status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub node: Uuid,
    pub name: String,
    pub status: ConnectStatus,
}
