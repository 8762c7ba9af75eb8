//! Connection engine: drives external SSH clients for the tunnel tree.

pub mod command;
pub mod connector;
pub mod error;
pub mod event;
pub mod populate;
pub mod process;
pub mod prompt;
pub mod reconnect;
pub mod scanner;

pub use command::{build_command, ClientVersion, ResolvedTunnel};
pub use connector::{ConnectOutcome, Connector, ConnectorServices};
pub use error::{PopulateError, Result, SshError};
pub use event::{CapturedOutput, EngineEvent, ProcessTag, StatusChange};
pub use process::{CommandLine, Launcher, SystemLauncher, TunnelProcess};
pub use prompt::{HeadlessPrompter, PromptRequest, Prompter};
pub use scanner::PromptKind;
