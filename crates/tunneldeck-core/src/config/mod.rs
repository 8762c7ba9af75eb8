pub mod app_config;
pub mod keychain;
pub mod store;

pub use app_config::{AppConfig, ClientKind};
pub use store::{BackupHook, FileBackup, NoBackup, TunnelStore};
