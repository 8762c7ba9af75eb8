use crate::error::{Result, TunnelDeckError};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

/// Which command-line client drives the tunnels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientKind {
    #[default]
    Plink,
    OpenSsh,
    /// `sshpass -e ssh`, password passed through the environment.
    SshPass,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub auto_reconnect: bool,
    pub reconnect_interval_secs: u64,
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub auto_clear_log: bool,
    pub hide_passwords_in_log: bool,
    pub max_log_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub kind: ClientKind,
    pub version_check_timeout_ms: u64,
    /// Bounded wait after killing a process on disconnect.
    pub kill_wait_ms: u64,
    pub populate_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_interval_secs: 5,
            max_reconnect_attempts: 10,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            auto_clear_log: false,
            hide_passwords_in_log: true,
            max_log_lines: crate::models::DEFAULT_LOG_CAPACITY,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            kind: ClientKind::default(),
            version_check_timeout_ms: 1000,
            kill_wait_ms: 1000,
            populate_timeout_secs: 60,
        }
    }
}

impl AppConfig {
    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("com", "tunneldeck", "TunnelDeck").ok_or_else(|| {
            TunnelDeckError::Config("Could not determine config directory".to_string())
        })
    }

    /// Get the config directory path.
    pub fn config_dir() -> PathBuf {
        match Self::project_dirs() {
            Ok(dirs) => dirs.config_dir().to_path_buf(),
            Err(_) => {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".config").join("tunneldeck")
            }
        }
    }

    /// Per-user data directory, exposed to templates as `DATA_DIR`.
    pub fn data_dir() -> PathBuf {
        match Self::project_dirs() {
            Ok(dirs) => dirs.data_dir().to_path_buf(),
            Err(_) => Self::config_dir(),
        }
    }

    /// Directory holding the running executable, exposed as `APP_DIR`.
    pub fn app_dir() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load config from disk, or create and save defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content).map_err(|e| {
                TunnelDeckError::Config(format!(
                    "Failed to parse config at {}: {}",
                    path.display(),
                    e
                ))
            })?;
            info!("Loaded config from {}", path.display());
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            info!("Created default config at {}", path.display());
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let content = toml::to_string_pretty(self).map_err(|e| {
            TunnelDeckError::Serialization(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(path, content)?;
        info!("Saved config to {}", path.display());

        Ok(())
    }

    /// Whether an exited process with `retries` attempts so far gets another one.
    pub fn allows_reconnect(&self, retries: u32) -> bool {
        self.connection.auto_reconnect
            && self.connection.reconnect_interval_secs > 0
            && retries < self.connection.max_reconnect_attempts
    }
}
