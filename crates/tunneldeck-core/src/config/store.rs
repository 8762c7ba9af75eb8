use crate::config::app_config::AppConfig;
use crate::error::{Result, TunnelDeckError};
use crate::models::{PasswordEntry, VariableSet};
use crate::tree::{PersistedNode, TunnelTree};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// Everything persisted in `tunnels.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct TunnelStore {
    #[serde(default)]
    pub tunnels: Vec<PersistedNode>,
    #[serde(default)]
    pub variables: VariableSet,
    /// Password database manifest; secrets live in the OS keychain.
    #[serde(default)]
    pub passwords: Vec<PasswordEntry>,
}

impl TunnelStore {
    pub fn store_path() -> PathBuf {
        AppConfig::config_dir().join("tunnels.json")
    }

    pub fn backup_dir() -> PathBuf {
        AppConfig::config_dir().join("backups")
    }

    /// Load store from disk, or return empty defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::store_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut store = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let store: Self = serde_json::from_str(&content).map_err(|e| {
                TunnelDeckError::Serialization(format!(
                    "Failed to parse store at {}: {}",
                    path.display(),
                    e
                ))
            })?;
            info!("Loaded tunnel store from {}", path.display());
            store
        } else {
            let store = Self::default();
            store.save_to(path)?;
            info!("Created empty tunnel store at {}", path.display());
            store
        };
        store.variables.ensure_default_executables();
        Ok(store)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::store_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(|e| {
            TunnelDeckError::Serialization(format!("Failed to serialize store: {}", e))
        })?;
        std::fs::write(path, content)?;
        info!("Saved tunnel store to {}", path.display());

        Ok(())
    }

    /// Build the runtime arena from the persisted nodes.
    pub fn tree(&self) -> TunnelTree {
        TunnelTree::from_persisted(self.tunnels.clone())
    }

    /// Replace the persisted nodes with the current shape of `tree`.
    pub fn set_tree(&mut self, tree: &TunnelTree) {
        self.tunnels = tree.to_persisted();
    }

    /// Add a manifest entry, or update the login of the one with this
    /// description. Returns the entry's UUID, which keys its keychain secret.
    pub fn upsert_password(&mut self, description: &str, login: &str) -> Uuid {
        if let Some(entry) = self
            .passwords
            .iter_mut()
            .find(|e| e.description == description)
        {
            entry.login = login.to_string();
            return entry.uuid;
        }
        let entry = PasswordEntry::new(description, login, "");
        let id = entry.uuid;
        self.passwords.push(entry);
        id
    }

    /// Drop the manifest entry with this description.
    pub fn remove_password(&mut self, description: &str) -> Option<PasswordEntry> {
        let index = self
            .passwords
            .iter()
            .position(|e| e.description == description)?;
        Some(self.passwords.remove(index))
    }
}

/// Called before any structural mutation of the tree.
pub trait BackupHook: Send {
    fn backup(&mut self, tree: &TunnelTree);
}

/// Does nothing; used headless and in tests.
#[derive(Debug, Default)]
pub struct NoBackup;

impl BackupHook for NoBackup {
    fn backup(&mut self, _tree: &TunnelTree) {}
}

/// Writes a timestamped snapshot of the tree to a backup directory.
#[derive(Debug, Clone)]
pub struct FileBackup {
    dir: PathBuf,
}

impl FileBackup {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn write(&self, tree: &TunnelTree) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S%.3f");
        let path = self.dir.join(format!("tunnels-{}.json", stamp));
        let content = serde_json::to_string_pretty(&tree.to_persisted()).map_err(|e| {
            TunnelDeckError::Serialization(format!("Failed to serialize backup: {}", e))
        })?;
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

impl BackupHook for FileBackup {
    fn backup(&mut self, tree: &TunnelTree) {
        match self.write(tree) {
            Ok(path) => info!("Wrote tree backup to {}", path.display()),
            Err(e) => warn!("Tree backup failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PortForward, TunnelConfig, Variable, VariableKind};

    #[test]
    fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnels.json");

        let mut tree = TunnelTree::new();
        let gw = tree
            .insert(None, TunnelConfig::new_tunnel("gw", "gw.example.com:2222", 22))
            .unwrap();
        let mut db = TunnelConfig::new_tunnel("db", "10.0.0.5", 5432);
        db.port_forwards.push(PortForward::new_dynamic(1080));
        tree.insert(Some(gw), db).unwrap();

        let mut store = TunnelStore::default();
        store.set_tree(&tree);
        store.variables.upsert(Variable::user_defined("JUMP", "gw"));
        store
            .passwords
            .push(PasswordEntry::new("prod", "admin", "secret"));
        store.save_to(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"SshHosts\""));
        assert!(!raw.contains("secret"));

        let loaded = TunnelStore::load_from(&path).unwrap();
        let tree2 = loaded.tree();
        assert_eq!(tree2.len(), 2);
        let db_id = tree2.find("gw/db").unwrap();
        assert_eq!(tree2.effective_parent_tunnel(db_id), Some(gw));
        assert_eq!(tree2.get(db_id).unwrap().config.port_forwards.len(), 1);
        assert!(loaded.variables.get("JUMP", VariableKind::UserDefined).is_some());
        assert!(loaded.variables.executable("ssh").is_some());
        assert_eq!(loaded.passwords[0].password, "");
    }

    #[test]
    fn test_password_manifest_upsert_and_remove() {
        let mut store = TunnelStore::default();
        let id = store.upsert_password("prod", "admin");
        assert_eq!(store.upsert_password("prod", "root"), id);
        assert_eq!(store.passwords.len(), 1);
        assert_eq!(store.passwords[0].login, "root");

        let other = store.upsert_password("staging", "");
        assert_ne!(other, id);

        let removed = store.remove_password("prod").unwrap();
        assert_eq!(removed.uuid, id);
        assert!(store.remove_password("prod").is_none());
        assert_eq!(store.passwords.len(), 1);
    }

    #[test]
    fn test_corrupt_store_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnels.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            TunnelStore::load_from(&path),
            Err(TunnelDeckError::Serialization(_))
        ));
    }

    #[test]
    fn test_file_backup_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = TunnelTree::new();
        tree.insert(None, TunnelConfig::new_folder("prod")).unwrap();
        let mut hook = FileBackup::new(dir.path().join("backups"));
        hook.backup(&tree);
        let files: Vec<_> = std::fs::read_dir(dir.path().join("backups"))
            .unwrap()
            .collect();
        assert_eq!(files.len(), 1);
    }
}
