use crate::error::{Result, TunnelDeckError};
use crate::models::{MemoryCredentialStore, PasswordEntry};
use tracing::{debug, warn};
use uuid::Uuid;

const SERVICE_NAME: &str = "tunneldeck";

fn entry(id: Uuid) -> Result<keyring::Entry> {
    keyring::Entry::new(SERVICE_NAME, &format!("password:{}", id))
        .map_err(|e| TunnelDeckError::Keychain(format!("Failed to create keyring entry: {}", e)))
}

/// Store the secret of a password-database entry in the OS keychain.
pub fn store_secret(id: Uuid, secret: &str) -> Result<()> {
    entry(id)?
        .set_password(secret)
        .map_err(|e| TunnelDeckError::Keychain(format!("Failed to store password: {}", e)))?;
    debug!("Stored secret for entry {}", id);
    Ok(())
}

/// Retrieve an entry's secret. Returns None if not found.
pub fn get_secret(id: Uuid) -> Result<Option<String>> {
    match entry(id)?.get_password() {
        Ok(secret) => Ok(Some(secret)),
        Err(keyring::Error::NoEntry) => {
            debug!("No secret stored for entry {}", id);
            Ok(None)
        }
        Err(e) => Err(TunnelDeckError::Keychain(format!(
            "Failed to retrieve password: {}",
            e
        ))),
    }
}

/// Delete an entry's secret. Returns Ok(()) even if not found.
pub fn delete_secret(id: Uuid) -> Result<()> {
    match entry(id)?.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(TunnelDeckError::Keychain(format!(
            "Failed to delete password: {}",
            e
        ))),
    }
}

/// Fill the manifest entries with their keychain secrets.
///
/// A keychain failure leaves that entry's password empty so the prompt
/// falls back to asking the user.
pub fn load_credentials(manifest: &[PasswordEntry]) -> MemoryCredentialStore {
    let mut store = MemoryCredentialStore::default();
    for item in manifest {
        let mut item = item.clone();
        match get_secret(item.uuid) {
            Ok(Some(secret)) => item.password = secret,
            Ok(None) => {}
            Err(e) => warn!("Password '{}' unavailable: {}", item.description, e),
        }
        store.push(item);
    }
    store
}
