use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One entry of the password database.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct PasswordEntry {
    pub uuid: Uuid,
    pub description: String,
    pub login: String,
    #[serde(skip)]
    pub password: String,
}

impl PasswordEntry {
    pub fn new(description: &str, login: &str, password: &str) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            description: description.to_string(),
            login: login.to_string(),
            password: password.to_string(),
        }
    }
}

/// Read access to the password database.
pub trait CredentialStore {
    fn size(&self) -> usize;
    fn at(&self, index: usize) -> Option<&PasswordEntry>;

    fn find_by_description(&self, description: &str) -> Option<&PasswordEntry> {
        (0..self.size())
            .filter_map(|i| self.at(i))
            .find(|e| e.description == description)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    entries: Vec<PasswordEntry>,
}

impl MemoryCredentialStore {
    pub fn new(entries: Vec<PasswordEntry>) -> Self {
        Self { entries }
    }

    pub fn push(&mut self, entry: PasswordEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[PasswordEntry] {
        &self.entries
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn size(&self) -> usize {
        self.entries.len()
    }

    fn at(&self, index: usize) -> Option<&PasswordEntry> {
        self.entries.get(index)
    }
}
