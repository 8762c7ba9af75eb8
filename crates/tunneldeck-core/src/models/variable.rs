use serde::{Deserialize, Serialize};

/// Namespace a variable reference resolves in.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum VariableKind {
    Builtin,
    Password,
    Executable,
    #[default]
    UserDefined,
    EditPane,
}

/// A user-managed named string (executables additionally carry arguments).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct Variable {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub arguments: String,
    pub kind: VariableKind,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl Variable {
    pub fn user_defined(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            kind: VariableKind::UserDefined,
            ..Self::default()
        }
    }

    pub fn executable(name: &str, path: &str, arguments: &str) -> Self {
        Self {
            name: name.to_string(),
            value: path.to_string(),
            arguments: arguments.to_string(),
            kind: VariableKind::Executable,
            ..Self::default()
        }
    }
}

/// The persisted executable and user-defined variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct VariableSet {
    variables: Vec<Variable>,
}

pub const PLINK_EXECUTABLE: &str = "plink";
pub const SSH_EXECUTABLE: &str = "ssh";
pub const SSHPASS_EXECUTABLE: &str = "sshpass";

impl VariableSet {
    pub fn new(variables: Vec<Variable>) -> Self {
        Self { variables }
    }

    /// A set seeded with the SSH client executables the engine drives.
    pub fn with_default_executables() -> Self {
        let mut set = Self::default();
        set.ensure_default_executables();
        set
    }

    /// Add any missing client executable, leaving user overrides untouched.
    pub fn ensure_default_executables(&mut self) {
        let plink = if cfg!(windows) { "plink.exe" } else { "plink" };
        for (name, path) in [
            (PLINK_EXECUTABLE, plink),
            (SSH_EXECUTABLE, "ssh"),
            (SSHPASS_EXECUTABLE, "sshpass"),
        ] {
            if self.get(name, VariableKind::Executable).is_none() {
                self.variables.push(Variable::executable(name, path, ""));
            }
        }
    }

    pub fn get(&self, name: &str, kind: VariableKind) -> Option<&Variable> {
        self.variables
            .iter()
            .find(|v| v.kind == kind && v.name == name)
    }

    pub fn executable(&self, name: &str) -> Option<&Variable> {
        self.get(name, VariableKind::Executable)
    }

    /// Insert or replace the variable with the same name and kind.
    pub fn upsert(&mut self, variable: Variable) {
        match self
            .variables
            .iter_mut()
            .find(|v| v.kind == variable.kind && v.name == variable.name)
        {
            Some(existing) => *existing = variable,
            None => self.variables.push(variable),
        }
    }

    pub fn remove(&mut self, name: &str, kind: VariableKind) -> bool {
        let before = self.variables.len();
        self.variables.retain(|v| !(v.kind == kind && v.name == name));
        self.variables.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_executables_keep_overrides() {
        let mut set = VariableSet::new(vec![Variable::executable("ssh", "/opt/ssh", "-4")]);
        set.ensure_default_executables();
        assert_eq!(set.executable("ssh").unwrap().value, "/opt/ssh");
        assert!(set.executable("plink").is_some());
        assert!(set.executable("sshpass").is_some());
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_upsert_and_remove() {
        let mut set = VariableSet::default();
        set.upsert(Variable::user_defined("jump", "a"));
        set.upsert(Variable::user_defined("jump", "b"));
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("jump", VariableKind::UserDefined).unwrap().value, "b");
        assert!(set.get("jump", VariableKind::Executable).is_none());
        assert!(set.remove("jump", VariableKind::UserDefined));
        assert!(set.is_empty());
    }
}
