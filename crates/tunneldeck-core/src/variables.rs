//! Template expansion for `${name}` and `$name` references.
//!
//! A reference is looked up in the namespaces in this order: edit pane,
//! builtin, password, executable, user defined. Values of every namespace
//! except passwords may themselves contain references; expansion follows the
//! reference graph depth first and reports a cycle instead of truncating.
//! `$$` produces a literal `$`. Unknown references are left verbatim.

use crate::error::VariableError;
use crate::models::{split_host_port, CredentialStore, TunnelConfig, VariableKind, VariableSet};
use std::collections::HashMap;
use std::path::Path;

pub const BUILTIN_HOST: &str = "HOST";
pub const BUILTIN_REMOTE_HOST: &str = "REMOTE_HOST";
pub const BUILTIN_USERNAME: &str = "USERNAME";
pub const BUILTIN_PASSWORD: &str = "PASSWORD";
pub const BUILTIN_KEYFILE: &str = "KEYFILE";
pub const BUILTIN_KEYPASSPHRASE: &str = "KEYPASSPHRASE";
pub const BUILTIN_NAME: &str = "NAME";
pub const BUILTIN_LOCAL_IP: &str = "LOCAL_IP";
pub const BUILTIN_LOCAL_PORT: &str = "LOCAL_PORT";
pub const BUILTIN_REMOTE_PORT: &str = "REMOTE_PORT";
pub const BUILTIN_APP_DIR: &str = "APP_DIR";
pub const BUILTIN_DATA_DIR: &str = "DATA_DIR";

/// Builtins holding credentials. Their raw values are taken literally unless the
/// whole field is a single reference, so a password containing `$` survives.
const SECRET_BUILTINS: [&str; 2] = [BUILTIN_PASSWORD, BUILTIN_KEYPASSPHRASE];

/// Per-tunnel builtin values, still unexpanded.
#[derive(Debug, Clone, Default)]
pub struct BuiltinValues {
    values: HashMap<String, String>,
}

impl BuiltinValues {
    pub fn for_tunnel(config: &TunnelConfig, app_dir: &Path, data_dir: &Path) -> Self {
        let (host, _) = split_host_port(config.selected_ssh_host());
        let mut values = HashMap::new();
        values.insert(BUILTIN_HOST.to_string(), host);
        values.insert(
            BUILTIN_REMOTE_HOST.to_string(),
            config.selected_remote_host().to_string(),
        );
        values.insert(BUILTIN_USERNAME.to_string(), config.username.clone());
        values.insert(BUILTIN_PASSWORD.to_string(), config.password.clone());
        values.insert(BUILTIN_KEYFILE.to_string(), config.key_file.clone());
        values.insert(
            BUILTIN_KEYPASSPHRASE.to_string(),
            config.key_passphrase.clone(),
        );
        values.insert(BUILTIN_NAME.to_string(), config.name.clone());
        values.insert(BUILTIN_LOCAL_IP.to_string(), config.local_ip.clone());
        values.insert(
            BUILTIN_LOCAL_PORT.to_string(),
            config.local_port.to_string(),
        );
        values.insert(
            BUILTIN_REMOTE_PORT.to_string(),
            config.remote_port.to_string(),
        );
        values.insert(
            BUILTIN_APP_DIR.to_string(),
            app_dir.to_string_lossy().into_owned(),
        );
        values.insert(
            BUILTIN_DATA_DIR.to_string(),
            data_dir.to_string_lossy().into_owned(),
        );
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'t> {
    Text(&'t str),
    Reference { name: &'t str, raw: &'t str },
}

fn is_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn tokenize(template: &str) -> Vec<Token<'_>> {
    let bytes = template.as_bytes();
    let mut tokens = Vec::new();
    let mut text_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' || i + 1 >= bytes.len() {
            i += 1;
            continue;
        }
        let next = bytes[i + 1];
        if next == b'$' {
            tokens.push(Token::Text(&template[text_start..i + 1]));
            i += 2;
            text_start = i;
        } else if next == b'{' {
            match template[i + 2..].find('}') {
                Some(len) => {
                    tokens.push(Token::Text(&template[text_start..i]));
                    let end = i + 2 + len;
                    tokens.push(Token::Reference {
                        name: &template[i + 2..end],
                        raw: &template[i..=end],
                    });
                    i = end + 1;
                    text_start = i;
                }
                None => i += 1,
            }
        } else if is_name_char(next) {
            tokens.push(Token::Text(&template[text_start..i]));
            let mut end = i + 1;
            while end < bytes.len() && is_name_char(bytes[end]) {
                end += 1;
            }
            tokens.push(Token::Reference {
                name: &template[i + 1..end],
                raw: &template[i..end],
            });
            i = end;
            text_start = i;
        } else {
            i += 1;
        }
    }
    tokens.push(Token::Text(&template[text_start..]));
    tokens.retain(|t| !matches!(t, Token::Text("")));
    tokens
}

/// Names referenced by `template`, in order of appearance.
pub fn references(template: &str) -> Vec<String> {
    tokenize(template)
        .into_iter()
        .filter_map(|t| match t {
            Token::Reference { name, .. } => Some(name.to_string()),
            Token::Text(_) => None,
        })
        .collect()
}

/// The single reference `field` consists of, if any.
fn sole_reference(field: &str) -> Option<&str> {
    match tokenize(field.trim()).as_slice() {
        [Token::Reference { name, .. }] => Some(*name),
        _ => None,
    }
}

/// Expands templates against the five variable namespaces.
#[derive(Default)]
pub struct VariableResolver<'a> {
    builtins: BuiltinValues,
    credentials: Option<&'a dyn CredentialStore>,
    variables: Option<&'a VariableSet>,
    edit_pane: HashMap<String, String>,
}

impl<'a> VariableResolver<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins(mut self, builtins: BuiltinValues) -> Self {
        self.builtins = builtins;
        self
    }

    pub fn with_credentials(mut self, credentials: &'a dyn CredentialStore) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_variables(mut self, variables: &'a VariableSet) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Ephemeral values from an in-progress edit; they shadow every other namespace.
    pub fn with_edit_pane(mut self, values: HashMap<String, String>) -> Self {
        self.edit_pane = values;
        self
    }

    /// Find the raw value behind `name` and the namespace it came from.
    pub fn lookup(&self, name: &str) -> Option<(VariableKind, &str)> {
        if let Some(v) = self.edit_pane.get(name) {
            return Some((VariableKind::EditPane, v));
        }
        if let Some(v) = self.builtins.get(name) {
            return Some((VariableKind::Builtin, v));
        }
        if let Some(entry) = self
            .credentials
            .and_then(|c| c.find_by_description(name))
        {
            return Some((VariableKind::Password, &entry.password));
        }
        let variables = self.variables?;
        variables
            .get(name, VariableKind::Executable)
            .or_else(|| variables.get(name, VariableKind::UserDefined))
            .map(|v| (v.kind, v.value.as_str()))
    }

    /// Expand every reference in `template`.
    pub fn resolve(&self, template: &str) -> Result<String, VariableError> {
        let mut stack = Vec::new();
        let mut cache = HashMap::new();
        self.expand(template, &mut stack, &mut cache)
    }

    /// Expand a credential field: only a field that is exactly one reference is
    /// expanded, anything else is returned as typed.
    pub fn resolve_secret(&self, field: &str) -> Result<String, VariableError> {
        match sole_reference(field) {
            Some(_) => self.resolve(field.trim()),
            None => Ok(field.to_string()),
        }
    }

    /// Expand `template`, then split it into arguments with shell-like quoting.
    pub fn resolve_args(&self, template: &str) -> Result<Vec<String>, VariableError> {
        split_args(&self.resolve(template)?)
    }

    fn expand(
        &self,
        text: &str,
        stack: &mut Vec<String>,
        cache: &mut HashMap<String, String>,
    ) -> Result<String, VariableError> {
        let mut out = String::with_capacity(text.len());
        for token in tokenize(text) {
            match token {
                Token::Text(t) => out.push_str(t),
                Token::Reference { name, raw } => {
                    if let Some(done) = cache.get(name) {
                        out.push_str(done);
                        continue;
                    }
                    let Some((kind, value)) = self.lookup(name) else {
                        out.push_str(raw);
                        continue;
                    };
                    if stack.iter().any(|n| n == name) {
                        let mut chain = stack.clone();
                        chain.push(name.to_string());
                        return Err(VariableError::Cycle(chain));
                    }

                    let literal = kind == VariableKind::Password
                        || (kind == VariableKind::Builtin
                            && SECRET_BUILTINS.contains(&name)
                            && sole_reference(value).is_none());
                    let expanded = if literal {
                        value.to_string()
                    } else {
                        stack.push(name.to_string());
                        let expanded = self.expand(value, stack, cache)?;
                        stack.pop();
                        expanded
                    };
                    cache.insert(name.to_string(), expanded.clone());
                    out.push_str(&expanded);
                }
            }
        }
        Ok(out)
    }
}

/// Split a command line into words. Single and double quotes group words; a
/// backslash escapes a quote, a backslash or whitespace and is literal otherwise
/// so Windows paths pass through untouched.
pub fn split_args(input: &str) -> Result<Vec<String>, VariableError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' if !in_single => match chars.peek() {
                Some(&next) if next == '"' || next == '\'' || next == '\\' || next.is_whitespace() => {
                    current.push(next);
                    chars.next();
                    in_word = true;
                }
                _ => {
                    current.push('\\');
                    in_word = true;
                }
            },
            '\'' if !in_double => {
                in_single = !in_single;
                in_word = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                in_word = true;
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if in_single || in_double {
        return Err(VariableError::UnclosedQuote(input.to_string()));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}
