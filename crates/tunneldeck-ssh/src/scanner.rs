//! Splits client output into lines and decides how to answer each one.

use once_cell::sync::Lazy;
use regex::Regex;
use tunneldeck_core::PromptCounters;

static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("valid ANSI escape pattern")
});

/// Line terminator written after every answer.
pub const ANSWER_EOL: &str = "\r\n";

/// Remove carriage returns and terminal escape sequences.
pub fn clean_line(raw: &str) -> String {
    ANSI_ESCAPE.replace_all(raw, "").replace('\r', "")
}

/// Accumulates output chunks and yields complete lines.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: String,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the cleaned, non-empty lines it completes.
    ///
    /// A trailing partial line that looks like a prompt is returned too,
    /// since clients wait for the answer without printing a newline.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let raw: String = self.pending.drain(..=pos).collect();
            push_clean(&mut lines, &raw);
        }
        if looks_like_prompt(&clean_line(&self.pending)) {
            let raw = std::mem::take(&mut self.pending);
            push_clean(&mut lines, &raw);
        }
        lines
    }

    /// Whatever is left once the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        let line = clean_line(&std::mem::take(&mut self.pending));
        let line = line.trim_end();
        (!line.is_empty()).then(|| line.to_string())
    }
}

fn push_clean(lines: &mut Vec<String>, raw: &str) {
    let line = clean_line(raw);
    let line = line.trim_end();
    if !line.is_empty() {
        lines.push(line.to_string());
    }
}

fn looks_like_prompt(partial: &str) -> bool {
    matches!(partial.trim_end().chars().last(), Some(':' | '?' | ')'))
}

/// Prompts answered from stored credentials or by asking the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Username,
    Password,
    KeyPassphrase,
    ChallengeResponse,
    VerificationCode,
}

impl PromptKind {
    pub fn is_secret(self) -> bool {
        !matches!(self, PromptKind::Username)
    }

    pub fn label(self) -> &'static str {
        match self {
            PromptKind::Username => "Username",
            PromptKind::Password => "Password",
            PromptKind::KeyPassphrase => "Key passphrase",
            PromptKind::ChallengeResponse => "Challenge response",
            PromptKind::VerificationCode => "Verification code",
        }
    }
}

/// Result of matching one line against the rule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    Prompt(PromptKind),
    FixedAnswer(&'static str),
    Connected,
    Kill,
    Ignore,
}

/// Match a cleaned line against the rules, first hit wins.
pub fn classify_line(line: &str) -> LineClass {
    let lower = line.trim().to_lowercase();
    let ends_colon = lower.ends_with(':');

    if lower.contains("login as:") {
        LineClass::Prompt(PromptKind::Username)
    } else if lower.contains("password") && ends_colon {
        LineClass::Prompt(PromptKind::Password)
    } else if lower.contains("passphrase for key") {
        LineClass::Prompt(PromptKind::KeyPassphrase)
    } else if lower.contains("store key in cache") {
        LineClass::FixedAnswer("n")
    } else if lower.contains("update cached key") {
        LineClass::FixedAnswer("y")
    } else if lower.contains("continue connecting (yes/no") {
        LineClass::FixedAnswer("yes")
    } else if lower.contains("challenge") && lower.contains("response") && ends_colon {
        LineClass::Prompt(PromptKind::ChallengeResponse)
    } else if lower.contains("verification code:") || lower.contains("enter personal code") {
        LineClass::Prompt(PromptKind::VerificationCode)
    } else if lower.contains("access granted")
        || lower.contains("authentication succeeded")
        || lower.contains("authenticated to ")
    {
        LineClass::Connected
    } else if lower.contains("address already in use") || lower.contains("privatekey failed") {
        LineClass::Kill
    } else {
        LineClass::Ignore
    }
}

/// Stored secrets available to answer prompts automatically.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoredSecrets<'a> {
    pub password: Option<&'a str>,
    pub key_passphrase: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanAction {
    /// Write `text` followed by CRLF.
    Send { text: String, secret: bool },
    Ask(PromptKind),
    Connected,
    Kill,
    Ignore,
}

/// Decide the action for a line, updating the per-prompt counters.
///
/// A stored secret is sent at most once per spawn; any further prompt of
/// the same kind goes to the user.
pub fn decide(class: LineClass, counters: &mut PromptCounters, secrets: StoredSecrets<'_>) -> ScanAction {
    match class {
        LineClass::Prompt(PromptKind::Password) => {
            once_then_ask(&mut counters.password, secrets.password, PromptKind::Password)
        }
        LineClass::Prompt(PromptKind::KeyPassphrase) => once_then_ask(
            &mut counters.key_passphrase,
            secrets.key_passphrase,
            PromptKind::KeyPassphrase,
        ),
        LineClass::Prompt(PromptKind::ChallengeResponse) => {
            counters.challenge_response += 1;
            ScanAction::Ask(PromptKind::ChallengeResponse)
        }
        LineClass::Prompt(kind) => ScanAction::Ask(kind),
        LineClass::FixedAnswer(answer) => ScanAction::Send {
            text: answer.to_string(),
            secret: false,
        },
        LineClass::Connected => ScanAction::Connected,
        LineClass::Kill => ScanAction::Kill,
        LineClass::Ignore => ScanAction::Ignore,
    }
}

fn once_then_ask(counter: &mut u32, stored: Option<&str>, kind: PromptKind) -> ScanAction {
    let first = *counter == 0;
    *counter += 1;
    match stored.filter(|s| !s.is_empty()) {
        Some(secret) if first => ScanAction::Send {
            text: secret.to_string(),
            secret: true,
        },
        _ => ScanAction::Ask(kind),
    }
}
