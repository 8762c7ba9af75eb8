use crate::scanner::PromptKind;
use uuid::Uuid;

/// A question the connector cannot answer from stored credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub node: Uuid,
    pub node_name: String,
    pub kind: PromptKind,
    /// The client's prompt line as printed.
    pub prompt: String,
}

/// Interactive answers and error display. Called synchronously from the
/// connector loop.
pub trait Prompter: Send {
    /// `None` cancels the prompt, which tears the connection down.
    fn ask(&mut self, request: &PromptRequest) -> Option<String>;

    fn show_error(&mut self, title: &str, message: &str);
}

/// Answers nothing; errors only go to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessPrompter;

impl Prompter for HeadlessPrompter {
    fn ask(&mut self, request: &PromptRequest) -> Option<String> {
        tracing::debug!(
            "No interactive answer for {} prompt of '{}'",
            request.kind.label(),
            request.node_name
        );
        None
    }

    fn show_error(&mut self, title: &str, message: &str) {
        tracing::error!("{}: {}", title, message);
    }
}
