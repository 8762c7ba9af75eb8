use std::io::{self, BufRead, Write};
use tunneldeck_ssh::{PromptRequest, Prompter};

/// Answers client prompts from the controlling terminal.
///
/// End of input cancels the prompt.
#[derive(Debug, Default)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn ask(&mut self, request: &PromptRequest) -> Option<String> {
        let mut stderr = io::stderr();
        let _ = write!(stderr, "[{}] {} ", request.node_name, request.prompt);
        let _ = stderr.flush();

        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
        }
    }

    fn show_error(&mut self, title: &str, message: &str) {
        eprintln!("{}: {}", title, message);
    }
}
