use blocksmith_agent::UserPrompt;
use std::io::{self, BufRead, IsTerminal, Write};

/// Asks on stderr and reads the answer from stdin.
pub(crate) struct ConsolePrompt;

impl UserPrompt for ConsolePrompt {
    fn confirm(&self, question: &str) -> bool {
        eprint!("{question} [y/N] ");
        let _ = io::stderr().flush();
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        is_yes(&answer)
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Prompt for this invocation: `--yes` wins, otherwise ask only when stdin
/// is a terminal that is not also carrying the input.
pub(crate) fn user_prompt(yes: bool, stdin_busy: bool) -> Box<dyn UserPrompt> {
    if yes {
        Box::new(blocksmith_agent::AutoConfirm)
    } else if !stdin_busy && io::stdin().is_terminal() {
        Box::new(ConsolePrompt)
    } else {
        Box::new(blocksmith_agent::AutoDecline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_only_explicit_yes() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes("\n"));
        assert!(!is_yes("no"));
        assert!(user_prompt(true, true).confirm("Add as editable a.txt?"));
    }
}
