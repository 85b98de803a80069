use crate::round::{RoundResult, promotion_question};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectionDecision {
    pub should_continue: bool,
    /// Reflection prompt when continuing, failure report when giving up,
    /// empty when the round was clean.
    pub message: String,
}

/// Decides whether a round's failures are worth another model turn.
#[derive(Debug, Clone)]
pub struct ReflectionManager {
    max_reflections: u32,
    snippet_lines: usize,
    attempts: u32,
}

impl ReflectionManager {
    pub fn new(max_reflections: u32, snippet_lines: usize) -> Self {
        Self {
            max_reflections,
            snippet_lines,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_reflections(&self) -> u32 {
        self.max_reflections
    }

    pub fn evaluate(&mut self, round: &RoundResult) -> ReflectionDecision {
        if round.is_clean() {
            return ReflectionDecision {
                should_continue: false,
                message: String::new(),
            };
        }
        let message = self.compose(round);
        if self.attempts >= self.max_reflections {
            return ReflectionDecision {
                should_continue: false,
                message,
            };
        }
        self.attempts += 1;
        ReflectionDecision {
            should_continue: true,
            message,
        }
    }

    fn compose(&self, round: &RoundResult) -> String {
        let mut out = String::new();
        if !round.parse_errors.is_empty() {
            out.push_str("# Malformed edit blocks\n\n");
            for issue in &round.parse_errors {
                out.push_str(&format!("- {issue}\n"));
            }
            out.push_str(
                "\nThese regions were not applied. Resend them as well-formed *SEARCH/REPLACE* blocks.\n\n",
            );
        }
        if !round.failed.is_empty() {
            out.push_str(&format!(
                "# {} SEARCH/REPLACE block{} failed to apply\n\n",
                round.failed.len(),
                if round.failed.len() == 1 { "" } else { "s" }
            ));
            for failure in &round.failed {
                out.push_str(&failure.to_feedback(self.snippet_lines));
                out.push('\n');
            }
            out.push_str(
                "The SEARCH section must exactly match existing lines of the file, including whitespace and comments.\n\
                 An empty SEARCH section only creates files that do not exist yet.\n\n",
            );
        }
        if !round.declined_files.is_empty() {
            out.push_str("# Edits not permitted\n\n");
            for path in &round.declined_files {
                out.push_str(&format!(
                    "- {path}: the user answered no to \"{}\"\n",
                    promotion_question(path)
                ));
            }
            out.push_str("\nDo not edit these files; find another way or explain what is needed.\n\n");
        }
        if !round.applied.is_empty() {
            out.push_str(&format!(
                "The other {} block{} applied successfully. Do not resend them; send fixed versions of the failed blocks only.\n",
                round.applied.len(),
                if round.applied.len() == 1 { "" } else { "s" }
            ));
        } else {
            out.push_str("Send fixed versions of the failed blocks.\n");
        }
        out
    }
}
