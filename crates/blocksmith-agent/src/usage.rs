use blocksmith_core::{ChatMessage, TokenUsage};

/// Line count of a request, the unit `approximate_tokens` scales from.
pub fn count_lines(messages: &[ChatMessage]) -> u64 {
    messages
        .iter()
        .map(|msg| msg.content().lines().count() as u64)
        .sum()
}

/// Running totals of provider-reported usage for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTracker {
    input_tokens: u64,
    output_tokens: u64,
    input_lines: u64,
}

impl UsageTracker {
    /// Rounds without reported usage are not counted, so the lines/tokens ratio
    /// stays consistent.
    pub fn record(&mut self, request_lines: u64, usage: Option<TokenUsage>) {
        let Some(usage) = usage else {
            return;
        };
        self.input_tokens += usage.prompt_tokens;
        self.output_tokens += usage.completion_tokens;
        self.input_lines += request_lines;
    }

    pub fn totals(&self) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.input_tokens,
            completion_tokens: self.output_tokens,
        }
    }

    /// Estimate the prompt tokens of `lines` lines from the observed ratio.
    /// `None` until a round with usage has been recorded.
    pub fn approximate_tokens(&self, lines: u64) -> Option<u64> {
        if self.input_lines == 0 {
            return None;
        }
        let per_line = self.input_tokens as f64 / self.input_lines as f64;
        Some((per_line * lines as f64).round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_requires_observed_usage() {
        let mut tracker = UsageTracker::default();
        assert_eq!(tracker.approximate_tokens(100), None);
        tracker.record(40, None);
        assert_eq!(tracker.approximate_tokens(100), None);

        tracker.record(
            40,
            Some(TokenUsage {
                prompt_tokens: 300,
                completion_tokens: 20,
            }),
        );
        tracker.record(
            60,
            Some(TokenUsage {
                prompt_tokens: 500,
                completion_tokens: 30,
            }),
        );
        assert_eq!(tracker.approximate_tokens(10), Some(80));
        assert_eq!(tracker.approximate_tokens(0), Some(0));
        assert_eq!(
            tracker.totals(),
            TokenUsage {
                prompt_tokens: 800,
                completion_tokens: 50,
            }
        );
    }

    #[test]
    fn counts_lines_across_messages() {
        let messages = [
            ChatMessage::system("a\nb\n"),
            ChatMessage::user("c"),
            ChatMessage::assistant(""),
        ];
        assert_eq!(count_lines(&messages), 3);
    }
}
