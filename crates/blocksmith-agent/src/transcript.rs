use anyhow::Result;
use blocksmith_core::{ChatMessage, TokenUsage, runtime_dir};
use chrono::{Local, SecondsFormat};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Markdown log of every request and response at `.blocksmith/conversations.md`.
#[derive(Debug, Clone)]
pub struct Transcript {
    path: Option<PathBuf>,
}

impl Transcript {
    pub fn new(workspace: &Path) -> Self {
        Self {
            path: Some(runtime_dir(workspace).join("conversations.md")),
        }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Logs every outgoing message as a `<role>: <text>` paragraph.
    pub fn record_request(&self, messages: &[ChatMessage]) -> Result<()> {
        let body = messages
            .iter()
            .map(|msg| format!("{}: {}\n", msg.role(), msg.content()))
            .collect::<Vec<_>>()
            .join("\n");
        self.append(&format!("# Request {}\n\n{body}\n", timestamp()))
    }

    pub fn record_response(&self, text: &str, usage: Option<TokenUsage>) -> Result<()> {
        let header = match usage {
            Some(usage) => format!(
                "# Response {} tokens at {}",
                usage.completion_tokens,
                timestamp()
            ),
            None => format!("# Response at {}", timestamp()),
        };
        self.append(&format!("\n{header}\n\n{text}\n"))
    }

    pub fn record_error(&self, err: &str) -> Result<()> {
        self.append(&format!("\n# Response {}\n\nError: {err}\n", timestamp()))
    }

    fn append(&self, entry: &str) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = OpenOptions::new().create(true).append(true).open(path)?;
        f.write_all(entry.as_bytes())?;
        Ok(())
    }
}

fn timestamp() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}
