use anyhow::Result;
use blocksmith_core::{ChatMessage, runtime_dir};
use std::fs;
use std::path::{Path, PathBuf};

/// Committed conversation shared across sessions.
pub trait HistorySink {
    fn messages(&self) -> Vec<ChatMessage>;

    /// Append a finished session's messages.
    fn commit(&mut self, messages: &[ChatMessage]) -> Result<()>;
}

/// In-memory history, optionally mirrored to `.blocksmith/history.json`.
#[derive(Debug, Default)]
pub struct ConversationHistory {
    messages: Vec<ChatMessage>,
    path: Option<PathBuf>,
}

impl ConversationHistory {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn history_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("history.json")
    }

    /// Load the persisted history of `workspace`, starting empty when none exists.
    pub fn load(workspace: &Path) -> Result<Self> {
        let path = Self::history_path(workspace);
        let messages = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            Vec::new()
        };
        Ok(Self {
            messages,
            path: Some(path),
        })
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(&self.messages)?)?;
        Ok(())
    }
}

impl HistorySink for ConversationHistory {
    fn messages(&self) -> Vec<ChatMessage> {
        self.messages.clone()
    }

    fn commit(&mut self, messages: &[ChatMessage]) -> Result<()> {
        self.messages.extend_from_slice(messages);
        self.persist()
    }
}
