//! SEARCH/REPLACE edit blocks: parsing model output, locating search text and
//! computing the edited file content. Nothing in this crate touches the disk.

pub mod applier;
pub mod matcher;
pub mod parser;

pub use applier::{AppliedEdit, ApplyFailure, ApplyOutcome, EditKind, apply_edit_block};
pub use matcher::{MatchLocation, MatchResult, MatchStrategy, find_match};
pub use parser::{ParseIssue, ParseIssueKind, ParseOutcome, parse_edit_blocks};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One proposed mutation of a single file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditBlock {
    pub filename: String,
    pub search: String,
    pub replace: String,
}

impl EditBlock {
    pub fn creates_file(&self) -> bool {
        self.search.trim().is_empty()
    }

    /// At most `max_lines` leading lines of the search text, for error reports.
    pub fn search_excerpt(&self, max_lines: usize) -> String {
        let total = self.search.lines().count();
        let mut excerpt: String = self
            .search
            .lines()
            .take(max_lines)
            .map(|line| format!("{line}\n"))
            .collect();
        if total > max_lines {
            excerpt.push_str(&format!("... ({} more lines)\n", total - max_lines));
        }
        excerpt
    }
}

/// Record of a file write produced by an applied block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChange {
    pub path: String,
    pub kind: EditKind,
    pub before_sha256: Option<String>,
    pub after_sha256: String,
    pub ambiguous: bool,
}

impl FileChange {
    pub fn new(path: &str, before: Option<&str>, edit: &AppliedEdit) -> Self {
        Self {
            path: path.to_string(),
            kind: edit.kind,
            before_sha256: before.map(|text| sha256_hex(text.as_bytes())),
            after_sha256: sha256_hex(edit.new_content.as_bytes()),
            ambiguous: edit.ambiguous,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
