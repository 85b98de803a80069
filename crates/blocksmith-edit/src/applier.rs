use crate::EditBlock;
use crate::matcher::{MatchResult, MatchStrategy, find_match};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EditKind {
    Created,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedEdit {
    pub new_content: String,
    pub kind: EditKind,
    /// `None` for created files, which are not matched.
    pub strategy: Option<MatchStrategy>,
    pub ambiguous: bool,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ApplyFailure {
    #[error("SEARCH text did not match the file content")]
    NotFound,
    #[error("file already exists; an empty SEARCH section can only create new files")]
    FileExists,
    #[error("i/o error: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(AppliedEdit),
    Failed(ApplyFailure),
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Compute the file content that results from applying `block` to `current`
/// (`None` when the file does not exist). Pure: persisting the result is the
/// caller's job.
///
/// An empty SEARCH section creates the file. A file that exists but holds only
/// whitespace counts as absent, so a placeholder can be filled; any other
/// existing file fails with [`ApplyFailure::FileExists`].
pub fn apply_edit_block(block: &EditBlock, current: Option<&str>) -> ApplyOutcome {
    let creating = block.creates_file();
    let existing = current.filter(|content| !content.trim().is_empty());

    match (existing, creating) {
        (None, true) => ApplyOutcome::Applied(AppliedEdit {
            new_content: block.replace.clone(),
            kind: EditKind::Created,
            strategy: None,
            ambiguous: false,
        }),
        (Some(_), true) => ApplyOutcome::Failed(ApplyFailure::FileExists),
        (None, false) => ApplyOutcome::Failed(ApplyFailure::NotFound),
        (Some(content), false) => splice(content, block),
    }
}

fn splice(content: &str, block: &EditBlock) -> ApplyOutcome {
    let result = find_match(content, &block.search);
    let Some(loc) = result.location() else {
        return ApplyOutcome::Failed(ApplyFailure::NotFound);
    };
    let mut new_content =
        String::with_capacity(content.len() - (loc.end - loc.start) + block.replace.len());
    new_content.push_str(&content[..loc.start]);
    new_content.push_str(&block.replace);
    new_content.push_str(&content[loc.end..]);
    ApplyOutcome::Applied(AppliedEdit {
        new_content,
        kind: EditKind::Modified,
        strategy: Some(loc.strategy),
        ambiguous: result.is_ambiguous(),
    })
}
