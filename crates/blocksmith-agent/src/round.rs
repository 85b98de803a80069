use crate::workspace::FileOracle;
use anyhow::{Context, Result};
use blocksmith_edit::{
    ApplyFailure, ApplyOutcome, EditBlock, FileChange, ParseIssue, ParseOutcome,
    apply_edit_block, parse_edit_blocks,
};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

/// Asks the person driving the session a yes/no question.
pub trait UserPrompt {
    fn confirm(&self, question: &str) -> bool;
}

/// Answers yes to everything (`--yes`).
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoConfirm;

impl UserPrompt for AutoConfirm {
    fn confirm(&self, _question: &str) -> bool {
        true
    }
}

/// Answers no to everything; the choice when nobody is there to ask.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoDecline;

impl UserPrompt for AutoDecline {
    fn confirm(&self, _question: &str) -> bool {
        false
    }
}

pub fn promotion_question(path: &str) -> String {
    format!("Add as editable {path}?")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockFailure {
    pub block: EditBlock,
    pub failure: ApplyFailure,
}

impl BlockFailure {
    pub fn to_feedback(&self, snippet_lines: usize) -> String {
        let mut out = format!("## {}\nReason: {}\n", self.block.filename, self.failure);
        if !self.block.search.is_empty() {
            out.push_str("SEARCH text:\n```\n");
            out.push_str(&self.block.search_excerpt(snippet_lines));
            out.push_str("```\n");
        }
        out
    }
}

/// Everything that happened to one response's blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoundResult {
    pub parse_errors: Vec<ParseIssue>,
    pub applied: Vec<FileChange>,
    /// The blocks behind `applied`, index for index.
    #[serde(skip)]
    pub applied_blocks: Vec<EditBlock>,
    pub failed: Vec<BlockFailure>,
    /// Files the user refused to make editable; their blocks were not applied.
    pub declined_files: Vec<String>,
    pub declined_blocks: usize,
}

impl RoundResult {
    pub fn is_clean(&self) -> bool {
        self.parse_errors.is_empty() && self.failed.is_empty() && self.declined_files.is_empty()
    }

    pub fn block_count(&self) -> usize {
        self.applied.len() + self.failed.len() + self.declined_blocks
    }
}

/// Apply parsed blocks in order against per-file working copies.
///
/// Non-editable targets are offered for promotion once per distinct filename.
/// Each successful block is written before the next one is matched, so later
/// blocks for the same file see earlier edits. Per-block I/O problems become
/// [`ApplyFailure::Io`]; only an unusable workspace is an `Err`.
pub fn apply_blocks(
    files: &mut dyn FileOracle,
    prompt: &dyn UserPrompt,
    parsed: ParseOutcome,
) -> Result<RoundResult> {
    files
        .check_available()
        .context("workspace storage is unavailable")?;

    let mut result = RoundResult {
        parse_errors: parsed.errors,
        ..RoundResult::default()
    };

    let mut declined: BTreeSet<String> = BTreeSet::new();
    let mut unpromotable: BTreeSet<String> = BTreeSet::new();
    let mut asked: BTreeSet<String> = BTreeSet::new();
    for block in &parsed.blocks {
        let name = &block.filename;
        if files.is_editable(name) || !asked.insert(name.clone()) {
            continue;
        }
        if !prompt.confirm(&promotion_question(name)) {
            declined.insert(name.clone());
        } else if !files.request_promote(name) {
            unpromotable.insert(name.clone());
        }
    }

    let mut working: HashMap<String, Option<String>> = HashMap::new();
    for block in parsed.blocks {
        if declined.contains(&block.filename) {
            result.declined_blocks += 1;
            continue;
        }
        if unpromotable.contains(&block.filename) {
            let failure = ApplyFailure::Io(format!("{} cannot be made editable", block.filename));
            result.failed.push(BlockFailure { block, failure });
            continue;
        }

        let current = match working.get(&block.filename) {
            Some(content) => content.clone(),
            None => match files.read_content(&block.filename) {
                Ok(content) => {
                    working.insert(block.filename.clone(), content.clone());
                    content
                }
                Err(err) => {
                    let failure = ApplyFailure::Io(err.to_string());
                    result.failed.push(BlockFailure { block, failure });
                    continue;
                }
            },
        };

        match apply_edit_block(&block, current.as_deref()) {
            ApplyOutcome::Applied(edit) => {
                if let Err(err) = files.write_content(&block.filename, &edit.new_content) {
                    let failure = ApplyFailure::Io(err.to_string());
                    result.failed.push(BlockFailure { block, failure });
                    continue;
                }
                result
                    .applied
                    .push(FileChange::new(&block.filename, current.as_deref(), &edit));
                working.insert(block.filename.clone(), Some(edit.new_content));
                result.applied_blocks.push(block);
            }
            ApplyOutcome::Failed(failure) => {
                result.failed.push(BlockFailure { block, failure });
            }
        }
    }
    result.declined_files = declined.into_iter().collect();
    Ok(result)
}

/// Parse a saved model response and apply it, without any model call.
pub fn apply_response(
    files: &mut dyn FileOracle,
    prompt: &dyn UserPrompt,
    response: &str,
) -> Result<RoundResult> {
    apply_blocks(files, prompt, parse_edit_blocks(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceFiles;
    use blocksmith_edit::EditKind;
    use std::cell::RefCell;
    use std::fs;

    struct Recording {
        answer: bool,
        asked: RefCell<Vec<String>>,
    }

    impl UserPrompt for Recording {
        fn confirm(&self, question: &str) -> bool {
            self.asked.borrow_mut().push(question.to_string());
            self.answer
        }
    }

    fn block(filename: &str, search: &str, replace: &str) -> String {
        format!("```\n{filename}\n<<<<<<< SEARCH\n{search}=======\n{replace}>>>>>>> REPLACE\n```\n")
    }

    #[test]
    fn same_file_blocks_see_earlier_edits() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.txt"), "one\ntwo\n").expect("write");
        let mut files = WorkspaceFiles::new(dir.path()).expect("workspace");
        files.add_editable("a.txt").expect("editable");

        let response = format!(
            "{}{}",
            block("a.txt", "one\n", "uno\n"),
            block("a.txt", "uno\ntwo\n", "uno\ndos\n")
        );
        let result = apply_response(&mut files, &AutoDecline, &response).expect("round");
        assert!(result.is_clean());
        assert_eq!(result.applied.len(), 2);
        assert_eq!(
            fs::read_to_string(dir.path().join("a.txt")).expect("read"),
            "uno\ndos\n"
        );
        assert_eq!(result.applied[1].before_sha256, Some(result.applied[0].after_sha256.clone()));
    }

    #[test]
    fn failed_block_does_not_stop_siblings() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.txt"), "alpha\n").expect("write");
        fs::write(dir.path().join("b.txt"), "beta\n").expect("write");
        let mut files = WorkspaceFiles::new(dir.path()).expect("workspace");
        files.add_editable("a.txt").expect("editable");
        files.add_editable("b.txt").expect("editable");

        let response = format!(
            "{}{}",
            block("a.txt", "missing\n", "x\n"),
            block("b.txt", "beta\n", "BETA\n")
        );
        let result = apply_response(&mut files, &AutoDecline, &response).expect("round");
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].failure, ApplyFailure::NotFound);
        assert_eq!(result.applied.len(), 1);
        assert_eq!(result.applied[0].path, "b.txt");
        assert_eq!(
            fs::read_to_string(dir.path().join("a.txt")).expect("read"),
            "alpha\n"
        );
    }

    #[test]
    fn promotion_is_asked_once_per_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut files = WorkspaceFiles::new(dir.path()).expect("workspace");
        let prompt = Recording {
            answer: true,
            asked: RefCell::new(Vec::new()),
        };
        let response = format!(
            "{}{}",
            block("new.txt", "", "first\n"),
            block("new.txt", "first\n", "second\n")
        );
        let result = apply_response(&mut files, &prompt, &response).expect("round");
        assert_eq!(*prompt.asked.borrow(), vec!["Add as editable new.txt?".to_string()]);
        assert_eq!(result.applied.len(), 2);
        assert_eq!(result.applied[0].kind, EditKind::Created);
        assert_eq!(
            fs::read_to_string(dir.path().join("new.txt")).expect("read"),
            "second\n"
        );
    }

    #[test]
    fn declined_promotion_skips_blocks() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("ro.txt"), "keep\n").expect("write");
        let mut files = WorkspaceFiles::new(dir.path()).expect("workspace");
        files.add_read_only("ro.txt").expect("read only");

        let response = block("ro.txt", "keep\n", "changed\n");
        let result = apply_response(&mut files, &AutoDecline, &response).expect("round");
        assert!(!result.is_clean());
        assert_eq!(result.declined_files, vec!["ro.txt".to_string()]);
        assert_eq!(result.declined_blocks, 1);
        assert_eq!(result.block_count(), 1);
        assert_eq!(
            fs::read_to_string(dir.path().join("ro.txt")).expect("read"),
            "keep\n"
        );
    }

    #[test]
    fn unsafe_paths_fail_as_io() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut files = WorkspaceFiles::new(dir.path()).expect("workspace");
        let response = format!(
            "{}{}",
            block("../escape.txt", "", "x\n"),
            block(".git/config", "", "x\n")
        );
        let result = apply_response(&mut files, &AutoConfirm, &response).expect("round");
        assert_eq!(result.failed.len(), 2);
        assert!(
            result
                .failed
                .iter()
                .all(|f| matches!(f.failure, ApplyFailure::Io(_)))
        );
        assert!(!dir.path().join(".git").exists());
    }

    #[test]
    fn unsafe_path_does_not_stop_a_safe_sibling() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("ok.txt"), "before\n").expect("write");
        let mut files = WorkspaceFiles::new(dir.path()).expect("workspace");
        files.add_editable("ok.txt").expect("editable");
        let response = format!(
            "{}{}",
            block("../escape.txt", "", "x\n"),
            block("ok.txt", "before\n", "after\n")
        );
        let result = apply_response(&mut files, &AutoConfirm, &response).expect("round");
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].block.filename, "../escape.txt");
        assert!(matches!(result.failed[0].failure, ApplyFailure::Io(_)));
        assert_eq!(result.applied.len(), 1);
        assert_eq!(result.applied_blocks[0].filename, "ok.txt");
        assert_eq!(
            fs::read_to_string(dir.path().join("ok.txt")).expect("read"),
            "after\n"
        );
        assert!(!dir.path().parent().is_some_and(|p| p.join("escape.txt").exists()));
    }

    #[test]
    fn missing_workspace_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("ws");
        fs::create_dir(&root).expect("mkdir");
        let mut files = WorkspaceFiles::new(&root).expect("workspace");
        fs::remove_dir(&root).expect("rmdir");
        assert!(apply_response(&mut files, &AutoConfirm, &block("a.txt", "", "x\n")).is_err());
    }

    #[test]
    fn feedback_quotes_search_excerpt() {
        let failure = BlockFailure {
            block: EditBlock {
                filename: "src/lib.rs".to_string(),
                search: "a\nb\nc\n".to_string(),
                replace: String::new(),
            },
            failure: ApplyFailure::NotFound,
        };
        let text = failure.to_feedback(2);
        assert!(text.starts_with("## src/lib.rs\nReason: SEARCH text did not match"));
        assert!(text.contains("```\na\nb\n... (1 more lines)\n```\n"));
    }
}
