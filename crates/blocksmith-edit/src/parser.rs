use crate::EditBlock;
use serde::Serialize;

pub const SEARCH_MARKER: &str = "<<<<<<< SEARCH";
pub const DIVIDER_MARKER: &str = "=======";
pub const REPLACE_MARKER: &str = ">>>>>>> REPLACE";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ParseIssueKind {
    #[error("edit block has no filename on the line after the opening fence")]
    MissingFilename,
    #[error(
        "filename `{0}` must appear alone on its line, without quotes, backticks or other markup"
    )]
    DecoratedFilename(String),
    #[error("SEARCH section is not followed by a `=======` divider")]
    MissingDivider,
    #[error("REPLACE section is not terminated by `>>>>>>> REPLACE`")]
    MissingReplace,
    #[error("edit block is missing its closing fence")]
    UnclosedFence,
    #[error("`<<<<<<< SEARCH` appears outside a fenced edit block")]
    StraySearch,
}

/// A malformed region of a response. `line` is 1-based and points at the
/// line where the problem was detected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseIssue {
    pub line: usize,
    pub kind: ParseIssueKind,
}

impl std::fmt::Display for ParseIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.kind)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParseOutcome {
    pub blocks: Vec<EditBlock>,
    pub errors: Vec<ParseIssue>,
}

impl ParseOutcome {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Extract every SEARCH/REPLACE block from a model response.
///
/// Never fails: malformed fences are reported in [`ParseOutcome::errors`] and
/// scanning resumes at the next recognizable block header. Fenced regions that
/// are not edit blocks (ordinary code samples) are skipped.
pub fn parse_edit_blocks(text: &str) -> ParseOutcome {
    let lines: Vec<&str> = text.lines().collect();
    let mut out = ParseOutcome::default();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if is_fence(line) {
            if lines.get(i + 1).is_some_and(|next| is_search(next)) {
                out.errors.push(ParseIssue {
                    line: i + 2,
                    kind: ParseIssueKind::MissingFilename,
                });
                i = parse_fenced(&lines, i + 1, None, &mut out);
                continue;
            }
            if is_block_header(&lines, i) {
                let filename = match check_filename(lines[i + 1]) {
                    Ok(name) => Some(name),
                    Err(kind) => {
                        out.errors.push(ParseIssue { line: i + 2, kind });
                        None
                    }
                };
                i = parse_fenced(&lines, i + 2, filename, &mut out);
                continue;
            }
            i = skip_plain_fence(&lines, i);
            continue;
        }
        if is_search(line) {
            out.errors.push(ParseIssue {
                line: i + 1,
                kind: ParseIssueKind::StraySearch,
            });
            i = skip_stray_block(&lines, i);
            continue;
        }
        i += 1;
    }
    out
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Search,
    Replace,
    Between,
}

/// Parses one fence starting at the SEARCH marker at `start`. Blocks are only
/// committed once the closing fence is seen. Returns the index to resume at.
fn parse_fenced(
    lines: &[&str],
    start: usize,
    filename: Option<String>,
    out: &mut ParseOutcome,
) -> usize {
    let mut complete: Vec<EditBlock> = Vec::new();
    let mut search: Vec<&str> = Vec::new();
    let mut replace: Vec<&str> = Vec::new();
    let mut section = Section::Search;
    let mut j = start + 1;

    while j < lines.len() {
        let line = lines[j];
        match section {
            Section::Search | Section::Replace => {
                if is_search(line) {
                    out.errors.push(ParseIssue {
                        line: j + 1,
                        kind: section_issue(section),
                    });
                    search.clear();
                    replace.clear();
                    if j >= 2 && j - 2 > start && is_block_header(lines, j - 2) {
                        // A fresh header swallowed into this section: the fence never closed.
                        if !complete.is_empty() {
                            out.errors.push(ParseIssue {
                                line: j - 1,
                                kind: ParseIssueKind::UnclosedFence,
                            });
                        }
                        return j - 2;
                    }
                    section = Section::Search;
                } else if section == Section::Search && is_replace(line) {
                    out.errors.push(ParseIssue {
                        line: j + 1,
                        kind: ParseIssueKind::MissingDivider,
                    });
                    search.clear();
                    section = Section::Between;
                } else if section == Section::Search && is_divider(line) {
                    section = Section::Replace;
                } else if section == Section::Replace && is_replace(line) {
                    if let Some(name) = &filename {
                        complete.push(EditBlock {
                            filename: name.clone(),
                            search: join_lines(&search),
                            replace: join_lines(&replace),
                        });
                    }
                    search.clear();
                    replace.clear();
                    section = Section::Between;
                } else if section == Section::Search {
                    search.push(line);
                } else {
                    replace.push(line);
                }
            }
            Section::Between => {
                // A bare fence always closes; only a fence with an info word can
                // open the next block while this one is still unclosed.
                if is_closing_fence(line) {
                    out.blocks.extend(complete);
                    return j + 1;
                }
                if is_block_header(lines, j) {
                    out.errors.push(ParseIssue {
                        line: j + 1,
                        kind: ParseIssueKind::UnclosedFence,
                    });
                    return j;
                }
                if is_fence(line) {
                    out.blocks.extend(complete);
                    return j + 1;
                }
                if is_search(line) {
                    section = Section::Search;
                }
            }
        }
        j += 1;
    }

    let kind = match section {
        Section::Between => ParseIssueKind::UnclosedFence,
        other => section_issue(other),
    };
    out.errors.push(ParseIssue {
        line: lines.len(),
        kind,
    });
    lines.len()
}

fn section_issue(section: Section) -> ParseIssueKind {
    match section {
        Section::Replace => ParseIssueKind::MissingReplace,
        _ => ParseIssueKind::MissingDivider,
    }
}

fn skip_plain_fence(lines: &[&str], open: usize) -> usize {
    let mut j = open + 1;
    while j < lines.len() {
        if is_closing_fence(lines[j]) {
            return j + 1;
        }
        if is_block_header(lines, j) {
            return j;
        }
        if is_fence(lines[j]) {
            return j + 1;
        }
        j += 1;
    }
    lines.len()
}

fn skip_stray_block(lines: &[&str], marker: usize) -> usize {
    let mut j = marker + 1;
    while j < lines.len() {
        if is_block_header(lines, j) || is_search(lines[j]) {
            return j;
        }
        if is_replace(lines[j]) {
            return j + 1;
        }
        j += 1;
    }
    lines.len()
}

fn check_filename(raw: &str) -> Result<String, ParseIssueKind> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ParseIssueKind::MissingFilename);
    }
    const DECORATION: [char; 4] = ['`', '"', '\'', '*'];
    if name.starts_with(DECORATION) || name.ends_with(DECORATION) || name.starts_with('#') {
        return Err(ParseIssueKind::DecoratedFilename(name.to_string()));
    }
    Ok(name.to_string())
}

fn join_lines(lines: &[&str]) -> String {
    let mut joined = String::new();
    for line in lines {
        joined.push_str(line);
        joined.push('\n');
    }
    joined
}

fn is_block_header(lines: &[&str], at: usize) -> bool {
    is_fence(lines[at]) && lines.get(at + 2).is_some_and(|line| is_search(line))
}

/// Three or more backticks, optionally followed by a single info word.
fn is_fence(line: &str) -> bool {
    let trimmed = line.trim();
    let ticks = trimmed.chars().take_while(|c| *c == '`').count();
    if ticks < 3 {
        return false;
    }
    let info = trimmed[ticks..].trim_start();
    !info.contains('`') && !info.contains(char::is_whitespace)
}

fn is_closing_fence(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.len() >= 3 && trimmed.chars().all(|c| c == '`')
}

fn is_search(line: &str) -> bool {
    line.trim_end() == SEARCH_MARKER
}

fn is_divider(line: &str) -> bool {
    line.trim_end() == DIVIDER_MARKER
}

fn is_replace(line: &str) -> bool {
    line.trim_end() == REPLACE_MARKER
}
