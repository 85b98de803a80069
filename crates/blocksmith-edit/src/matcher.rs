use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Exact,
    WhitespaceNormalized,
}

/// Byte span `start..end` of the matched region in the searched content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MatchLocation {
    pub start: usize,
    pub end: usize,
    pub strategy: MatchStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchResult {
    Matched(MatchLocation),
    /// The search text occurs more than once; the first occurrence was chosen.
    AmbiguousButFirstUsed(MatchLocation),
    NotFound,
}

impl MatchResult {
    pub fn location(&self) -> Option<MatchLocation> {
        match self {
            Self::Matched(loc) | Self::AmbiguousButFirstUsed(loc) => Some(*loc),
            Self::NotFound => None,
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::AmbiguousButFirstUsed(_))
    }
}

/// Locate `search` in `content`: exact substring first, then a line-wise
/// comparison that ignores differences in horizontal whitespace.
///
/// Search text that is empty or blank never matches; creating files is the
/// applier's concern.
pub fn find_match(content: &str, search: &str) -> MatchResult {
    if search.trim().is_empty() {
        return MatchResult::NotFound;
    }

    if let Some(start) = content.find(search) {
        let end = start + search.len();
        let loc = MatchLocation {
            start,
            end,
            strategy: MatchStrategy::Exact,
        };
        return if content[end..].contains(search) {
            MatchResult::AmbiguousButFirstUsed(loc)
        } else {
            MatchResult::Matched(loc)
        };
    }

    normalized_match(content, search)
}

struct LineSpan<'a> {
    start: usize,
    text_end: usize,
    full_end: usize,
    text: &'a str,
}

fn line_spans(content: &str) -> Vec<LineSpan<'_>> {
    let mut spans = Vec::new();
    let mut offset = 0;
    for raw in content.split_inclusive('\n') {
        let text = raw
            .strip_suffix('\n')
            .map(|t| t.strip_suffix('\r').unwrap_or(t))
            .unwrap_or(raw);
        spans.push(LineSpan {
            start: offset,
            text_end: offset + text.len(),
            full_end: offset + raw.len(),
            text,
        });
        offset += raw.len();
    }
    spans
}

fn normalized_match(content: &str, search: &str) -> MatchResult {
    let mut needle: Vec<String> = search.lines().map(normalize_line).collect();
    while needle.last().is_some_and(|line| line.is_empty()) {
        needle.pop();
    }
    if needle.is_empty() {
        return MatchResult::NotFound;
    }

    let spans = line_spans(content);
    if spans.len() < needle.len() {
        return MatchResult::NotFound;
    }
    let hay: Vec<String> = spans.iter().map(|span| normalize_line(span.text)).collect();

    let mut windows = (0..=hay.len() - needle.len())
        .filter(|&w| hay[w..w + needle.len()] == needle[..]);
    let Some(first) = windows.next() else {
        return MatchResult::NotFound;
    };
    let last = &spans[first + needle.len() - 1];
    let loc = MatchLocation {
        start: spans[first].start,
        end: if search.ends_with('\n') {
            last.full_end
        } else {
            last.text_end
        },
        strategy: MatchStrategy::WhitespaceNormalized,
    };
    if windows.any(|w| w >= first + needle.len()) {
        MatchResult::AmbiguousButFirstUsed(loc)
    } else {
        MatchResult::Matched(loc)
    }
}

/// Collapse each run of horizontal whitespace to a single space and drop
/// trailing whitespace. Leading indentation survives as one space.
fn normalize_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut pending_space = false;
    for ch in line.chars() {
        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(ch);
    }
    out
}
