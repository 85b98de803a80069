use anyhow::Result;
use blocksmith_agent::RoundResult;
use blocksmith_core::AppConfig;
use blocksmith_edit::{EditKind, ParseOutcome};
use serde::Serialize;
use serde_json::json;
use std::fmt::Write as _;

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

pub(crate) fn redact_config_for_display(cfg: &AppConfig) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(cfg)?;
    if let Some(llm) = value.get_mut("llm").and_then(|entry| entry.as_object_mut())
        && llm.get("api_key").is_some_and(|key| !key.is_null())
    {
        llm.insert("api_key".to_string(), json!("***REDACTED***"));
    }
    Ok(value)
}

pub(crate) fn render_round(result: &RoundResult) -> String {
    let mut out = String::new();
    for change in &result.applied {
        let verb = match change.kind {
            EditKind::Created => "created",
            EditKind::Modified => "modified",
        };
        let _ = writeln!(out, "{verb} {}", change.path);
    }
    for failed in &result.failed {
        let _ = writeln!(out, "failed {}: {}", failed.block.filename, failed.failure);
    }
    for issue in &result.parse_errors {
        let _ = writeln!(out, "malformed {issue}");
    }
    for path in &result.declined_files {
        let _ = writeln!(out, "skipped {path}: not editable");
    }
    if result.block_count() == 0 && result.parse_errors.is_empty() {
        out.push_str("no edit blocks found\n");
    }
    out
}

pub(crate) fn render_parse(outcome: &ParseOutcome) -> String {
    let mut out = String::new();
    for (idx, block) in outcome.blocks.iter().enumerate() {
        let action = if block.creates_file() { "create" } else { "edit" };
        let _ = writeln!(
            out,
            "{}. {action} {} ({} search line(s), {} replace line(s))",
            idx + 1,
            block.filename,
            block.search.lines().count(),
            block.replace.lines().count()
        );
    }
    for issue in &outcome.errors {
        let _ = writeln!(out, "error: {issue}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_is_redacted_only_when_set() {
        let mut cfg = AppConfig::default();
        let shown = redact_config_for_display(&cfg).expect("redact");
        assert!(shown["llm"]["api_key"].is_null());

        cfg.llm.api_key = Some("sk-secret".to_string());
        let shown = redact_config_for_display(&cfg).expect("redact");
        assert_eq!(shown["llm"]["api_key"], "***REDACTED***");
    }

    #[test]
    fn parse_listing_numbers_blocks() {
        let outcome = blocksmith_edit::parse_edit_blocks(
            "```\nnew.txt\n<<<<<<< SEARCH\n=======\nhello\n>>>>>>> REPLACE\n```\n<<<<<<< SEARCH\n",
        );
        let text = render_parse(&outcome);
        assert!(text.starts_with("1. create new.txt (0 search line(s), 1 replace line(s))\n"));
        assert!(text.contains("error: line 8:"));
    }
}
