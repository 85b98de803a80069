use anyhow::Result;
use blocksmith_core::{ChatMessage, ChatRequest, LlmConfig};
use blocksmith_llm::{LlmClient, LlmError};

const SUMMARY_REQUEST: &str = "Please summarize these changes in a single line:";
const SUMMARY_ACK: &str = "Ok, let's see them.";

/// Ask the model for a one-line description of `changes` (an instruction, a
/// diff, a saved response). Uses the blocking request path; nothing streams.
pub fn summarize_oneline(llm: &dyn LlmClient, cfg: &LlmConfig, changes: &str) -> Result<String> {
    let request = ChatRequest {
        model: cfg.model.clone(),
        messages: vec![
            ChatMessage::user(SUMMARY_REQUEST),
            ChatMessage::assistant(SUMMARY_ACK),
            ChatMessage::user(changes),
        ],
        max_tokens: cfg.max_tokens,
        temperature: Some(cfg.temperature),
    };
    let response = llm.complete_chat(&request)?;
    response
        .text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .ok_or_else(|| LlmError::Empty.into())
}
