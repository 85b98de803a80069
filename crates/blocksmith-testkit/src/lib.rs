//! Test doubles shared by the agent and CLI test suites.

use anyhow::{Result, anyhow};
use blocksmith_agent::{UserPrompt, WorkspaceFiles};
use blocksmith_core::{
    CancellationToken, ChatRequest, LlmResponse, StreamCallback, StreamChunk, TokenUsage,
};
use blocksmith_llm::{LlmClient, LlmError};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// One scripted reaction to a model call.
#[derive(Debug, Clone)]
pub enum Step {
    /// Stream `text` line by line, then complete.
    Reply(String),
    /// Complete with whitespace only.
    Empty,
    /// Fail with a transport error.
    Fail(String),
    /// Stream `partial`, then block until the call is cancelled.
    StallUntilCancelled(String),
}

/// `LlmClient` that replays a fixed script and records every request.
pub struct ScriptedLlm {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlm {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replies<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        Self::new(replies.into_iter().map(|r| Step::Reply(r.into())).collect())
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    fn next_step(&self, req: &ChatRequest) -> Result<Step> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("scripted llm mutex poisoned"))?
            .push(req.clone());
        self.steps
            .lock()
            .map_err(|_| anyhow!("scripted llm mutex poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("scripted llm exhausted"))
    }
}

fn usage_for(req: &ChatRequest, text: &str) -> TokenUsage {
    let prompt_chars: usize = req.messages.iter().map(|m| m.content().len()).sum();
    TokenUsage {
        prompt_tokens: (prompt_chars / 4) as u64,
        completion_tokens: (text.len() / 4) as u64,
    }
}

fn response(req: &ChatRequest, text: String) -> LlmResponse {
    LlmResponse {
        usage: Some(usage_for(req, &text)),
        text,
        finish_reason: "stop".to_string(),
    }
}

impl LlmClient for ScriptedLlm {
    fn complete_chat(&self, req: &ChatRequest) -> Result<LlmResponse> {
        match self.next_step(req)? {
            Step::Reply(text) => Ok(response(req, text)),
            Step::Empty => Ok(response(req, String::new())),
            Step::Fail(msg) => Err(anyhow!(msg)),
            Step::StallUntilCancelled(_) => Err(anyhow!("cannot stall a blocking call")),
        }
    }

    fn complete_chat_streaming(
        &self,
        req: &ChatRequest,
        cb: StreamCallback,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse> {
        match self.next_step(req)? {
            Step::Reply(text) => {
                for piece in text.split_inclusive('\n') {
                    cb(StreamChunk::ContentDelta(piece.to_string()));
                }
                cb(StreamChunk::Done);
                Ok(response(req, text))
            }
            Step::Empty => {
                cb(StreamChunk::ContentDelta("  \n".to_string()));
                cb(StreamChunk::Done);
                Ok(response(req, "  \n".to_string()))
            }
            Step::Fail(msg) => Err(anyhow!(msg)),
            Step::StallUntilCancelled(partial) => {
                cb(StreamChunk::ContentDelta(partial));
                while !cancel.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
                Err(LlmError::Cancelled.into())
            }
        }
    }
}

/// `UserPrompt` with queued answers; answers `default` once the queue is empty.
/// Clones share state, so a test can keep one to inspect the questions asked.
#[derive(Clone)]
pub struct ScriptedPrompt {
    answers: Arc<Mutex<VecDeque<bool>>>,
    default: bool,
    asked: Arc<Mutex<Vec<String>>>,
}

impl ScriptedPrompt {
    pub fn new(answers: Vec<bool>, default: bool) -> Self {
        Self {
            answers: Arc::new(Mutex::new(answers.into())),
            default,
            asked: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn always(answer: bool) -> Self {
        Self::new(Vec::new(), answer)
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl UserPrompt for ScriptedPrompt {
    fn confirm(&self, question: &str) -> bool {
        if let Ok(mut asked) = self.asked.lock() {
            asked.push(question.to_string());
        }
        self.answers
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
            .unwrap_or(self.default)
    }
}

/// Temporary workspace directory with helpers for seeding files.
pub struct Fixture {
    dir: TempDir,
}

impl Fixture {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, content: &str) -> Result<()> {
        let full = self.dir.path().join(rel);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(full, content)?;
        Ok(())
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        Ok(fs::read_to_string(self.dir.path().join(rel))?)
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.dir.path().join(rel).exists()
    }

    pub fn files(&self, editable: &[&str], read_only: &[&str]) -> Result<WorkspaceFiles> {
        let mut files = WorkspaceFiles::new(self.dir.path())?;
        for path in editable {
            files.add_editable(path)?;
        }
        for path in read_only {
            files.add_read_only(path)?;
        }
        Ok(files)
    }
}

/// A fenced SEARCH/REPLACE block. `search` and `replace` should end with a
/// newline unless empty.
pub fn edit_block(filename: &str, search: &str, replace: &str) -> String {
    format!("```\n{filename}\n<<<<<<< SEARCH\n{search}=======\n{replace}>>>>>>> REPLACE\n```\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "scripted".to_string(),
            messages: vec![blocksmith_core::ChatMessage::user("12345678")],
            max_tokens: 64,
            temperature: None,
        }
    }

    #[test]
    fn replays_steps_in_order_and_records_requests() {
        let llm = ScriptedLlm::new(vec![
            Step::Reply("line one\nline two\n".to_string()),
            Step::Fail("boom".to_string()),
        ]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: StreamCallback = Arc::new(move |chunk| {
            if let StreamChunk::ContentDelta(text) = chunk {
                sink.lock().expect("lock").push(text);
            }
        });
        let cancel = CancellationToken::new();
        let first = llm
            .complete_chat_streaming(&request(), cb.clone(), &cancel)
            .expect("reply");
        assert_eq!(first.text, "line one\nline two\n");
        assert_eq!(first.usage.map(|u| u.prompt_tokens), Some(2));
        assert_eq!(*seen.lock().expect("lock"), vec!["line one\n", "line two\n"]);

        let err = llm
            .complete_chat_streaming(&request(), cb.clone(), &cancel)
            .expect_err("fail");
        assert_eq!(err.to_string(), "boom");
        assert!(llm.complete_chat(&request()).is_err());
        assert_eq!(llm.requests().len(), 3);
        assert_eq!(llm.remaining(), 0);
    }

    #[test]
    fn scripted_prompt_falls_back_to_default() {
        let prompt = ScriptedPrompt::new(vec![false], true);
        assert!(!prompt.confirm("first?"));
        assert!(prompt.confirm("second?"));
        assert_eq!(prompt.asked(), vec!["first?", "second?"]);
    }

    #[test]
    fn fixture_builds_workspace_files() {
        let fixture = Fixture::new().expect("fixture");
        fixture.write("src/lib.rs", "pub fn a() {}\n").expect("write");
        let files = fixture.files(&["src/lib.rs"], &["README.md"]).expect("files");
        assert_eq!(
            blocksmith_agent::FileOracle::editable_files(&files),
            vec!["src/lib.rs".to_string()]
        );
        assert_eq!(fixture.read("src/lib.rs").expect("read"), "pub fn a() {}\n");
        assert!(!fixture.exists("README.md"));
        assert_eq!(
            edit_block("a.txt", "", "x\n"),
            "```\na.txt\n<<<<<<< SEARCH\n=======\nx\n>>>>>>> REPLACE\n```\n"
        );
    }
}
