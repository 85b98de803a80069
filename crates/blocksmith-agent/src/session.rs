use crate::history::{ConversationHistory, HistorySink};
use crate::prompt::{DefaultPrompts, PromptBuilder};
use crate::reflection::ReflectionManager;
use crate::round::{AutoConfirm, AutoDecline, BlockFailure, RoundResult, UserPrompt, apply_blocks};
use crate::transcript::Transcript;
use crate::usage::{UsageTracker, count_lines};
use crate::workspace::{FileOracle, WorkspaceFiles};
use anyhow::{Result, anyhow};
use blocksmith_core::{
    AppConfig, CancellationToken, ChatMessage, ChatRequest, EventEnvelope, EventKind,
    SessionPhase, StreamCallback, TokenUsage, is_valid_phase_transition,
};
use blocksmith_edit::{EditBlock, EditKind, FileChange, parse_edit_blocks};
use blocksmith_llm::{LlmClient, LlmError, spawn_chat_stream};
use blocksmith_observe::Observer;
use chrono::Utc;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use uuid::Uuid;

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum Termination {
    /// The last response applied cleanly (possibly with no edits at all).
    Completed,
    /// Failures remained after the last allowed reflection round.
    ReflectionsExhausted,
    Cancelled,
    TransportError(String),
    /// Every attempt of a round came back empty.
    EmptyResponse,
}

impl Termination {
    fn from_llm_error(err: LlmError) -> Self {
        match err {
            LlmError::Cancelled => Self::Cancelled,
            LlmError::Transport(msg) => Self::TransportError(msg),
            LlmError::Empty => Self::EmptyResponse,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ReflectionsExhausted => "reflections_exhausted",
            Self::Cancelled => "cancelled",
            Self::TransportError(_) => "transport_error",
            Self::EmptyResponse => "empty_response",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub termination: Termination,
    /// Responses that reached block processing.
    pub rounds: u32,
    pub reflections: u32,
    pub applied: Vec<FileChange>,
    /// Failed blocks that no later round applied.
    pub unapplied: Vec<BlockFailure>,
    pub parse_errors: Vec<String>,
    pub declined_files: Vec<String>,
    pub usage: TokenUsage,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        self.termination == Termination::Completed
            && self.unapplied.is_empty()
            && self.parse_errors.is_empty()
            && self.declined_files.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let leftovers = !self.unapplied.is_empty() || !self.declined_files.is_empty();
        match &self.termination {
            Termination::Completed if leftovers => {
                out.push_str("The model stopped proposing edits before every block applied.\n");
            }
            Termination::Completed if self.applied.is_empty() => {
                out.push_str("No edits were proposed.\n");
            }
            Termination::Completed => {
                let _ = writeln!(out, "All edits applied ({} change(s)):", self.applied.len());
            }
            Termination::ReflectionsExhausted => {
                let _ = writeln!(
                    out,
                    "Stopped after {} reflection round(s) with edits still failing.",
                    self.reflections
                );
            }
            Termination::Cancelled => out.push_str("Session cancelled.\n"),
            Termination::TransportError(msg) => {
                let _ = writeln!(out, "Model request failed: {msg}");
            }
            Termination::EmptyResponse => out.push_str("The model kept returning empty responses.\n"),
        }
        if !self.applied.is_empty() && (leftovers || self.termination != Termination::Completed) {
            let _ = writeln!(out, "Applied before stopping ({}):", self.applied.len());
        }
        for change in &self.applied {
            let verb = match change.kind {
                EditKind::Created => "created",
                EditKind::Modified => "modified",
            };
            let note = if change.ambiguous {
                " (first of several matches)"
            } else {
                ""
            };
            let _ = writeln!(out, "  {verb} {}{note}", change.path);
        }
        if !self.unapplied.is_empty() {
            let _ = writeln!(out, "{} edit(s) could not be applied:", self.unapplied.len());
            for failed in &self.unapplied {
                let _ = writeln!(out, "  - {}: {}", failed.block.filename, failed.failure);
            }
        }
        if !self.parse_errors.is_empty() {
            out.push_str("Malformed edit blocks:\n");
            for issue in &self.parse_errors {
                let _ = writeln!(out, "  - {issue}");
            }
        }
        for path in &self.declined_files {
            let _ = writeln!(out, "  - {path}: not made editable, edits skipped");
        }
        out
    }
}

/// Drives one instruction through request, apply and reflection rounds.
pub struct SessionOrchestrator {
    llm: Arc<dyn LlmClient + Send + Sync>,
    files: Box<dyn FileOracle>,
    prompts: Box<dyn PromptBuilder>,
    history: Box<dyn HistorySink>,
    user: Box<dyn UserPrompt>,
    observer: Option<Observer>,
    transcript: Transcript,
    usage: UsageTracker,
    cfg: AppConfig,
    cancel: CancellationToken,
    stream_callback: Option<StreamCallback>,
    phase: SessionPhase,
    session_id: Uuid,
    seq_no: u64,
}

impl SessionOrchestrator {
    /// Bare orchestrator: in-memory history, no log file, no transcript.
    pub fn new(
        cfg: AppConfig,
        llm: Arc<dyn LlmClient + Send + Sync>,
        files: Box<dyn FileOracle>,
    ) -> Self {
        let user: Box<dyn UserPrompt> = if cfg.session.auto_confirm {
            Box::new(AutoConfirm)
        } else {
            Box::new(AutoDecline)
        };
        Self {
            llm,
            files,
            prompts: Box::new(DefaultPrompts::new(cfg.session.style_guide.clone())),
            history: Box::new(ConversationHistory::in_memory()),
            user,
            observer: None,
            transcript: Transcript::disabled(),
            usage: UsageTracker::default(),
            cfg,
            cancel: CancellationToken::new(),
            stream_callback: None,
            phase: SessionPhase::Idle,
            session_id: Uuid::now_v7(),
            seq_no: 0,
        }
    }

    /// Orchestrator wired to a workspace's log, transcript and persisted history.
    pub fn for_workspace(
        cfg: AppConfig,
        llm: Arc<dyn LlmClient + Send + Sync>,
        files: WorkspaceFiles,
    ) -> Result<Self> {
        let root = files.root().to_path_buf();
        let observer = Observer::new(&root, &cfg.observe)?;
        let transcript = if cfg.observe.transcript {
            Transcript::new(&root)
        } else {
            Transcript::disabled()
        };
        let history = ConversationHistory::load(&root)?;
        Ok(Self::new(cfg, llm, Box::new(files))
            .with_observer(observer)
            .with_transcript(transcript)
            .with_history(Box::new(history)))
    }

    pub fn with_prompts(mut self, prompts: Box<dyn PromptBuilder>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_history(mut self, history: Box<dyn HistorySink>) -> Self {
        self.history = history;
        self
    }

    pub fn with_user_prompt(mut self, user: Box<dyn UserPrompt>) -> Self {
        self.user = user;
        self
    }

    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_transcript(mut self, transcript: Transcript) -> Self {
        self.transcript = transcript;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Receives streamed tokens of every round as they arrive.
    pub fn set_stream_callback(&mut self, cb: StreamCallback) {
        self.stream_callback = Some(cb);
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn files(&self) -> &dyn FileOracle {
        self.files.as_ref()
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.history.messages()
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage.totals()
    }

    /// Run `instruction` to completion.
    ///
    /// Model failures and cancellation end the session normally and are
    /// reported in [`SessionReport::termination`]; `Err` is reserved for an
    /// unusable workspace or history store.
    pub fn run_session(&mut self, instruction: &str) -> Result<SessionReport> {
        // An interrupt aimed at an earlier session must not cancel this one.
        self.cancel.reset();
        self.phase = SessionPhase::Idle;
        self.session_id = Uuid::now_v7();
        self.seq_no = 0;
        self.emit(EventKind::SessionStartedV1 {
            workspace: self.files.root().display().to_string(),
            instruction: instruction.to_string(),
        });

        let mut reflection = ReflectionManager::new(
            self.cfg.session.max_reflections,
            self.cfg.session.reflection_snippet_lines,
        );
        let mut session_messages = vec![ChatMessage::user(
            self.prompts.wrap_instruction(instruction),
        )];
        let mut replies: Vec<ChatMessage> = Vec::new();
        let mut applied: Vec<FileChange> = Vec::new();
        let mut unapplied: Vec<BlockFailure> = Vec::new();
        let mut declined_files: Vec<String> = Vec::new();
        let mut last_round: Option<RoundResult> = None;
        let mut rounds = 0u32;

        let termination = loop {
            self.transition(SessionPhase::AwaitingResponse)?;
            let text = match self.request_round(&session_messages)? {
                Ok(text) => text,
                Err(err) => break Termination::from_llm_error(err),
            };

            self.transition(SessionPhase::ProcessingBlocks)?;
            rounds += 1;
            let reply = ChatMessage::assistant(text);
            session_messages.push(reply.clone());
            replies.push(reply.clone());

            let parsed = parse_edit_blocks(reply.content());
            self.emit(EventKind::BlocksParsedV1 {
                round: rounds,
                blocks: parsed.blocks.len(),
                parse_errors: parsed.errors.len(),
            });
            for issue in &parsed.errors {
                self.info(&format!("round {rounds}: malformed edit block, {issue}"));
            }
            let round = apply_blocks(self.files.as_mut(), self.user.as_ref(), parsed)?;
            self.record_round(&round);
            applied.extend(round.applied.iter().cloned());
            carry_failures(&mut unapplied, &round);
            declined_files.retain(|path| !round.applied.iter().any(|c| &c.path == path));
            for path in &round.declined_files {
                if !declined_files.contains(path) {
                    declined_files.push(path.clone());
                }
            }

            self.transition(SessionPhase::DecidingReflection)?;
            let decision = reflection.evaluate(&round);
            let clean = round.is_clean();
            last_round = Some(round);
            if decision.should_continue {
                self.emit(EventKind::ReflectionQueuedV1 {
                    attempt: reflection.attempts(),
                    failures: last_round.as_ref().map_or(0, |r| r.failed.len()),
                });
                session_messages.push(ChatMessage::user(decision.message));
                continue;
            }
            if !clean {
                self.warn(&format!(
                    "giving up after {} reflection round(s)",
                    reflection.attempts()
                ));
            }
            break if clean {
                Termination::Completed
            } else {
                Termination::ReflectionsExhausted
            };
        };

        self.transition(SessionPhase::Terminated)?;
        self.emit(EventKind::SessionTerminatedV1 {
            reason: termination.label().to_string(),
            rounds,
        });

        if !replies.is_empty() {
            let mut committed = Vec::with_capacity(replies.len() + 1);
            committed.push(session_messages[0].clone());
            committed.extend(replies);
            self.history.commit(&committed)?;
        }

        let last_round = last_round.unwrap_or_default();
        Ok(SessionReport {
            session_id: self.session_id,
            termination,
            rounds,
            reflections: reflection.attempts(),
            applied,
            unapplied,
            parse_errors: last_round
                .parse_errors
                .iter()
                .map(ToString::to_string)
                .collect(),
            declined_files,
            usage: self.usage.totals(),
        })
    }

    /// One model call, repeated while the reply is empty. The outer `Err` is a
    /// fatal local error; the inner one ends the session.
    fn request_round(
        &mut self,
        session_messages: &[ChatMessage],
    ) -> Result<std::result::Result<String, LlmError>> {
        let mut empty_attempts = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                self.note_transcript_error(&LlmError::Cancelled.to_string());
                return Ok(Err(LlmError::Cancelled));
            }

            let history = self.history.messages();
            let mut messages = self.prompts.collect_messages(self.files.as_ref(), &history)?;
            messages.extend_from_slice(session_messages);
            let lines = count_lines(&messages);
            match self.usage.approximate_tokens(lines) {
                Some(tokens) => self.info(&format!(
                    "sending {} messages, {lines} lines (~{tokens} tokens)",
                    messages.len()
                )),
                None => self.info(&format!(
                    "sending {} messages, {lines} lines",
                    messages.len()
                )),
            }
            if let Err(err) = self.transcript.record_request(&messages) {
                self.warn(&format!("failed to write transcript: {err}"));
            }

            let request = ChatRequest {
                model: self.cfg.llm.model.clone(),
                messages,
                max_tokens: self.cfg.llm.max_tokens,
                temperature: Some(self.cfg.llm.temperature),
            };
            let on_chunk = self
                .stream_callback
                .clone()
                .unwrap_or_else(|| Arc::new(|_| {}));
            let gate = spawn_chat_stream(
                Arc::clone(&self.llm),
                request,
                self.cancel.clone(),
                on_chunk,
            );

            match gate.wait(&self.cancel) {
                Ok(response) if response.text.trim().is_empty() => {
                    empty_attempts += 1;
                    self.note_transcript_error("empty response");
                    if empty_attempts > self.cfg.session.max_empty_retries {
                        self.warn("model returned only empty responses");
                        return Ok(Err(LlmError::Empty));
                    }
                    self.warn("Empty response from model, will retry");
                    self.emit(EventKind::EmptyResponseRetriedV1 {
                        attempt: empty_attempts,
                    });
                }
                Ok(response) => {
                    self.usage.record(lines, response.usage);
                    if let Err(err) = self.transcript.record_response(&response.text, response.usage)
                    {
                        self.warn(&format!("failed to write transcript: {err}"));
                    }
                    return Ok(Ok(response.text));
                }
                Err(err) => {
                    let partial = gate.partial();
                    if partial.is_empty() {
                        self.note_transcript_error(&err.to_string());
                    } else {
                        self.note_transcript_error(&format!("{err}\n\nPartial response:\n{partial}"));
                    }
                    match &err {
                        LlmError::Cancelled => self.info("round cancelled"),
                        LlmError::Transport(msg) => self.warn(&format!("model request failed: {msg}")),
                        LlmError::Empty => {}
                    }
                    return Ok(Err(err));
                }
            }
        }
    }

    fn record_round(&mut self, round: &RoundResult) {
        for change in &round.applied {
            self.info(&format!("applied edit to {}", change.path));
            self.emit(EventKind::BlockAppliedV1 {
                path: change.path.clone(),
                created: change.kind == EditKind::Created,
                ambiguous: change.ambiguous,
                after_sha256: change.after_sha256.clone(),
            });
        }
        for failed in &round.failed {
            self.info(&format!(
                "edit to {} failed: {}",
                failed.block.filename, failed.failure
            ));
            self.emit(EventKind::BlockFailedV1 {
                path: failed.block.filename.clone(),
                reason: failed.failure.to_string(),
            });
        }
        for path in &round.declined_files {
            self.emit(EventKind::PromotionDeclinedV1 { path: path.clone() });
        }
    }

    fn transition(&mut self, to: SessionPhase) -> Result<()> {
        let from = self.phase;
        if !is_valid_phase_transition(&from, &to) {
            return Err(anyhow!("invalid session phase transition {from:?} -> {to:?}"));
        }
        if from != to {
            self.phase = to;
            self.emit(EventKind::PhaseChangedV1 { from, to });
        }
        Ok(())
    }

    fn emit(&mut self, kind: EventKind) {
        self.seq_no += 1;
        let Some(observer) = &self.observer else {
            return;
        };
        let event = EventEnvelope {
            seq_no: self.seq_no,
            at: Utc::now(),
            session_id: self.session_id,
            kind,
        };
        if let Err(err) = observer.record_event(&event) {
            observer.warn_log(&format!("failed to record event: {err}"));
        }
    }

    fn note_transcript_error(&self, msg: &str) {
        if let Err(err) = self.transcript.record_error(msg) {
            self.warn(&format!("failed to write transcript: {err}"));
        }
    }

    fn info(&self, msg: &str) {
        if let Some(observer) = &self.observer {
            observer.verbose_log(msg);
        }
    }

    fn warn(&self, msg: &str) {
        if let Some(observer) = &self.observer {
            observer.warn_log(msg);
        }
    }
}

/// A failure stays outstanding until a later block for the same file applies
/// with the same SEARCH or REPLACE text. A failure seen again replaces its
/// earlier copy.
fn carry_failures(outstanding: &mut Vec<BlockFailure>, round: &RoundResult) {
    outstanding.retain(|old| {
        let retried = |block: &EditBlock| {
            block.filename == old.block.filename
                && (block.search == old.block.search || block.replace == old.block.replace)
        };
        !round.applied_blocks.iter().any(retried)
            && !round.failed.iter().any(|new| retried(&new.block))
    });
    outstanding.extend(round.failed.iter().cloned());
}
