use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

pub type Result<T> = anyhow::Result<T>;

pub const DEFAULT_CHAT_MODEL: &str = "deepseek-chat";
pub const DEFAULT_ENDPOINT: &str = "https://api.deepseek.com/chat/completions";
pub const DEFAULT_API_KEY_ENV: &str = "BLOCKSMITH_API_KEY";

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".blocksmith")
}

/// Phase of one edit session. A session walks
/// `Idle -> AwaitingResponse -> ProcessingBlocks -> DecidingReflection` and
/// either loops back to `AwaitingResponse` or ends in `Terminated`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    Idle,
    AwaitingResponse,
    ProcessingBlocks,
    DecidingReflection,
    Terminated,
}

pub fn is_valid_phase_transition(from: &SessionPhase, to: &SessionPhase) -> bool {
    if from == to {
        return true;
    }
    match from {
        SessionPhase::Idle => matches!(
            to,
            SessionPhase::AwaitingResponse | SessionPhase::Terminated
        ),
        // Empty responses re-enter AwaitingResponse, which the identity rule covers.
        SessionPhase::AwaitingResponse => matches!(
            to,
            SessionPhase::ProcessingBlocks | SessionPhase::Terminated
        ),
        SessionPhase::ProcessingBlocks => matches!(
            to,
            SessionPhase::DecidingReflection | SessionPhase::Terminated
        ),
        SessionPhase::DecidingReflection => matches!(
            to,
            SessionPhase::AwaitingResponse | SessionPhase::Terminated
        ),
        SessionPhase::Terminated => false,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq_no: u64,
    pub at: DateTime<Utc>,
    pub session_id: Uuid,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventKind {
    SessionStartedV1 {
        workspace: String,
        instruction: String,
    },
    PhaseChangedV1 {
        from: SessionPhase,
        to: SessionPhase,
    },
    BlocksParsedV1 {
        round: u32,
        blocks: usize,
        parse_errors: usize,
    },
    BlockAppliedV1 {
        path: String,
        created: bool,
        ambiguous: bool,
        after_sha256: String,
    },
    BlockFailedV1 {
        path: String,
        reason: String,
    },
    PromotionDeclinedV1 {
        path: String,
    },
    ReflectionQueuedV1 {
        attempt: u32,
        failures: usize,
    },
    EmptyResponseRetriedV1 {
        attempt: u32,
    },
    SessionTerminatedV1 {
        reason: String,
        rounds: u32,
    },
}

impl EventKind {
    pub fn category(&self) -> &'static str {
        match self {
            Self::SessionStartedV1 { .. }
            | Self::PhaseChangedV1 { .. }
            | Self::SessionTerminatedV1 { .. } => "session",
            Self::BlocksParsedV1 { .. }
            | Self::BlockAppliedV1 { .. }
            | Self::BlockFailedV1 { .. }
            | Self::PromotionDeclinedV1 { .. } => "edit",
            Self::ReflectionQueuedV1 { .. } | Self::EmptyResponseRetriedV1 { .. } => "llm",
        }
    }
}

/// Token accounting reported by the provider for a single completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

fn default_finish_reason() -> String {
    "stop".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    #[serde(default = "default_finish_reason")]
    pub finish_reason: String,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

/// A single chunk emitted during streaming.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// A content text delta.
    ContentDelta(String),
    /// The provider asked us to back off; a new attempt starts after `delay_ms`.
    Retrying { attempt: u8, delay_ms: u64 },
    /// Streaming is done; the final assembled response follows.
    Done,
}

/// Callback type for receiving streaming chunks.
/// Uses `Arc<dyn Fn>` so it can be cloned across rounds of a session.
pub type StreamCallback = Arc<dyn Fn(StreamChunk) + Send + Sync>;

/// A message in a multi-turn conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum ChatMessage {
    #[serde(rename = "system")]
    System { content: String },
    #[serde(rename = "user")]
    User { content: String },
    #[serde(rename = "assistant")]
    Assistant { content: String },
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::System { content } | Self::User { content } | Self::Assistant { content } => {
                content
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

/// Cooperative cancellation flag shared between the session thread, the
/// streaming worker and signal handlers.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// The underlying flag, for registration with signal handlers.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub session: SessionConfig,
    pub observe: ObserveConfig,
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".blocksmith/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    pub fn legacy_toml_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    pub fn load(workspace: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        let legacy = Self::legacy_toml_path(workspace);
        if legacy.exists() {
            let raw = fs::read_to_string(legacy)?;
            let legacy_cfg: AppConfig = toml::from_str(&raw)?;
            merge_json_value(&mut merged, &serde_json::to_value(legacy_cfg)?);
        }

        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));

        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    pub fn ensure(workspace: &Path) -> Result<Self> {
        let path = Self::project_settings_path(workspace);
        if path.exists()
            || Self::project_local_settings_path(workspace).exists()
            || Self::legacy_toml_path(workspace).exists()
            || Self::user_settings_path().is_some_and(|p| p.exists())
        {
            return Self::load(workspace);
        }
        let cfg = Self::default();
        cfg.save(workspace)?;
        Ok(cfg)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::project_settings_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_CHAT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            max_tokens: 8192,
            temperature: 0.0,
            timeout_seconds: 120,
            max_retries: 3,
            retry_base_ms: 400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Reflection rounds allowed after the first response.
    pub max_reflections: u32,
    /// Empty completions re-requested per round before giving up.
    pub max_empty_retries: u32,
    /// Lines of SEARCH text quoted back to the model for each failed block.
    pub reflection_snippet_lines: usize,
    /// Promote non-editable files without asking.
    pub auto_confirm: bool,
    pub style_guide: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_reflections: 3,
            max_empty_retries: 3,
            reflection_snippet_lines: 12,
            auto_confirm: false,
            style_guide: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserveConfig {
    pub verbose: bool,
    /// Append every request and response to `.blocksmith/conversations.md`.
    pub transcript: bool,
}

impl Default for ObserveConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            transcript: true,
        }
    }
}
