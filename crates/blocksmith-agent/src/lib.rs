//! Edit sessions: prompt assembly, applying parsed blocks to a workspace,
//! reflection on failures and the orchestrating state machine.

pub mod history;
pub mod prompt;
pub mod reflection;
pub mod round;
pub mod session;
pub mod summary;
pub mod transcript;
pub mod usage;
pub mod workspace;

pub use history::{ConversationHistory, HistorySink};
pub use prompt::{DefaultPrompts, PromptBuilder};
pub use reflection::{ReflectionDecision, ReflectionManager};
pub use round::{
    AutoConfirm, AutoDecline, BlockFailure, RoundResult, UserPrompt, apply_blocks,
    apply_response, promotion_question,
};
pub use session::{SessionOrchestrator, SessionReport, Termination};
pub use summary::summarize_oneline;
pub use transcript::Transcript;
pub use usage::UsageTracker;
pub use workspace::{FileOracle, PathError, WorkspaceFiles, normalize_relative};
