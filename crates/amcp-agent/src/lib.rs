//! Amcp Agent — the agent loop: session state, message queue, hook
//! pipeline, permission engine, context compaction, and subagent
//! delegation, wired together in `runtime`.

pub mod compactor;
pub mod history;
pub mod hooks;
pub mod permission;
pub mod queue;
pub mod runtime;
pub mod session;
pub mod subagent;

pub use compactor::{CompactionConfig, CompactionStrategy, Compactor};
pub use hooks::HookPipeline;
pub use permission::{AskCallback, PermissionEngine, ResolvedDecision};
pub use amcp_core::permission::ApprovalAnswer;
pub use queue::{MessageQueue, SubmitOutcome};
pub use runtime::{AgentConfig, AgentEvent, AgentRuntime};
pub use session::{Session, SessionKey, SessionRegistry, SessionStatus};
pub use subagent::{purpose_hash_name, SubagentEntry, SubagentInfo, SubagentRegistry, SubagentStatus};
