//! Amcp Core - Types, traits, and error handling

pub mod agent_spec;
pub mod config;
pub mod error;
pub mod events;
pub mod hooks;
pub mod permission;
pub mod protocol;
pub mod queued_message;
pub mod types;

pub use agent_spec::{AgentMode, AgentSpec, SystemPromptRef};
pub use config::{config_root, ChatConfig, HooksConfig, RootConfig, ServerConfig};
pub use error::{Error, Result};
pub use events::{Event, EventBus, EventKind, HandlerPriority};
pub use hooks::{
    HookEventKind, HookHandler, HookInput, HookKind, HookOutcome, HookResponse, HookSpecificOutput,
};
pub use permission::{
    apply_mode, decide, decide_with_delegate, filesystem_key, glob_match, Decision, LayeredRules,
    PermissionRule, SessionMode,
};
pub use protocol::*;
pub use queued_message::{ConflictStrategy, Priority, QueuedMessage};
pub use types::*;
