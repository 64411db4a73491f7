//! Amcp Gateway - HTTP/WebSocket server and agent runtime wiring

pub mod approvals;
pub mod auth;
pub mod manager;
pub mod server;
pub mod ws;

pub use approvals::ApprovalRegistry;
pub use manager::{PromptOutcome, SessionInfo, SessionManager};
pub use server::{start_gateway, AppState, ExtendedConfig};
