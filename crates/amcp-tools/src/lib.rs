//! Amcp Tools — modular tool implementations
//!
//! Each tool is a self-contained file in src/tools/.
//! To add a tool: create the file, implement Tool trait, register below.
//! To remove a tool: delete the file, remove from mod.rs and registry below.

pub mod registry;
pub mod tools;

pub use registry::{Tool, ToolRegistry, ToolResult};
pub use tools::spawn::{RuntimeHandle, SpawnTool, SpawnableRuntime, SubagentControl, SubagentRegistryHandle};
pub use tools::subagent::SubagentTool;

use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared handle to the subagent lifecycle registry, set after construction.
pub type SubagentHandle = Arc<RwLock<Option<SubagentRegistryHandle>>>;

/// Create a runtime handle for the spawn tool. Call this before creating the registry,
/// then set the runtime after constructing AgentRuntime.
pub fn create_runtime_handle() -> RuntimeHandle {
    Arc::new(RwLock::new(None))
}

/// Create a handle for the subagent lifecycle registry. Call this before creating the
/// registry, then set it after constructing the concrete `SubagentRegistry`.
pub fn create_subagent_handle() -> SubagentHandle {
    Arc::new(RwLock::new(None))
}

pub fn create_default_registry(workspace_root: impl AsRef<Path>) -> ToolRegistry {
    create_default_registry_with_spawn(workspace_root, create_runtime_handle())
}

/// Create registry with a shared runtime handle for the spawn tool.
/// After constructing AgentRuntime, call `runtime_handle.write().await = Some(runtime)`.
pub fn create_default_registry_with_spawn(
    workspace_root: impl AsRef<Path>,
    runtime_handle: RuntimeHandle,
) -> ToolRegistry {
    create_default_registry_with_handles(workspace_root, runtime_handle, create_subagent_handle())
}

/// Create registry with both the spawn-runtime handle and the subagent lifecycle
/// registry handle. After constructing the concrete runtime and `SubagentRegistry`,
/// populate both handles.
pub fn create_default_registry_with_handles(
    workspace_root: impl AsRef<Path>,
    runtime_handle: RuntimeHandle,
    subagent_handle: SubagentHandle,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    let root = workspace_root.as_ref();

    // --- Core tools (read-only) ---
    registry.register(tools::read::ReadTool::new(root));
    registry.register(tools::glob::GlobTool::new(root));
    registry.register(tools::grep::GrepTool::new(root));

    // --- Mutation tools ---
    registry.register(tools::write::WriteTool::new(root));
    registry.register(tools::edit::EditTool::new(root));
    registry.register(tools::bash::BashTool::new(root));
    registry.register(tools::apply_patch::ApplyPatchTool::new(root));
    registry.register(tools::todo::TodoTool::new());
    registry.register(tools::think::ThinkTool::new());

    // --- Delegation primitive: recursive sub-agent spawning ---
    registry.register(
        tools::spawn::SpawnTool::new(root, runtime_handle).with_subagent_registry(subagent_handle.clone()),
    );
    // --- Delegation lifecycle control: list/query/pause/resume/kill ---
    registry.register(tools::subagent::SubagentTool::new(subagent_handle));

    // Back-compat aliases for the teacher's short tool names.
    registry.register_alias("read", "read_file");
    registry.register_alias("write", "write_file");
    registry.register_alias("edit", "edit_file");
    registry.register_alias("spawn", "task");

    registry
}

/// Create a policy-scoped tool registry.
///
/// Only registers tools whose names appear in `allowed_tools`.
/// Used by operator containers to enforce policy at the tool registration level.
/// If a tool isn't registered, the LLM never sees it and can't call it.
pub fn create_policy_registry(workspace_root: impl AsRef<Path>, allowed_tools: &[&str]) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    let root = workspace_root.as_ref();

    for name in allowed_tools {
        match *name {
            "read" | "read_file" => registry.register(tools::read::ReadTool::new(root)),
            "glob" => registry.register(tools::glob::GlobTool::new(root)),
            "grep" => registry.register(tools::grep::GrepTool::new(root)),
            "write" | "write_file" => registry.register(tools::write::WriteTool::new(root)),
            "edit" | "edit_file" => registry.register(tools::edit::EditTool::new(root)),
            "bash" => registry.register(tools::bash::BashTool::new(root)),
            "apply_patch" => registry.register(tools::apply_patch::ApplyPatchTool::new(root)),
            "todo" => registry.register(tools::todo::TodoTool::new()),
            "think" => registry.register(tools::think::ThinkTool::new()),
            _ => tracing::warn!("Unknown tool in policy: {}", name),
        }
    }

    registry
}
