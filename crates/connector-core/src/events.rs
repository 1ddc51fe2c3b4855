//! Hook event names emitted by executors.
//!
//! Payloads are loosely shaped JSON objects; the server's translator owns
//! the job of decoding them.

pub const CONTENT_BLOCK_START: &str = "content_block:start";
pub const CONTENT_BLOCK_DELTA: &str = "content_block:delta";
pub const CONTENT_BLOCK_END: &str = "content_block:end";
pub const THINKING_DELTA: &str = "thinking:delta";
pub const THINKING_FINAL: &str = "thinking:final";
pub const TOOL_PRE: &str = "tool:pre";
pub const TOOL_POST: &str = "tool:post";
pub const TOOL_ERROR: &str = "tool:error";
pub const AGENT_SPAWNED: &str = "delegate:agent_spawned";
pub const ORCHESTRATOR_COMPLETE: &str = "orchestrator:complete";
pub const CANCEL_REQUESTED: &str = "cancel:requested";
pub const CANCEL_COMPLETED: &str = "cancel:completed";
pub const DISPLAY_MESSAGE: &str = "display_message";
pub const APPROVAL_REQUEST: &str = "approval_request";
pub const LLM_RESPONSE: &str = "llm:response";
pub const PROVIDER_POST: &str = "provider:post";

/// Every event a streaming surface subscribes to.
pub const ALL_EVENTS: &[&str] = &[
    CONTENT_BLOCK_START,
    CONTENT_BLOCK_DELTA,
    CONTENT_BLOCK_END,
    THINKING_DELTA,
    THINKING_FINAL,
    TOOL_PRE,
    TOOL_POST,
    TOOL_ERROR,
    AGENT_SPAWNED,
    ORCHESTRATOR_COMPLETE,
    CANCEL_REQUESTED,
    CANCEL_COMPLETED,
    DISPLAY_MESSAGE,
    APPROVAL_REQUEST,
    LLM_RESPONSE,
    PROVIDER_POST,
];

/// Tool names whose calls open a sub-session.
pub const DELEGATE_TOOLS: &[&str] = &["delegate", "task"];

pub fn is_delegate_tool(name: &str) -> bool {
    DELEGATE_TOOLS.contains(&name)
}
