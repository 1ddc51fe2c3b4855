//! Server → Client messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::DisplayLevel;

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Connection lifecycle
    AuthOk,
    Pong,
    SessionCreated {
        session_id: String,
        cwd: String,
        profile: Option<String>,
    },

    // Streamed content blocks (index is stable for the whole turn)
    ContentStart {
        block_type: String,
        index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
    },
    ContentDelta {
        delta: String,
        index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
    },
    ContentEnd {
        index: usize,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
    },
    ThinkingDelta {
        delta: String,
    },
    ThinkingFinal {
        content: String,
    },

    // Tools and delegation
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        arguments: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
    },
    ToolResult {
        tool_call_id: String,
        success: bool,
        output: Option<String>,
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
    },
    SessionFork {
        parent_id: String,
        child_id: String,
        agent: String,
        parent_tool_call_id: Option<String>,
    },

    // Turn lifecycle
    PromptComplete {
        turn_count: u64,
    },
    CancelAcknowledged,
    ExecutionCancelled,
    ExecutionError {
        error: String,
    },

    // Side channels
    DisplayMessage {
        message: String,
        level: DisplayLevel,
        source: String,
    },
    ApprovalRequest {
        id: String,
        prompt: String,
        options: Vec<String>,
        timeout: f64,
        default: String,
    },
    TokenUsage {
        input_tokens: u64,
        output_tokens: u64,
        total_tokens: u64,
        cache_read_tokens: Option<u64>,
        cache_write_tokens: Option<u64>,
        model: Option<String>,
        provider: Option<String>,
        duration_ms: Option<u64>,
    },

    // Slash commands
    CommandResult {
        command: String,
        result: Value,
    },

    // Errors
    Error {
        error: String,
    },
}

impl ServerMessage {
    /// Wire `type` tag, handy for logging without serializing the payload.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::AuthOk => "auth_ok",
            ServerMessage::Pong => "pong",
            ServerMessage::SessionCreated { .. } => "session_created",
            ServerMessage::ContentStart { .. } => "content_start",
            ServerMessage::ContentDelta { .. } => "content_delta",
            ServerMessage::ContentEnd { .. } => "content_end",
            ServerMessage::ThinkingDelta { .. } => "thinking_delta",
            ServerMessage::ThinkingFinal { .. } => "thinking_final",
            ServerMessage::ToolCall { .. } => "tool_call",
            ServerMessage::ToolResult { .. } => "tool_result",
            ServerMessage::SessionFork { .. } => "session_fork",
            ServerMessage::PromptComplete { .. } => "prompt_complete",
            ServerMessage::CancelAcknowledged => "cancel_acknowledged",
            ServerMessage::ExecutionCancelled => "execution_cancelled",
            ServerMessage::ExecutionError { .. } => "execution_error",
            ServerMessage::DisplayMessage { .. } => "display_message",
            ServerMessage::ApprovalRequest { .. } => "approval_request",
            ServerMessage::TokenUsage { .. } => "token_usage",
            ServerMessage::CommandResult { .. } => "command_result",
            ServerMessage::Error { .. } => "error",
        }
    }
}
