//! Client → Server messages

use serde::{Deserialize, Serialize};

use crate::types::CancelLevel;

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First frame when the server requires an API key
    Auth { token: String },

    /// Create a fresh session, or resume one by id
    CreateSession {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        profile: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume_session_id: Option<String>,
    },

    /// Run one turn on the connection's session
    Prompt { content: String },

    Cancel {
        #[serde(default)]
        level: CancelLevel,
    },

    ApprovalResponse { id: String, choice: String },

    /// Server-side slash command (`status`, `profile <name>`, `cwd <path>`)
    Command {
        name: String,
        #[serde(default)]
        args: Vec<String>,
    },

    Ping,
}
