//! Core types shared across the protocol

use serde::{Deserialize, Serialize};

/// How hard the executor should try to stop the running turn.
///
/// The executor decides what each level means; `Graceful` usually lets the
/// current tool call finish, `Immediate` aborts it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelLevel {
    #[default]
    Graceful,
    Immediate,
}

impl CancelLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelLevel::Graceful => "graceful",
            CancelLevel::Immediate => "immediate",
        }
    }
}

/// Severity of a display message pushed by executor hooks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayLevel {
    #[default]
    Info,
    Warning,
    Error,
}

impl DisplayLevel {
    /// Lenient parse used for hook payloads; unknown levels fall back to `Info`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "warning" | "warn" => DisplayLevel::Warning,
            "error" => DisplayLevel::Error,
            _ => DisplayLevel::Info,
        }
    }
}

/// What a session worker is doing right now
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Idle,
    Running,
    Stopped,
}

/// One active session as reported by `list_active_sessions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub project_id: String,
    pub working_dir: String,
    pub profile: Option<String>,
    pub parent_id: Option<String>,
    pub state: WorkerState,
    pub queued: usize,
    pub turns_completed: u64,
    pub created_at: String,
    pub last_activity_at: Option<String>,
}

/// A stored session that can still be resumed, newest activity first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHistoryEntry {
    pub session_id: String,
    pub project_id: String,
    pub working_dir: String,
    pub profile: Option<String>,
    pub parent_id: Option<String>,
    pub turn_count: u64,
    pub created_at: String,
    pub last_activity_at: Option<String>,
    /// Whether this process currently holds a live handle for it
    pub live: bool,
}
