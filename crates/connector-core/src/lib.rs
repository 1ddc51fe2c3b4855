//! Switchyard connector core
//!
//! The seam between the serving core and an agent executor. An executor
//! creates and resumes sessions; each session runs one input at a time,
//! reports progress through registered hooks, and calls back into the
//! host through named capabilities (sub-session spawn, approvals, display).

pub mod events;
pub mod mock;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchyard_protocol::{CancelLevel, DisplayLevel};
use thiserror::Error;

pub use mock::{MockExecutor, MockSession};

/// Capability names understood by executors
pub const SPAWN_CAPABILITY: &str = "session.spawn";
pub const APPROVAL_CAPABILITY: &str = "approval";
pub const DISPLAY_CAPABILITY: &str = "display";

/// Errors that can occur inside an executor
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Capability not registered: {0}")]
    CapabilityMissing(String),
}

/// One message of a session's conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: String,
    pub content: Value,
}

impl TranscriptEntry {
    pub fn text(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Value::String(text.into()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub working_dir: String,
    pub profile: Option<String>,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResumeRequest {
    pub session_id: String,
    pub working_dir: String,
    pub profile: Option<String>,
    pub transcript: Vec<TranscriptEntry>,
}

/// Receives hook events. Called synchronously from inside the executor,
/// so implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &str, payload: Value);
}

/// Handle returned by `register_hook`, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(pub u64);

#[derive(Clone)]
pub struct HookSpec {
    pub name: String,
    pub events: Vec<String>,
    pub sink: Arc<dyn EventSink>,
}

impl HookSpec {
    pub fn new(name: impl Into<String>, events: &[&str], sink: Arc<dyn EventSink>) -> Self {
        Self {
            name: name.into(),
            events: events.iter().map(|e| e.to_string()).collect(),
            sink,
        }
    }

    pub fn wants(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == event)
    }
}

impl fmt::Debug for HookSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookSpec")
            .field("name", &self.name)
            .field("events", &self.events)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub agent_name: String,
    pub instruction: String,
    pub parent_session_id: String,
    pub sub_session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnResult {
    pub response: String,
    pub session_id: String,
}

/// Creates a nested session on behalf of a running one
#[async_trait]
pub trait SpawnHandler: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnResult, ConnectorError>;
}

/// Answers approval prompts raised mid-turn. Timeouts resolve to `default`.
#[async_trait]
pub trait ApprovalProvider: Send + Sync {
    async fn request_approval(
        &self,
        prompt: &str,
        options: &[String],
        timeout: Duration,
        default: &str,
    ) -> String;
}

pub trait DisplaySink: Send + Sync {
    fn show_message(&self, message: &str, level: DisplayLevel, source: &str);
}

#[derive(Clone)]
pub enum Capability {
    Spawn(Arc<dyn SpawnHandler>),
    Approval(Arc<dyn ApprovalProvider>),
    Display(Arc<dyn DisplaySink>),
}

impl Capability {
    pub fn kind(&self) -> &'static str {
        match self {
            Capability::Spawn(_) => SPAWN_CAPABILITY,
            Capability::Approval(_) => APPROVAL_CAPABILITY,
            Capability::Display(_) => DISPLAY_CAPABILITY,
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capability({})", self.kind())
    }
}

/// An agent backend able to host sessions
#[async_trait]
pub trait Executor: Send + Sync {
    async fn create_session(
        &self,
        request: CreateRequest,
    ) -> Result<Arc<dyn ExecutorSession>, ConnectorError>;

    /// Rebuild a session from persisted history after a restart
    async fn resume_session(
        &self,
        request: ResumeRequest,
    ) -> Result<Arc<dyn ExecutorSession>, ConnectorError>;
}

/// One live executor session.
///
/// `run` is never called concurrently for the same session by the server;
/// `cancel` may be called at any time from another task.
#[async_trait]
pub trait ExecutorSession: Send + Sync {
    fn session_id(&self) -> &str;

    fn project_id(&self) -> &str;

    async fn run(&self, input: &str) -> Result<String, ConnectorError>;

    async fn cancel(&self, level: CancelLevel);

    fn register_hook(&self, hook: HookSpec) -> HookId;

    fn unregister_hook(&self, id: HookId) -> bool;

    /// Install or replace a named capability
    fn register_capability(&self, name: &str, capability: Capability);

    async fn messages(&self) -> Vec<TranscriptEntry>;

    async fn cleanup(&self);
}
