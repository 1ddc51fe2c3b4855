//! Session handle

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use switchyard_connector_core::ExecutorSession;
use switchyard_protocol::{SessionSummary, WorkerState};

use crate::persistence::now_iso8601;

/// Everything about a session that isn't the live executor
#[derive(Debug, Clone, Default)]
pub struct SessionMeta {
    pub working_dir: String,
    pub profile: Option<String>,
    pub parent_id: Option<String>,
    /// Set when restoring a stored session
    pub created_at: Option<String>,
    pub resumed: bool,
    pub turns_completed: u64,
}

/// One live session. Identity fields are immutable; the executor is only
/// driven (`run`) by the session's worker.
pub struct SessionHandle {
    session_id: String,
    project_id: String,
    working_dir: String,
    profile: Option<String>,
    parent_id: Option<String>,
    created_at: String,
    resumed: bool,
    turns_completed: AtomicU64,
    executor: Arc<dyn ExecutorSession>,
}

impl SessionHandle {
    pub fn new(executor: Arc<dyn ExecutorSession>, meta: SessionMeta) -> Self {
        Self {
            session_id: executor.session_id().to_string(),
            project_id: executor.project_id().to_string(),
            working_dir: meta.working_dir,
            profile: meta.profile,
            parent_id: meta.parent_id,
            created_at: meta.created_at.unwrap_or_else(now_iso8601),
            resumed: meta.resumed,
            turns_completed: AtomicU64::new(meta.turns_completed),
            executor,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn working_dir(&self) -> &str {
        &self.working_dir
    }

    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    /// True when this handle was rebuilt from storage
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    pub fn executor(&self) -> &Arc<dyn ExecutorSession> {
        &self.executor
    }

    pub fn turns_completed(&self) -> u64 {
        self.turns_completed.load(Ordering::SeqCst)
    }

    /// Bump after a successful turn; returns the new count
    pub(crate) fn record_turn(&self) -> u64 {
        self.turns_completed.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn summary(
        &self,
        state: WorkerState,
        queued: usize,
        last_activity_at: Option<String>,
    ) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            project_id: self.project_id.clone(),
            working_dir: self.working_dir.clone(),
            profile: self.profile.clone(),
            parent_id: self.parent_id.clone(),
            state,
            queued,
            turns_completed: self.turns_completed(),
            created_at: self.created_at.clone(),
            last_activity_at,
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("project_id", &self.project_id)
            .field("working_dir", &self.working_dir)
            .field("parent_id", &self.parent_id)
            .finish()
    }
}
