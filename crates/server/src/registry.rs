//! Session registry.
//!
//! Owns every per-session map: live handles, workers, in-flight reconnect
//! attempts, approval systems, surface relays and tombstones. All maps are
//! `DashMap`s; operations that must be atomic with respect to each other
//! (tombstone vs. install, reconnect lock acquire/release) go through the
//! entry API on a single map.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::json;
use switchyard_connector_core::{
    events, Capability, CreateRequest, Executor, ExecutorSession, HookId, HookSpec, ResumeRequest,
    SpawnRequest, SpawnResult, APPROVAL_CAPABILITY, DISPLAY_CAPABILITY, SPAWN_CAPABILITY,
};
use switchyard_protocol::{CancelLevel, SessionHistoryEntry, SessionSummary, WorkerState};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::approval::{ApprovalMode, ApprovalSystem};
use crate::error::SessionError;
use crate::fanout::EventQueue;
use crate::paths;
use crate::persistence::{self, PersistCommand, StoredSession};
use crate::session::{SessionHandle, SessionMeta};
use crate::session_worker::SessionWorker;
use crate::spawn::RegistrySpawner;
use crate::surface::{ChildLineage, RelayDisplay, RelaySink, Surface, SurfaceRelay};

type ReconnectOutcome = Result<Arc<SessionHandle>, SessionError>;
type ReconnectFuture = Shared<BoxFuture<'static, ReconnectOutcome>>;

struct ReconnectAttempt {
    attempt_id: u64,
    future: ReconnectFuture,
}

/// Registry settings that don't come from a client
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Store to reload sessions from; `None` disables reconnect
    pub db_path: Option<PathBuf>,
    pub default_profile: Option<String>,
    pub work_queue_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            default_profile: None,
            work_queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub profile: Option<String>,
    pub surface: Option<Surface>,
}

/// How a freshly installed session is wired to clients
enum Wiring {
    Detached,
    Surface(Surface),
    /// Sub-session streaming through its parent's relay
    Inherit {
        relay: Option<Arc<SurfaceRelay>>,
        approval: Option<Arc<ApprovalSystem>>,
        parent_id: String,
    },
}

pub struct Registry {
    me: Weak<Registry>,
    executor: Arc<dyn Executor>,
    config: RegistryConfig,
    persist_tx: mpsc::Sender<PersistCommand>,
    sessions: DashMap<String, Arc<SessionHandle>>,
    workers: DashMap<String, Arc<SessionWorker>>,
    reconnects: DashMap<String, ReconnectAttempt>,
    next_attempt: AtomicU64,
    approvals: DashMap<String, Arc<ApprovalSystem>>,
    relays: DashMap<String, Arc<SurfaceRelay>>,
    hooks: DashMap<String, HookId>,
    tombstones: DashSet<String>,
}

/// Session ids are `[A-Za-z0-9_-]+`
pub fn valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn discard_worker(worker: Arc<SessionWorker>) {
    tokio::spawn(async move { worker.abort().await });
}

impl Registry {
    pub fn new(
        executor: Arc<dyn Executor>,
        config: RegistryConfig,
        persist_tx: mpsc::Sender<PersistCommand>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            executor,
            config,
            persist_tx,
            sessions: DashMap::new(),
            workers: DashMap::new(),
            reconnects: DashMap::new(),
            next_attempt: AtomicU64::new(1),
            approvals: DashMap::new(),
            relays: DashMap::new(),
            hooks: DashMap::new(),
            tombstones: DashSet::new(),
        })
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.get(session_id).map(|h| h.value().clone())
    }

    pub fn is_ended(&self, session_id: &str) -> bool {
        self.tombstones.contains(session_id)
    }

    // -- create ---------------------------------------------------------------

    /// Start a new session. The worker is started eagerly; no prompt runs.
    pub async fn create(
        &self,
        working_dir: &str,
        options: CreateOptions,
    ) -> Result<Arc<SessionHandle>, SessionError> {
        if working_dir.contains('\0') {
            return Err(SessionError::InvalidWorkingDir);
        }
        let working_dir = paths::expand_working_dir(working_dir);
        let profile = options
            .profile
            .or_else(|| self.config.default_profile.clone());

        let session = self
            .executor
            .create_session(CreateRequest {
                working_dir: working_dir.clone(),
                profile: profile.clone(),
                parent_id: None,
            })
            .await
            .map_err(|e| SessionError::CreateFailed(e.to_string()))?;

        let wiring = match options.surface {
            Some(surface) => Wiring::Surface(surface),
            None => Wiring::Detached,
        };
        let handle = self.install(
            session,
            SessionMeta {
                working_dir,
                profile,
                ..SessionMeta::default()
            },
            wiring,
        )?;
        self.persist_create(&handle).await;

        info!(
            component = "registry",
            event = "session.created",
            session_id = %handle.session_id(),
            project_id = %handle.project_id(),
            working_dir = %handle.working_dir(),
            "Session created"
        );
        Ok(handle)
    }

    // -- resume / reconnect -----------------------------------------------------

    /// Attach to a session by id, reconnecting it if it isn't live.
    /// `working_dir` overrides the stored directory when the session has
    /// to be reloaded.
    pub async fn resume(
        &self,
        session_id: &str,
        working_dir: Option<&str>,
        surface: Option<Surface>,
    ) -> Result<Arc<SessionHandle>, SessionError> {
        if !valid_session_id(session_id) {
            return Err(SessionError::InvalidSessionId);
        }
        if working_dir.is_some_and(|dir| dir.contains('\0')) {
            return Err(SessionError::InvalidWorkingDir);
        }
        let handle = match self.get(session_id) {
            Some(handle) => {
                self.ensure_worker(&handle)?;
                handle
            }
            None => {
                let hint = working_dir
                    .filter(|dir| !dir.is_empty())
                    .map(paths::expand_working_dir);
                self.reconnect_with(session_id, hint).await?
            }
        };
        if let Some(surface) = surface {
            self.wire_surface(&handle, surface);
        }
        Ok(handle)
    }

    /// Bring a cold session back. Concurrent callers share one attempt.
    pub async fn reconnect(&self, session_id: &str) -> Result<Arc<SessionHandle>, SessionError> {
        self.reconnect_with(session_id, None).await
    }

    async fn reconnect_with(
        &self,
        session_id: &str,
        working_dir: Option<String>,
    ) -> ReconnectOutcome {
        if self.tombstones.contains(session_id) {
            return Err(SessionError::SessionEnded(session_id.to_string()));
        }
        if let Some(handle) = self.get(session_id) {
            return Ok(handle);
        }
        let Some(registry) = self.me.upgrade() else {
            return Err(SessionError::UnknownSession(session_id.to_string()));
        };

        let future = match self.reconnects.entry(session_id.to_string()) {
            Entry::Occupied(entry) => {
                debug!(
                    component = "registry",
                    event = "session.reconnect_joined",
                    session_id = %session_id,
                    "Joining in-flight reconnect"
                );
                entry.get().future.clone()
            }
            Entry::Vacant(entry) => {
                let attempt_id = self.next_attempt.fetch_add(1, Ordering::SeqCst);
                let id = session_id.to_string();
                let future = async move {
                    let outcome = registry.load_and_resume(&id, working_dir).await;
                    registry
                        .reconnects
                        .remove_if(&id, |_, attempt| attempt.attempt_id == attempt_id);
                    outcome
                }
                .boxed()
                .shared();
                entry.insert(ReconnectAttempt {
                    attempt_id,
                    future: future.clone(),
                });
                future
            }
        };

        future.await
    }

    async fn load_and_resume(
        &self,
        session_id: &str,
        working_dir: Option<String>,
    ) -> ReconnectOutcome {
        info!(
            component = "registry",
            event = "session.reconnect_started",
            session_id = %session_id,
            "Reconnecting session"
        );
        paths::ensure_process_cwd();

        let stored = self.load_stored(session_id).await?;
        if stored.ended {
            self.tombstones.insert(session_id.to_string());
            return Err(SessionError::SessionEnded(session_id.to_string()));
        }

        let working_dir = working_dir.unwrap_or_else(|| stored.working_dir.clone());
        let working_dir = if Path::new(&working_dir).is_dir() {
            working_dir
        } else {
            let home = paths::home_dir().to_string_lossy().into_owned();
            warn!(
                component = "registry",
                event = "session.working_dir_missing",
                session_id = %session_id,
                requested = %working_dir,
                fallback = %home,
                "Stored working directory is gone, using home"
            );
            home
        };

        let session = self
            .executor
            .resume_session(ResumeRequest {
                session_id: session_id.to_string(),
                working_dir: working_dir.clone(),
                profile: stored.profile.clone(),
                transcript: stored.transcript,
            })
            .await
            .map_err(|e| {
                warn!(
                    component = "registry",
                    event = "session.reconnect_failed",
                    session_id = %session_id,
                    error = %e,
                    "Executor could not resume session"
                );
                SessionError::UnknownSession(session_id.to_string())
            })?;

        let handle = self.install(
            session.clone(),
            SessionMeta {
                working_dir,
                profile: stored.profile,
                parent_id: stored.parent_id,
                created_at: Some(stored.created_at),
                resumed: true,
                turns_completed: stored.turn_count,
            },
            Wiring::Detached,
        );
        let handle = match handle {
            Ok(handle) => handle,
            Err(err) => {
                session.cleanup().await;
                return Err(err);
            }
        };
        self.persist_create(&handle).await;

        info!(
            component = "registry",
            event = "session.reconnected",
            session_id = %session_id,
            turns = handle.turns_completed(),
            "Session reconnected"
        );
        Ok(handle)
    }

    async fn load_stored(&self, session_id: &str) -> Result<StoredSession, SessionError> {
        let unknown = || SessionError::UnknownSession(session_id.to_string());
        let Some(db_path) = self.config.db_path.clone() else {
            return Err(unknown());
        };
        match persistence::load_session(db_path, session_id).await {
            Ok(Some(stored)) => Ok(stored),
            Ok(None) => Err(unknown()),
            Err(e) => {
                warn!(
                    component = "registry",
                    event = "session.load_failed",
                    session_id = %session_id,
                    error = %e,
                    "Failed to load stored session"
                );
                Err(unknown())
            }
        }
    }

    // -- install / wiring ---------------------------------------------------------

    fn install(
        &self,
        session: Arc<dyn ExecutorSession>,
        meta: SessionMeta,
        wiring: Wiring,
    ) -> Result<Arc<SessionHandle>, SessionError> {
        let handle = Arc::new(SessionHandle::new(session.clone(), meta));
        let session_id = handle.session_id().to_string();

        session.register_capability(
            SPAWN_CAPABILITY,
            Capability::Spawn(Arc::new(RegistrySpawner::new(
                self.me.clone(),
                session_id.clone(),
            ))),
        );

        match wiring {
            Wiring::Detached => {
                session.register_capability(
                    APPROVAL_CAPABILITY,
                    Capability::Approval(Arc::new(ApprovalSystem::auto())),
                );
            }
            Wiring::Surface(surface) => self.wire_surface(&handle, surface),
            Wiring::Inherit {
                relay,
                approval,
                parent_id,
            } => {
                let approval = approval.unwrap_or_else(|| Arc::new(ApprovalSystem::auto()));
                session.register_capability(APPROVAL_CAPABILITY, Capability::Approval(approval));
                if let Some(relay) = relay {
                    let hook = session.register_hook(HookSpec::new(
                        "surface-stream",
                        events::ALL_EVENTS,
                        RelaySink::new(
                            relay.clone(),
                            Some(ChildLineage {
                                session_id: session_id.clone(),
                                parent_id,
                            }),
                        ),
                    ));
                    session.register_capability(
                        DISPLAY_CAPABILITY,
                        Capability::Display(RelayDisplay::new(relay.clone())),
                    );
                    self.hooks.insert(session_id.clone(), hook);
                    self.relays.insert(session_id.clone(), relay);
                }
            }
        }

        let worker = Arc::new(SessionWorker::spawn(
            handle.clone(),
            self.config.work_queue_capacity,
            self.persist_tx.clone(),
        ));

        // The tombstone check and both inserts share the sessions entry lock,
        // so a concurrent `end` either sees this handle and its worker or we
        // see its tombstone.
        match self.sessions.entry(session_id.clone()) {
            Entry::Vacant(entry) if !self.tombstones.contains(&session_id) => {
                self.workers.insert(session_id.clone(), worker);
                entry.insert(handle.clone());
                Ok(handle)
            }
            Entry::Occupied(entry) => {
                // Lost a race with another install; keep the first one.
                let existing = entry.get().clone();
                drop(entry);
                discard_worker(worker);
                Ok(existing)
            }
            Entry::Vacant(entry) => {
                drop(entry);
                discard_worker(worker);
                self.approvals.remove(&session_id);
                self.relays.remove(&session_id);
                if let Some((_, hook)) = self.hooks.remove(&session_id) {
                    session.unregister_hook(hook);
                }
                Err(SessionError::SessionEnded(session_id))
            }
        }
    }

    /// Point the session's event stream at `surface`, registering the hook
    /// only the first time.
    fn wire_surface(&self, handle: &Arc<SessionHandle>, surface: Surface) {
        let session_id = handle.session_id().to_string();
        let session = handle.executor();

        let relay = match self.relays.entry(session_id.clone()) {
            Entry::Occupied(entry) => {
                let relay = entry.get().clone();
                relay.retarget(surface.events.clone());
                debug!(
                    component = "registry",
                    event = "session.rewired",
                    session_id = %session_id,
                    "Surface re-wired to existing hooks"
                );
                relay
            }
            Entry::Vacant(entry) => {
                let relay = SurfaceRelay::new(surface.events.clone());
                let hook = session.register_hook(HookSpec::new(
                    "surface-stream",
                    events::ALL_EVENTS,
                    RelaySink::new(relay.clone(), None),
                ));
                self.hooks.insert(session_id.clone(), hook);
                session.register_capability(
                    DISPLAY_CAPABILITY,
                    Capability::Display(RelayDisplay::new(relay.clone())),
                );
                entry.insert(relay.clone());
                relay
            }
        };

        let mode = if surface.auto_approve {
            ApprovalMode::Auto
        } else {
            ApprovalMode::Interactive
        };
        let approval = Arc::new(ApprovalSystem::new(mode, Some(relay.approval_notifier())));
        session.register_capability(APPROVAL_CAPABILITY, Capability::Approval(approval.clone()));
        if let Some(previous) = self.approvals.insert(session_id, approval) {
            previous.abandon_all();
        }
    }

    /// Stop streaming to `queue` if it is still the session's target.
    /// Approvals waiting on that client fall back to their defaults.
    pub fn detach_surface(&self, session_id: &str, queue: &EventQueue) {
        let Some(relay) = self.relays.get(session_id).map(|r| r.value().clone()) else {
            return;
        };
        if !relay.is_targeting(queue) {
            return;
        }
        relay.detach();
        if let Some(approval) = self.approvals.get(session_id) {
            approval.abandon_all();
        }
        debug!(
            component = "registry",
            event = "session.surface_detached",
            session_id = %session_id,
            "Surface detached"
        );
    }

    /// Worker for a live handle, restarting it after `stop`. Refuses once
    /// the session has been ended or replaced.
    fn ensure_worker(
        &self,
        handle: &Arc<SessionHandle>,
    ) -> Result<Arc<SessionWorker>, SessionError> {
        let session_id = handle.session_id();
        let ended = || SessionError::SessionEnded(session_id.to_string());
        let live = self
            .sessions
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), handle));
        if !live {
            return Err(ended());
        }

        // `end` tombstones before it removes the worker, so checking under
        // the workers entry lock means any worker we hand out gets drained.
        match self.workers.entry(session_id.to_string()) {
            Entry::Occupied(_) | Entry::Vacant(_) if self.tombstones.contains(session_id) => {
                Err(ended())
            }
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let worker = Arc::new(SessionWorker::spawn(
                    handle.clone(),
                    self.config.work_queue_capacity,
                    self.persist_tx.clone(),
                ));
                entry.insert(worker.clone());
                Ok(worker)
            }
        }
    }

    async fn persist_create(&self, handle: &SessionHandle) {
        let _ = self
            .persist_tx
            .send(PersistCommand::SessionCreate {
                id: handle.session_id().to_string(),
                project_id: handle.project_id().to_string(),
                working_dir: handle.working_dir().to_string(),
                profile: handle.profile().map(str::to_string),
                parent_id: handle.parent_id().map(str::to_string),
            })
            .await;
    }

    // -- execute / cancel -------------------------------------------------------

    /// Run one input on the session, reconnecting a cold session first.
    pub async fn execute(&self, session_id: &str, input: &str) -> Result<String, SessionError> {
        if self.tombstones.contains(session_id) {
            return Err(SessionError::SessionEnded(session_id.to_string()));
        }

        let handle = match self.get(session_id) {
            Some(handle) => handle,
            None => self.reconnect(session_id).await.map_err(|e| {
                if e.is_permanent() {
                    e
                } else {
                    SessionError::UnknownSession(session_id.to_string())
                }
            })?,
        };

        let worker = self.ensure_worker(&handle)?;
        worker.enqueue(input.to_string()).await
    }

    /// Ask the executor to stop the running turn. Queued work is untouched.
    pub async fn cancel(&self, session_id: &str, level: CancelLevel) {
        let Some(handle) = self.get(session_id) else {
            debug!(
                component = "registry",
                event = "session.cancel_ignored",
                session_id = %session_id,
                "Cancel for unknown session"
            );
            return;
        };
        info!(
            component = "registry",
            event = "session.cancel",
            session_id = %session_id,
            level = level.as_str(),
            "Cancelling current execution"
        );
        handle.executor().cancel(level).await;
    }

    pub fn resolve_approval(&self, session_id: &str, request_id: &str, choice: &str) -> bool {
        self.approvals
            .get(session_id)
            .map(|approval| approval.value().clone())
            .is_some_and(|approval| approval.handle_response(request_id, choice))
    }

    // -- end / stop -------------------------------------------------------------

    /// End a session for good. Idempotent; unknown ids are a no-op.
    pub async fn end(&self, session_id: &str) {
        let newly_ended = self.tombstones.insert(session_id.to_string());
        let handle = self.sessions.remove(session_id).map(|(_, h)| h);
        let worker = self.workers.remove(session_id).map(|(_, w)| w);

        if let Some(worker) = worker {
            worker.drain().await;
        }
        if let Some((_, approval)) = self.approvals.remove(session_id) {
            approval.abandon_all();
        }
        if let Some((_, hook)) = self.hooks.remove(session_id) {
            if let Some(handle) = &handle {
                handle.executor().unregister_hook(hook);
            }
        }
        if let Some((_, relay)) = self.relays.remove(session_id) {
            // Children share their parent's relay; only the owner detaches it.
            if handle.as_ref().is_some_and(|h| h.parent_id().is_none()) {
                relay.detach();
            }
        }
        if let Some(handle) = &handle {
            handle.executor().cleanup().await;
        }

        if newly_ended {
            let _ = self
                .persist_tx
                .send(PersistCommand::SessionEnd {
                    id: session_id.to_string(),
                })
                .await;
            info!(
                component = "registry",
                event = "session.ended",
                session_id = %session_id,
                was_live = handle.is_some(),
                "Session ended"
            );
        }
    }

    /// Drain every worker. Safe to call repeatedly or with no sessions.
    pub async fn stop(&self) {
        for approval in self.approvals.iter() {
            approval.abandon_all();
        }
        let ids: Vec<String> = self.workers.iter().map(|w| w.key().clone()).collect();
        let workers: Vec<Arc<SessionWorker>> = ids
            .iter()
            .filter_map(|id| self.workers.remove(id).map(|(_, w)| w))
            .collect();

        info!(
            component = "registry",
            event = "registry.stopping",
            workers = workers.len(),
            "Draining session workers"
        );
        futures::future::join_all(workers.iter().map(|w| w.drain())).await;
    }

    // -- listing ----------------------------------------------------------------

    pub fn list_active_sessions(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| {
                let handle = entry.value();
                match self.workers.get(entry.key()) {
                    Some(worker) => {
                        let snap = worker.snapshot();
                        handle.summary(snap.state, worker.queued(), snap.last_activity_at.clone())
                    }
                    None => handle.summary(WorkerState::Stopped, 0, None),
                }
            })
            .collect();
        summaries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        summaries
    }

    /// Stored sessions that can still be resumed, most recent first.
    /// Store failures are logged and yield an empty list.
    pub async fn list_session_history(&self) -> Vec<SessionHistoryEntry> {
        let Some(db_path) = self.config.db_path.clone() else {
            return Vec::new();
        };
        let stored = match persistence::list_sessions(db_path).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(
                    component = "registry",
                    event = "session.history_failed",
                    error = %e,
                    "Failed to list stored sessions"
                );
                return Vec::new();
            }
        };
        stored
            .into_iter()
            .filter(|s| !self.tombstones.contains(&s.id))
            .map(|s| SessionHistoryEntry {
                live: self.sessions.contains_key(&s.id),
                session_id: s.id,
                project_id: s.project_id,
                working_dir: s.working_dir,
                profile: s.profile,
                parent_id: s.parent_id,
                turn_count: s.turn_count,
                created_at: s.created_at,
                last_activity_at: s.last_activity_at,
            })
            .collect()
    }

    // -- spawn ------------------------------------------------------------------

    /// Create a sub-session of `parent_id`, run `instruction` on it, and
    /// report the fork on the parent's stream.
    pub async fn spawn_child(
        &self,
        parent_id: &str,
        request: SpawnRequest,
    ) -> Result<SpawnResult, SessionError> {
        let parent = self
            .get(parent_id)
            .ok_or_else(|| SessionError::UnknownSession(parent_id.to_string()))?;

        let session = self
            .executor
            .create_session(CreateRequest {
                working_dir: parent.working_dir().to_string(),
                profile: parent.profile().map(str::to_string),
                parent_id: Some(parent_id.to_string()),
            })
            .await
            .map_err(|e| SessionError::CreateFailed(e.to_string()))?;

        let relay = self.relays.get(parent_id).map(|r| r.value().clone());
        let approval = self.approvals.get(parent_id).map(|a| a.value().clone());
        let child = self.install(
            session,
            SessionMeta {
                working_dir: parent.working_dir().to_string(),
                profile: parent.profile().map(str::to_string),
                parent_id: Some(parent_id.to_string()),
                ..SessionMeta::default()
            },
            Wiring::Inherit {
                relay: relay.clone(),
                approval,
                parent_id: parent_id.to_string(),
            },
        )?;
        self.persist_create(&child).await;

        let child_id = child.session_id().to_string();
        info!(
            component = "registry",
            event = "session.spawned",
            session_id = %child_id,
            parent_id = %parent_id,
            agent = %request.agent_name,
            "Sub-session spawned"
        );
        if let Some(relay) = relay {
            relay.forward(
                events::AGENT_SPAWNED,
                json!({
                    "parent_id": parent_id,
                    "child_id": child_id,
                    "agent": request.agent_name,
                }),
            );
        }

        let response = self.execute(&child_id, &request.instruction).await?;
        Ok(SpawnResult {
            response,
            session_id: child_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::{ConnectionFanout, QueuedEvent};
    use crate::persistence::PersistenceWriter;
    use std::time::Duration;
    use switchyard_connector_core::mock::MockBehavior;
    use switchyard_connector_core::MockExecutor;
    use switchyard_protocol::server::ServerMessage;

    struct Fixture {
        executor: Arc<MockExecutor>,
        registry: Arc<Registry>,
        workdir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_behavior(MockBehavior::default())
        }

        fn with_behavior(behavior: MockBehavior) -> Self {
            let executor = Arc::new(MockExecutor::with_behavior(behavior));
            let (persist_tx, _persist_rx) = mpsc::channel(1024);
            let registry = Registry::new(executor.clone(), RegistryConfig::default(), persist_tx);
            Self {
                executor,
                registry,
                workdir: tempfile::tempdir().unwrap(),
            }
        }

        fn dir(&self) -> String {
            self.workdir.path().to_string_lossy().into_owned()
        }

        async fn create(&self, surface: Option<Surface>) -> String {
            let handle = self
                .registry
                .create(
                    &self.dir(),
                    CreateOptions {
                        profile: None,
                        surface,
                    },
                )
                .await
                .unwrap();
            handle.session_id().to_string()
        }
    }

    /// Translate everything currently sitting in a surface queue.
    fn drain(rx: &mut mpsc::Receiver<QueuedEvent>) -> Vec<ServerMessage> {
        let mut fanout = ConnectionFanout::new();
        let mut out = Vec::new();
        while let Ok(queued) = rx.try_recv() {
            if let QueuedEvent::Event { name, payload } = queued {
                out.extend(fanout.process(&name, &payload));
            }
        }
        out
    }

    fn text_for(msgs: &[ServerMessage], session: Option<&str>) -> String {
        msgs.iter()
            .filter_map(|m| match m {
                ServerMessage::ContentDelta {
                    delta, session_id, ..
                } if session_id.as_deref() == session => Some(delta.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn prompt_streams_and_completes_once() {
        let fx = Fixture::new();
        let (queue, mut rx) = EventQueue::bounded(1000);
        let id = fx.create(Some(Surface::new(queue, false))).await;

        let response = fx.registry.execute(&id, "hello").await.unwrap();
        assert_eq!(response, "echo:hello");

        let msgs = drain(&mut rx);
        assert_eq!(text_for(&msgs, None), "echo:hello");
        let completions: Vec<u64> = msgs
            .iter()
            .filter_map(|m| match m {
                ServerMessage::PromptComplete { turn_count } => Some(*turn_count),
                _ => None,
            })
            .collect();
        assert_eq!(completions, vec![1]);
        assert_eq!(fx.registry.get(&id).unwrap().turns_completed(), 1);
    }

    #[tokio::test]
    async fn executor_failure_reaches_only_its_caller() {
        let fx = Fixture::new();
        let id = fx.create(None).await;

        let err = fx.registry.execute(&id, "/fail boom").await.unwrap_err();
        assert!(matches!(err, SessionError::Executor(ref msg) if msg.contains("boom")));
        assert_eq!(fx.registry.execute(&id, "next").await.unwrap(), "echo:next");
    }

    #[tokio::test]
    async fn unknown_and_invalid_ids_are_rejected() {
        let fx = Fixture::new();

        let err = fx.registry.execute("missing", "hi").await.unwrap_err();
        assert_eq!(err, SessionError::UnknownSession("missing".into()));
        assert!(!err.is_permanent());

        let err = fx.registry.resume("../etc", None, None).await.unwrap_err();
        assert_eq!(err, SessionError::InvalidSessionId);

        let err = fx
            .registry
            .create("bad\0dir", CreateOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::InvalidWorkingDir);
    }

    #[tokio::test]
    async fn end_is_idempotent_and_tombstones() {
        let fx = Fixture::new();
        let id = fx.create(None).await;
        let mock = fx.executor.session(&id).unwrap();

        fx.registry.end(&id).await;
        fx.registry.end(&id).await;
        fx.registry.end("never-existed").await;

        assert!(mock.is_cleaned_up());
        assert!(fx.registry.get(&id).is_none());
        let err = fx.registry.reconnect(&id).await.unwrap_err();
        assert_eq!(err, SessionError::SessionEnded(id.clone()));
        assert!(err.is_permanent());
        let err = fx.registry.execute(&id, "hi").await.unwrap_err();
        assert_eq!(err, SessionError::SessionEnded(id.clone()));
        assert_eq!(fx.executor.resume_count(), 0);
    }

    #[tokio::test]
    async fn end_waits_for_queued_work() {
        let fx = Fixture::with_behavior(MockBehavior {
            run_delay: Duration::from_millis(30),
            ..MockBehavior::default()
        });
        let id = fx.create(None).await;

        let registry = fx.registry.clone();
        let run_id = id.clone();
        let pending = tokio::spawn(async move { registry.execute(&run_id, "slow").await });
        tokio::time::sleep(Duration::from_millis(5)).await;

        fx.registry.end(&id).await;
        assert_eq!(pending.await.unwrap().unwrap(), "echo:slow");
    }

    #[tokio::test]
    async fn cancel_settles_running_prompt() {
        let fx = Fixture::with_behavior(MockBehavior {
            run_delay: Duration::from_secs(30),
            ..MockBehavior::default()
        });
        let id = fx.create(None).await;
        let mock = fx.executor.session(&id).unwrap();

        let registry = fx.registry.clone();
        let run_id = id.clone();
        let pending = tokio::spawn(async move { registry.execute(&run_id, "long").await });
        while mock.journal().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        fx.registry.cancel(&id, CancelLevel::Immediate).await;
        let result = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(SessionError::Cancelled));
        assert_eq!(mock.cancel_levels(), vec![CancelLevel::Immediate]);

        // Cancelling an unknown session is a no-op.
        fx.registry.cancel("nobody", CancelLevel::Graceful).await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let empty = Fixture::new();
        empty.registry.stop().await;
        empty.registry.stop().await;

        let fx = Fixture::new();
        let a = fx.create(None).await;
        let b = fx.create(None).await;
        fx.registry.stop().await;
        fx.registry.stop().await;

        let states: Vec<_> = fx
            .registry
            .list_active_sessions()
            .into_iter()
            .map(|s| (s.session_id, s.state))
            .collect();
        assert_eq!(states.len(), 2);
        assert!(states.contains(&(a, WorkerState::Stopped)));
        assert!(states.contains(&(b, WorkerState::Stopped)));
    }

    #[tokio::test]
    async fn execute_restarts_worker_after_stop() {
        let fx = Fixture::new();
        let id = fx.create(None).await;
        fx.registry.stop().await;
        assert_eq!(fx.registry.execute(&id, "again").await.unwrap(), "echo:again");
    }

    #[tokio::test]
    async fn listing_reports_idle_sessions() {
        let fx = Fixture::new();
        let first = fx.create(None).await;
        let second = fx.create(None).await;
        fx.registry.execute(&second, "hi").await.unwrap();

        let list = fx.registry.list_active_sessions();
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|s| s.state == WorkerState::Idle));
        let turns: Vec<_> = list
            .iter()
            .map(|s| (s.session_id.clone(), s.turns_completed))
            .collect();
        assert!(turns.contains(&(first, 0)));
        assert!(turns.contains(&(second, 1)));
    }

    #[tokio::test]
    async fn rewire_swaps_target_without_new_hooks() {
        let fx = Fixture::new();
        let (old_queue, mut old_rx) = EventQueue::bounded(1000);
        let id = fx.create(Some(Surface::new(old_queue, false))).await;
        let mock = fx.executor.session(&id).unwrap();
        assert_eq!(mock.hook_count(), 1);

        let (new_queue, mut new_rx) = EventQueue::bounded(1000);
        fx.registry
            .resume(&id, None, Some(Surface::new(new_queue, false)))
            .await
            .unwrap();
        assert_eq!(mock.hook_count(), 1);

        fx.registry.execute(&id, "after refresh").await.unwrap();
        assert!(drain(&mut old_rx).is_empty());
        assert_eq!(text_for(&drain(&mut new_rx), None), "echo:after refresh");
    }

    #[tokio::test]
    async fn detach_only_applies_to_current_target() {
        let fx = Fixture::new();
        let (first, mut first_rx) = EventQueue::bounded(1000);
        let id = fx.create(Some(Surface::new(first.clone(), false))).await;
        let (second, mut second_rx) = EventQueue::bounded(1000);
        fx.registry
            .resume(&id, None, Some(Surface::new(second.clone(), false)))
            .await
            .unwrap();

        // A stale connection going away must not cut off the new one.
        fx.registry.detach_surface(&id, &first);
        fx.registry.execute(&id, "one").await.unwrap();
        assert_eq!(text_for(&drain(&mut second_rx), None), "echo:one");

        fx.registry.detach_surface(&id, &second);
        fx.registry.execute(&id, "two").await.unwrap();
        assert!(drain(&mut second_rx).is_empty());
        assert!(drain(&mut first_rx).is_empty());
    }

    #[tokio::test]
    async fn approval_round_trip_through_surface() {
        let fx = Fixture::new();
        let (queue, mut rx) = EventQueue::bounded(1000);
        let id = fx.create(Some(Surface::new(queue, false))).await;

        let registry = fx.registry.clone();
        let run_id = id.clone();
        let pending = tokio::spawn(async move { registry.execute(&run_id, "/approve ship it?").await });

        let request_id = loop {
            match rx.recv().await {
                Some(QueuedEvent::Event { name, payload }) if name == events::APPROVAL_REQUEST => {
                    assert_eq!(payload["prompt"], "ship it?");
                    break payload["request_id"].as_str().unwrap().to_string();
                }
                Some(_) => continue,
                None => panic!("queue closed"),
            }
        };

        assert!(fx.registry.resolve_approval(&id, &request_id, "allow"));
        assert!(!fx.registry.resolve_approval(&id, &request_id, "deny"));
        assert_eq!(pending.await.unwrap().unwrap(), "approval:allow");
    }

    #[tokio::test]
    async fn sessions_without_interactive_surface_auto_approve() {
        let fx = Fixture::new();
        let detached = fx.create(None).await;
        assert_eq!(
            fx.registry.execute(&detached, "/approve go").await.unwrap(),
            "approval:allow"
        );

        let (queue, _rx) = EventQueue::bounded(1000);
        let auto = fx.create(Some(Surface::new(queue, true))).await;
        assert_eq!(
            fx.registry.execute(&auto, "/approve go").await.unwrap(),
            "approval:allow"
        );
    }

    #[tokio::test]
    async fn delegate_forks_child_with_lineage() {
        let fx = Fixture::new();
        let (queue, mut rx) = EventQueue::bounded(1000);
        let root = fx.create(Some(Surface::new(queue, false))).await;

        let response = fx
            .registry
            .execute(&root, "/delegate helper summarize")
            .await
            .unwrap();
        assert_eq!(response, "delegated:echo:summarize");

        let msgs = drain(&mut rx);
        let call_id = msgs
            .iter()
            .find_map(|m| match m {
                ServerMessage::ToolCall {
                    tool_call_id,
                    tool_name,
                    ..
                } if tool_name == "delegate" => Some(tool_call_id.clone()),
                _ => None,
            })
            .unwrap();
        let (child, fork_call) = msgs
            .iter()
            .find_map(|m| match m {
                ServerMessage::SessionFork {
                    parent_id,
                    child_id,
                    agent,
                    parent_tool_call_id,
                } => {
                    assert_eq!(parent_id, &root);
                    assert_eq!(agent, "helper");
                    Some((child_id.clone(), parent_tool_call_id.clone()))
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(fork_call, Some(call_id));
        assert_eq!(text_for(&msgs, Some(&child)), "echo:summarize");
        assert_eq!(text_for(&msgs, None), "delegated:echo:summarize");

        let completions = msgs
            .iter()
            .filter(|m| matches!(m, ServerMessage::PromptComplete { .. }))
            .count();
        assert_eq!(completions, 1);

        let child_handle = fx.registry.get(&child).unwrap();
        assert_eq!(child_handle.parent_id(), Some(root.as_str()));
        assert_eq!(child_handle.working_dir(), fx.dir());
    }

    fn store_config(db_path: PathBuf) -> RegistryConfig {
        RegistryConfig {
            db_path: Some(db_path),
            ..RegistryConfig::default()
        }
    }

    #[tokio::test]
    async fn concurrent_reconnects_resume_once() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("switchyard.db");
        persistence::init_store(&db_path).unwrap();
        let (persist_tx, persist_rx) = persistence::create_persistence_channel();
        tokio::spawn(PersistenceWriter::new(persist_rx, db_path.clone()).run());

        let before = Registry::new(
            Arc::new(MockExecutor::new()),
            store_config(db_path.clone()),
            persist_tx.clone(),
        );
        let id = before
            .create(&dir.path().to_string_lossy(), CreateOptions::default())
            .await
            .unwrap()
            .session_id()
            .to_string();
        before.execute(&id, "remember me").await.unwrap();
        persistence::flush(&persist_tx).await;

        // Fresh registry standing in for a restarted process.
        let executor = Arc::new(MockExecutor::with_behavior(MockBehavior {
            resume_delay: Duration::from_millis(50),
            ..MockBehavior::default()
        }));
        let after = Registry::new(executor.clone(), store_config(db_path), persist_tx);

        let results =
            futures::future::join_all((0..8).map(|_| after.reconnect(&id))).await;
        let handles: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(executor.resume_count(), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert!(handles[0].resumed());
        assert_eq!(handles[0].turns_completed(), 1);
        assert_eq!(after.execute(&id, "again").await.unwrap(), "echo:again");
    }

    #[tokio::test]
    async fn failed_reconnect_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("switchyard.db");
        persistence::init_store(&db_path).unwrap();
        let (persist_tx, persist_rx) = persistence::create_persistence_channel();
        tokio::spawn(PersistenceWriter::new(persist_rx, db_path.clone()).run());

        let before = Registry::new(
            Arc::new(MockExecutor::new()),
            store_config(db_path.clone()),
            persist_tx.clone(),
        );
        let id = before
            .create(&dir.path().to_string_lossy(), CreateOptions::default())
            .await
            .unwrap()
            .session_id()
            .to_string();
        persistence::flush(&persist_tx).await;

        let executor = Arc::new(MockExecutor::with_behavior(MockBehavior {
            fail_resume: true,
            ..MockBehavior::default()
        }));
        let after = Registry::new(executor.clone(), store_config(db_path), persist_tx);

        let err = after.reconnect(&id).await.unwrap_err();
        assert_eq!(err, SessionError::UnknownSession(id.clone()));

        executor.set_behavior(MockBehavior::default());
        assert!(after.reconnect(&id).await.is_ok());
        assert_eq!(executor.resume_count(), 2);
    }

    #[tokio::test]
    async fn ended_record_is_permanent_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("switchyard.db");
        persistence::init_store(&db_path).unwrap();
        let (persist_tx, persist_rx) = persistence::create_persistence_channel();
        tokio::spawn(PersistenceWriter::new(persist_rx, db_path.clone()).run());

        let before = Registry::new(
            Arc::new(MockExecutor::new()),
            store_config(db_path.clone()),
            persist_tx.clone(),
        );
        let id = before
            .create(&dir.path().to_string_lossy(), CreateOptions::default())
            .await
            .unwrap()
            .session_id()
            .to_string();
        before.end(&id).await;
        persistence::flush(&persist_tx).await;

        let executor = Arc::new(MockExecutor::new());
        let after = Registry::new(executor.clone(), store_config(db_path), persist_tx);
        let err = after
            .resume(&id, None, None)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::SessionEnded(id.clone()));
        assert!(after.is_ended(&id));
        assert_eq!(executor.resume_count(), 0);
    }

    #[tokio::test]
    async fn end_unregisters_stream_hooks() {
        let fx = Fixture::new();
        let (queue, mut rx) = EventQueue::bounded(1000);
        let root = fx.create(Some(Surface::new(queue, false))).await;
        let response = fx
            .registry
            .execute(&root, "/delegate helper tidy")
            .await
            .unwrap();
        assert_eq!(response, "delegated:echo:tidy");
        let child = drain(&mut rx)
            .into_iter()
            .find_map(|m| match m {
                ServerMessage::SessionFork { child_id, .. } => Some(child_id),
                _ => None,
            })
            .unwrap();
        let root_mock = fx.executor.session(&root).unwrap();
        let child_mock = fx.executor.session(&child).unwrap();
        assert_eq!(root_mock.hook_count(), 1);
        assert_eq!(child_mock.hook_count(), 1);

        fx.registry.end(&child).await;
        assert_eq!(child_mock.hook_count(), 0);
        assert_eq!(root_mock.hook_count(), 1);

        fx.registry.end(&root).await;
        assert_eq!(root_mock.hook_count(), 0);
    }

    #[tokio::test]
    async fn stale_handle_cannot_restart_worker_after_end() {
        let fx = Fixture::new();
        let id = fx.create(None).await;
        let handle = fx.registry.get(&id).unwrap();
        let mock = fx.executor.session(&id).unwrap();

        fx.registry.end(&id).await;

        let err = fx.registry.ensure_worker(&handle).unwrap_err();
        assert_eq!(err, SessionError::SessionEnded(id.clone()));
        assert!(!fx.registry.workers.contains_key(&id));
        assert!(mock.journal().is_empty());
    }

    #[tokio::test]
    async fn cancel_leaves_queued_work_alone() {
        let fx = Fixture::with_behavior(MockBehavior {
            run_delay: Duration::from_millis(50),
            ..MockBehavior::default()
        });
        let id = fx.create(None).await;
        let mock = fx.executor.session(&id).unwrap();

        let registry = fx.registry.clone();
        let run_id = id.clone();
        let first = tokio::spawn(async move { registry.execute(&run_id, "first").await });
        while mock.journal().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let registry = fx.registry.clone();
        let run_id = id.clone();
        let second = tokio::spawn(async move { registry.execute(&run_id, "second").await });
        while fx.registry.list_active_sessions()[0].queued == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        fx.registry.cancel(&id, CancelLevel::Graceful).await;

        assert_eq!(first.await.unwrap(), Err(SessionError::Cancelled));
        assert_eq!(second.await.unwrap().unwrap(), "echo:second");
        assert_eq!(
            mock.journal(),
            vec!["start:first", "end:first", "start:second", "end:second"]
        );
    }

    #[tokio::test]
    async fn reconnect_falls_back_to_home_when_dir_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("switchyard.db");
        persistence::init_store(&db_path).unwrap();
        let (persist_tx, persist_rx) = persistence::create_persistence_channel();
        tokio::spawn(PersistenceWriter::new(persist_rx, db_path.clone()).run());

        let project = dir.path().join("project");
        std::fs::create_dir(&project).unwrap();
        let before = Registry::new(
            Arc::new(MockExecutor::new()),
            store_config(db_path.clone()),
            persist_tx.clone(),
        );
        let id = before
            .create(&project.to_string_lossy(), CreateOptions::default())
            .await
            .unwrap()
            .session_id()
            .to_string();
        persistence::flush(&persist_tx).await;
        std::fs::remove_dir(&project).unwrap();

        let after = Registry::new(
            Arc::new(MockExecutor::new()),
            store_config(db_path),
            persist_tx,
        );
        let handle = after.reconnect(&id).await.unwrap();
        assert_eq!(
            handle.working_dir(),
            paths::home_dir().to_string_lossy().as_ref()
        );
    }

    #[tokio::test]
    async fn history_lists_resumable_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("switchyard.db");
        persistence::init_store(&db_path).unwrap();
        let (persist_tx, persist_rx) = persistence::create_persistence_channel();
        tokio::spawn(PersistenceWriter::new(persist_rx, db_path.clone()).run());

        let before = Registry::new(
            Arc::new(MockExecutor::new()),
            store_config(db_path.clone()),
            persist_tx.clone(),
        );
        let cwd = dir.path().to_string_lossy().into_owned();
        let kept = before
            .create(&cwd, CreateOptions::default())
            .await
            .unwrap()
            .session_id()
            .to_string();
        let ended = before
            .create(&cwd, CreateOptions::default())
            .await
            .unwrap()
            .session_id()
            .to_string();
        before.execute(&kept, "hi").await.unwrap();
        before.end(&ended).await;
        persistence::flush(&persist_tx).await;

        let history = before.list_session_history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].session_id, kept);
        assert_eq!(history[0].turn_count, 1);
        assert!(history[0].live);

        let after = Registry::new(
            Arc::new(MockExecutor::new()),
            store_config(db_path),
            persist_tx,
        );
        let history = after.list_session_history().await;
        assert_eq!(history.len(), 1);
        assert!(!history[0].live);

        assert!(Fixture::new().registry.list_session_history().await.is_empty());
    }
}
