//! Session worker: one bounded FIFO queue and one task per session.
//!
//! Callers `enqueue` an input with a oneshot reply slot and await it. The
//! worker runs inputs strictly in queue order, so the executor never sees
//! two overlapping `run` calls for one session. Dropping the task (abort)
//! drops every outstanding reply sender, which callers observe as
//! `Cancelled`; a oneshot can only ever resolve once.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::FutureExt;
use switchyard_protocol::WorkerState;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::persistence::{now_iso8601, PersistCommand};
use crate::session::SessionHandle;

pub type WorkResult = Result<String, SessionError>;

#[derive(Debug)]
pub enum WorkItem {
    Run {
        input: String,
        reply: oneshot::Sender<WorkResult>,
    },
    /// Sentinel: finish what is queued ahead, then exit
    Stop,
}

/// Lock-free view of a worker for listings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerSnapshot {
    pub state: WorkerState,
    pub last_activity_at: Option<String>,
}

#[derive(Debug)]
pub struct SessionWorker {
    session_id: String,
    queue_tx: mpsc::Sender<WorkItem>,
    queued: Arc<AtomicUsize>,
    snapshot: Arc<ArcSwap<WorkerSnapshot>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionWorker {
    pub fn spawn(
        handle: Arc<SessionHandle>,
        capacity: usize,
        persist_tx: mpsc::Sender<PersistCommand>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(capacity.max(1));
        let queued = Arc::new(AtomicUsize::new(0));
        let snapshot = Arc::new(ArcSwap::from_pointee(WorkerSnapshot::default()));
        let session_id = handle.session_id().to_string();

        let task = tokio::spawn(worker_loop(
            handle,
            queue_rx,
            queued.clone(),
            snapshot.clone(),
            persist_tx,
        ));

        Self {
            session_id,
            queue_tx,
            queued,
            snapshot,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Queue `input` and wait for its result. Waits for queue capacity.
    pub async fn enqueue(&self, input: String) -> WorkResult {
        let (reply, rx) = oneshot::channel();
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self
            .queue_tx
            .send(WorkItem::Run { input, reply })
            .await
            .is_err()
        {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(SessionError::SessionEnded(self.session_id.clone()));
        }
        rx.await.unwrap_or(Err(SessionError::Cancelled))
    }

    /// Let queued work finish, then wait for the task to exit. Idempotent.
    pub async fn drain(&self) {
        let _ = self.queue_tx.send(WorkItem::Stop).await;
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(
                        component = "session_worker",
                        event = "worker.join_failed",
                        session_id = %self.session_id,
                        error = %e,
                        "Worker task failed"
                    );
                }
            }
        }
    }

    /// Tear the worker down without waiting for queued work.
    pub async fn abort(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.queued.store(0, Ordering::SeqCst);
        self.snapshot.rcu(|snap| WorkerSnapshot {
            state: WorkerState::Stopped,
            ..(**snap).clone()
        });
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Arc<WorkerSnapshot> {
        self.snapshot.load_full()
    }
}

fn set_state(snapshot: &ArcSwap<WorkerSnapshot>, state: WorkerState, touched: bool) {
    snapshot.rcu(|snap| WorkerSnapshot {
        state,
        last_activity_at: if touched {
            Some(now_iso8601())
        } else {
            snap.last_activity_at.clone()
        },
    });
}

async fn worker_loop(
    handle: Arc<SessionHandle>,
    mut queue_rx: mpsc::Receiver<WorkItem>,
    queued: Arc<AtomicUsize>,
    snapshot: Arc<ArcSwap<WorkerSnapshot>>,
    persist_tx: mpsc::Sender<PersistCommand>,
) {
    let session_id = handle.session_id().to_string();
    debug!(
        component = "session_worker",
        event = "worker.started",
        session_id = %session_id,
        "Session worker started"
    );

    while let Some(item) = queue_rx.recv().await {
        let (input, reply) = match item {
            WorkItem::Run { input, reply } => (input, reply),
            WorkItem::Stop => break,
        };
        queued.fetch_sub(1, Ordering::SeqCst);

        if reply.is_closed() {
            debug!(
                component = "session_worker",
                event = "worker.skip_abandoned",
                session_id = %session_id,
                "Caller went away before execution, skipping"
            );
            continue;
        }

        set_state(&snapshot, WorkerState::Running, true);

        let result = match AssertUnwindSafe(handle.executor().run(&input))
            .catch_unwind()
            .await
        {
            Ok(result) => result.map_err(SessionError::from),
            Err(_) => Err(SessionError::Executor("executor panicked".to_string())),
        };

        match &result {
            Ok(_) => {
                let turn_count = handle.record_turn();
                let entries = handle.executor().messages().await;
                let _ = persist_tx
                    .send(PersistCommand::TranscriptReplace {
                        session_id: session_id.clone(),
                        entries,
                    })
                    .await;
                let _ = persist_tx
                    .send(PersistCommand::SessionTouch {
                        id: session_id.clone(),
                        turn_count,
                    })
                    .await;
            }
            Err(err) => {
                info!(
                    component = "session_worker",
                    event = "worker.run_failed",
                    session_id = %session_id,
                    error = %err,
                    "Execution failed"
                );
            }
        }

        set_state(&snapshot, WorkerState::Idle, true);
        let _ = reply.send(result);
    }

    set_state(&snapshot, WorkerState::Stopped, false);
    debug!(
        component = "session_worker",
        event = "worker.stopped",
        session_id = %session_id,
        "Session worker stopped"
    );
}
