//! Approval correlator.
//!
//! `request_approval` parks the caller on a oneshot until the client answers
//! or the timeout fires. `handle_response` removes the pending sender before
//! sending, so exactly one response can ever win.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use switchyard_connector_core::ApprovalProvider;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Choice returned in auto mode when the request carries no options
pub const AUTO_APPROVE_FALLBACK: &str = "allow";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalMode {
    /// Never block; pick the first option
    Auto,
    Interactive,
}

/// What the transport needs to render an approval prompt
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalPrompt {
    pub request_id: String,
    pub prompt: String,
    pub options: Vec<String>,
    pub timeout: Duration,
    pub default: String,
}

pub type ApprovalNotifier = Arc<dyn Fn(&ApprovalPrompt) + Send + Sync>;

/// Forgets a request when its waiter goes away, including when the turn
/// waiting on it is aborted.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, oneshot::Sender<String>>,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.request_id);
    }
}

pub struct ApprovalSystem {
    mode: ApprovalMode,
    notifier: Option<ApprovalNotifier>,
    pending: DashMap<String, oneshot::Sender<String>>,
}

impl ApprovalSystem {
    pub fn new(mode: ApprovalMode, notifier: Option<ApprovalNotifier>) -> Self {
        Self {
            mode,
            notifier,
            pending: DashMap::new(),
        }
    }

    pub fn auto() -> Self {
        Self::new(ApprovalMode::Auto, None)
    }

    pub fn mode(&self) -> ApprovalMode {
        self.mode
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub async fn request_approval(
        &self,
        prompt: &str,
        options: &[String],
        timeout: Duration,
        default: &str,
    ) -> String {
        if self.mode == ApprovalMode::Auto {
            return options
                .first()
                .cloned()
                .unwrap_or_else(|| AUTO_APPROVE_FALLBACK.to_string());
        }

        let request_id = switchyard_protocol::new_id();
        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);
        let _pending = PendingGuard {
            pending: &self.pending,
            request_id: &request_id,
        };

        info!(
            component = "approval",
            event = "approval.requested",
            request_id = %request_id,
            option_count = options.len(),
            timeout_secs = timeout.as_secs_f64(),
            "Approval requested"
        );

        if let Some(notify) = &self.notifier {
            notify(&ApprovalPrompt {
                request_id: request_id.clone(),
                prompt: prompt.to_string(),
                options: options.to_vec(),
                timeout,
                default: default.to_string(),
            });
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(choice)) => choice,
            Ok(Err(_)) => {
                debug!(
                    component = "approval",
                    event = "approval.abandoned",
                    request_id = %request_id,
                    "Approval sender dropped, using default"
                );
                default.to_string()
            }
            Err(_) => {
                self.pending.remove(&request_id);
                // A response can land between the timer firing and the removal.
                match rx.try_recv() {
                    Ok(choice) => choice,
                    Err(_) => {
                        warn!(
                            component = "approval",
                            event = "approval.timed_out",
                            request_id = %request_id,
                            default = %default,
                            "Approval timed out, using default"
                        );
                        default.to_string()
                    }
                }
            }
        }
    }

    /// Resolve a pending request. Returns false for unknown or already
    /// resolved ids.
    pub fn handle_response(&self, request_id: &str, choice: &str) -> bool {
        let Some((_, tx)) = self.pending.remove(request_id) else {
            debug!(
                component = "approval",
                event = "approval.response_ignored",
                request_id = %request_id,
                "No pending approval for response"
            );
            return false;
        };
        tx.send(choice.to_string()).is_ok()
    }

    /// Drop every pending request; waiters fall back to their defaults.
    pub fn abandon_all(&self) {
        self.pending.clear();
    }
}

#[async_trait]
impl ApprovalProvider for ApprovalSystem {
    async fn request_approval(
        &self,
        prompt: &str,
        options: &[String],
        timeout: Duration,
        default: &str,
    ) -> String {
        ApprovalSystem::request_approval(self, prompt, options, timeout, default).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn options() -> Vec<String> {
        vec!["yes".to_string(), "no".to_string()]
    }

    fn capturing() -> (Arc<ApprovalSystem>, Arc<Mutex<Vec<ApprovalPrompt>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let notifier: ApprovalNotifier = Arc::new(move |p: &ApprovalPrompt| {
            sink.lock().unwrap().push(p.clone());
        });
        (
            Arc::new(ApprovalSystem::new(ApprovalMode::Interactive, Some(notifier))),
            seen,
        )
    }

    async fn wait_for_prompt(seen: &Arc<Mutex<Vec<ApprovalPrompt>>>) -> ApprovalPrompt {
        loop {
            if let Some(p) = seen.lock().unwrap().first().cloned() {
                return p;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn auto_mode_returns_first_option() {
        let system = ApprovalSystem::auto();
        let choice = system
            .request_approval("ok?", &options(), Duration::from_secs(1), "no")
            .await;
        assert_eq!(choice, "yes");
    }

    #[tokio::test]
    async fn auto_mode_without_options_allows() {
        let system = ApprovalSystem::auto();
        let choice = system
            .request_approval("ok?", &[], Duration::from_secs(1), "deny")
            .await;
        assert_eq!(choice, AUTO_APPROVE_FALLBACK);
    }

    #[tokio::test]
    async fn response_resolves_request_once() {
        let (system, seen) = capturing();
        let requester = system.clone();
        let task = tokio::spawn(async move {
            requester
                .request_approval("run rm?", &options(), Duration::from_secs(30), "no")
                .await
        });

        let prompt = wait_for_prompt(&seen).await;
        assert_eq!(prompt.prompt, "run rm?");
        assert!(system.handle_response(&prompt.request_id, "yes"));
        assert!(!system.handle_response(&prompt.request_id, "no"));

        assert_eq!(task.await.unwrap(), "yes");
        assert_eq!(system.pending_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_responses_have_one_winner() {
        let (system, seen) = capturing();
        let requester = system.clone();
        let task = tokio::spawn(async move {
            requester
                .request_approval("pick", &options(), Duration::from_secs(30), "no")
                .await
        });
        let prompt = wait_for_prompt(&seen).await;

        let mut responders = Vec::new();
        for i in 0..8 {
            let system = system.clone();
            let id = prompt.request_id.clone();
            responders.push(tokio::spawn(async move {
                system.handle_response(&id, &format!("choice-{}", i))
            }));
        }
        let wins = futures::future::join_all(responders)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();

        assert_eq!(wins, 1);
        assert!(task.await.unwrap().starts_with("choice-"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_returns_default_and_forgets_request() {
        let (system, seen) = capturing();
        let choice = system
            .request_approval("slow", &options(), Duration::from_secs(5), "no")
            .await;
        assert_eq!(choice, "no");

        let prompt = seen.lock().unwrap()[0].clone();
        assert!(!system.handle_response(&prompt.request_id, "yes"));
        assert_eq!(system.pending_count(), 0);
    }

    #[tokio::test]
    async fn aborted_waiter_forgets_request() {
        let (system, seen) = capturing();
        let requester = system.clone();
        let task = tokio::spawn(async move {
            requester
                .request_approval("dropped", &options(), Duration::from_secs(30), "no")
                .await
        });
        let prompt = wait_for_prompt(&seen).await;
        assert_eq!(system.pending_count(), 1);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert_eq!(system.pending_count(), 0);
        assert!(!system.handle_response(&prompt.request_id, "yes"));
    }

    #[test]
    fn unknown_request_is_rejected() {
        let system = ApprovalSystem::new(ApprovalMode::Interactive, None);
        assert!(!system.handle_response("missing", "yes"));
    }

    #[tokio::test]
    async fn abandon_all_releases_waiters_with_default() {
        let (system, seen) = capturing();
        let requester = system.clone();
        let task = tokio::spawn(async move {
            requester
                .request_approval("pending", &options(), Duration::from_secs(30), "no")
                .await
        });
        wait_for_prompt(&seen).await;

        system.abandon_all();

        assert_eq!(task.await.unwrap(), "no");
    }
}
