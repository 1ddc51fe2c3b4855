//! Client surfaces and the per-session relay that feeds them.
//!
//! Hooks are registered on the executor once per session and point at a
//! `SurfaceRelay`. Re-wiring (page refresh, new tab) swaps the relay's
//! target queue instead of registering a second hook.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde_json::{json, Value};
use switchyard_connector_core::{events, DisplaySink, EventSink};
use switchyard_protocol::DisplayLevel;

use crate::approval::{ApprovalNotifier, ApprovalPrompt};
use crate::fanout::EventQueue;

/// What a transport brings to a session
#[derive(Debug, Clone)]
pub struct Surface {
    pub events: EventQueue,
    pub auto_approve: bool,
}

impl Surface {
    pub fn new(events: EventQueue, auto_approve: bool) -> Self {
        Self {
            events,
            auto_approve,
        }
    }
}

#[derive(Debug, Default)]
pub struct SurfaceRelay {
    target: ArcSwapOption<EventQueue>,
}

impl SurfaceRelay {
    pub fn new(target: EventQueue) -> Arc<Self> {
        Arc::new(Self {
            target: ArcSwapOption::from_pointee(target),
        })
    }

    pub fn retarget(&self, target: EventQueue) {
        self.target.store(Some(Arc::new(target)));
    }

    pub fn detach(&self) {
        self.target.store(None);
    }

    pub fn is_targeting(&self, queue: &EventQueue) -> bool {
        self.target
            .load()
            .as_ref()
            .is_some_and(|current| current.same_queue(queue))
    }

    pub fn forward(&self, event: &str, payload: Value) -> bool {
        match self.target.load().as_ref() {
            Some(queue) => queue.push(event, payload),
            None => false,
        }
    }

    /// Notifier that announces approval prompts on this relay
    pub fn approval_notifier(self: &Arc<Self>) -> ApprovalNotifier {
        let relay = self.clone();
        Arc::new(move |prompt: &ApprovalPrompt| {
            relay.forward(
                events::APPROVAL_REQUEST,
                json!({
                    "request_id": prompt.request_id,
                    "prompt": prompt.prompt,
                    "options": prompt.options,
                    "timeout": prompt.timeout.as_secs_f64(),
                    "default": prompt.default,
                }),
            );
        })
    }
}

/// Session provenance stamped onto events from nested sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildLineage {
    pub session_id: String,
    pub parent_id: String,
}

/// Hook sink forwarding executor events to a relay
pub struct RelaySink {
    relay: Arc<SurfaceRelay>,
    lineage: Option<ChildLineage>,
}

impl RelaySink {
    pub fn new(relay: Arc<SurfaceRelay>, lineage: Option<ChildLineage>) -> Arc<Self> {
        Arc::new(Self { relay, lineage })
    }
}

impl EventSink for RelaySink {
    fn emit(&self, event: &str, mut payload: Value) {
        // A nested turn finishing is not the client's turn finishing.
        if self.lineage.is_some() && event == events::ORCHESTRATOR_COMPLETE {
            return;
        }
        if let (Some(lineage), Some(obj)) = (&self.lineage, payload.as_object_mut()) {
            obj.entry("session_id")
                .or_insert_with(|| Value::String(lineage.session_id.clone()));
            obj.entry("parent_id")
                .or_insert_with(|| Value::String(lineage.parent_id.clone()));
        }
        self.relay.forward(event, payload);
    }
}

/// `display` capability backed by a relay
pub struct RelayDisplay {
    relay: Arc<SurfaceRelay>,
}

impl RelayDisplay {
    pub fn new(relay: Arc<SurfaceRelay>) -> Arc<Self> {
        Arc::new(Self { relay })
    }
}

impl DisplaySink for RelayDisplay {
    fn show_message(&self, message: &str, level: DisplayLevel, source: &str) {
        self.relay.forward(
            events::DISPLAY_MESSAGE,
            json!({"message": message, "level": level, "source": source}),
        );
    }
}
