//! Per-connection event fan-out.
//!
//! Executor hooks push `(name, payload)` into a bounded `EventQueue`. One
//! `run_fanout` task per client drains it, translates, and forwards wire
//! messages. A full queue drops the newest event instead of blocking the
//! executor thread that emitted it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use switchyard_connector_core::EventSink;
use switchyard_protocol::ServerMessage;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::translator::{decode, DecodedEvent, EventTranslator, KernelEvent};

/// Chunk size for deltas synthesized from a non-streamed block
pub const SYNTHETIC_CHUNK_CHARS: usize = 12;

#[derive(Debug, Clone, PartialEq)]
pub enum QueuedEvent {
    Event { name: String, payload: Value },
    /// Forget per-turn translation state (the connection switched sessions)
    Reset,
    Stop,
}

/// Producer side of a connection's event queue (cheap to Clone).
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: mpsc::Sender<QueuedEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<QueuedEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Enqueue without waiting. Returns false if the event was dropped.
    pub fn push(&self, name: &str, payload: Value) -> bool {
        let event = QueuedEvent::Event {
            name: name.to_string(),
            payload,
        };
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    component = "fanout",
                    event = "fanout.queue_full",
                    hook_event = %name,
                    dropped_total = dropped,
                    "Event queue full, dropping event"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    component = "fanout",
                    event = "fanout.queue_closed",
                    hook_event = %name,
                    "Event queue closed, dropping event"
                );
                false
            }
        }
    }

    pub async fn reset(&self) {
        let _ = self.tx.send(QueuedEvent::Reset).await;
    }

    /// Ask the consumer to exit after draining what is already queued.
    pub async fn stop(&self) {
        let _ = self.tx.send(QueuedEvent::Stop).await;
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn same_queue(&self, other: &EventQueue) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

impl EventSink for EventQueue {
    fn emit(&self, event: &str, payload: Value) {
        self.push(event, payload);
    }
}

/// Translation plus synthetic streaming for one connection
#[derive(Debug, Default)]
pub struct ConnectionFanout {
    translator: EventTranslator,
    // local indices that received at least one non-empty delta this turn
    seen_deltas: HashSet<usize>,
}

impl ConnectionFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.translator.reset();
        self.seen_deltas.clear();
    }

    /// Wire messages for one hook event, in send order. Malformed payloads
    /// yield nothing.
    pub fn process(&mut self, name: &str, payload: &Value) -> Vec<ServerMessage> {
        let decoded = match decode(name, payload) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!(
                    component = "fanout",
                    event = "fanout.decode_failed",
                    hook_event = %name,
                    error = %err,
                    "Suppressing malformed event"
                );
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        match &decoded.event {
            KernelEvent::BlockDelta { raw_index, delta } if !delta.is_empty() => {
                let index = self.translator.local_index(*raw_index);
                self.seen_deltas.insert(index);
            }
            KernelEvent::BlockEnd { raw_index, text } => {
                let index = self.translator.local_index(*raw_index);
                if !text.is_empty() && !self.seen_deltas.contains(&index) {
                    for chunk in chunk_chars(text, SYNTHETIC_CHUNK_CHARS) {
                        out.push(self.translator.apply(DecodedEvent {
                            event: KernelEvent::BlockDelta {
                                raw_index: *raw_index,
                                delta: chunk,
                            },
                            lineage: decoded.lineage.clone(),
                        }));
                    }
                }
                self.seen_deltas.remove(&index);
            }
            _ => {}
        }

        let turn_complete = matches!(decoded.event, KernelEvent::TurnComplete { .. });
        out.push(self.translator.apply(decoded));
        if turn_complete {
            self.seen_deltas.clear();
        }
        out
    }
}

fn chunk_chars(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size.max(1))
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Drain `rx` until `Stop`, queue closure, or the outbound side going away.
pub async fn run_fanout<M>(
    mut rx: mpsc::Receiver<QueuedEvent>,
    outbound: mpsc::Sender<M>,
    conn_id: u64,
) where
    M: From<ServerMessage> + Send + 'static,
{
    let mut fanout = ConnectionFanout::new();

    while let Some(queued) = rx.recv().await {
        let (name, payload) = match queued {
            QueuedEvent::Event { name, payload } => (name, payload),
            QueuedEvent::Reset => {
                fanout.reset();
                continue;
            }
            QueuedEvent::Stop => break,
        };

        for msg in fanout.process(&name, &payload) {
            if outbound.send(M::from(msg)).await.is_err() {
                debug!(
                    component = "fanout",
                    event = "fanout.outbound_closed",
                    connection_id = conn_id,
                    "Transport gone, stopping fan-out"
                );
                return;
            }
        }
    }

    debug!(
        component = "fanout",
        event = "fanout.stopped",
        connection_id = conn_id,
        "Fan-out loop stopped"
    );
}
