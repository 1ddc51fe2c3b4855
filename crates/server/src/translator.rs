//! Executor event → wire message translation.
//!
//! Two stages. `decode` normalizes the loosely shaped hook payloads (string
//! or structured deltas, object or string tool results, legacy index keys)
//! into a `KernelEvent`. `EventTranslator::apply` then maps that onto a
//! `ServerMessage`, keeping the per-turn state:
//!
//! - `cycle_count` bumps on every completed tool call, because providers
//!   restart block indices at zero after each tool round trip
//! - `(cycle, raw_index)` → local index, where the local index is
//!   `max(raw_index, next_index)`, so cycle-0 indices pass through and later
//!   cycles always land beyond everything already assigned
//! - a FIFO of delegate tool-call ids, popped when a sub-session reports in
//!
//! All of it resets on `orchestrator:complete`.

use std::collections::{HashMap, VecDeque};

use serde_json::{json, Map, Value};
use switchyard_connector_core::events;
use switchyard_protocol::{DisplayLevel, ServerMessage};
use thiserror::Error;

const DEFAULT_APPROVAL_TIMEOUT_SECS: f64 = 300.0;
const DEFAULT_APPROVAL_CHOICE: &str = "deny";

/// Largest raw block index accepted from a provider
pub const MAX_BLOCK_INDEX: u64 = 1 << 20;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("payload for {event} is not a JSON object")]
    NotAnObject { event: String },

    #[error("block index {index} for {event} is out of range")]
    IndexOutOfRange { event: String, index: u64 },
}

/// Provenance of an event emitted by a nested session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lineage {
    pub session_id: Option<String>,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum KernelEvent {
    BlockStart {
        block_type: String,
        raw_index: usize,
    },
    BlockDelta {
        raw_index: usize,
        delta: String,
    },
    BlockEnd {
        raw_index: usize,
        text: String,
    },
    ThinkingDelta {
        delta: String,
    },
    ThinkingFinal {
        content: String,
    },
    ToolPre {
        tool_call_id: String,
        tool_name: String,
        arguments: Value,
    },
    ToolPost {
        tool_call_id: String,
        success: bool,
        output: Option<String>,
        error: Option<String>,
    },
    ToolError {
        tool_call_id: String,
        error: String,
    },
    AgentSpawned {
        parent_id: String,
        child_id: String,
        agent: String,
    },
    TurnComplete {
        turn_count: u64,
    },
    CancelRequested,
    CancelCompleted,
    Display {
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
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        total_tokens: u64,
        cache_read_tokens: Option<u64>,
        cache_write_tokens: Option<u64>,
        model: Option<String>,
        provider: Option<String>,
        duration_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub event: KernelEvent,
    pub lineage: Lineage,
}

/// Normalize one hook event. `Ok(None)` means the event is not part of the
/// wire vocabulary and should be suppressed.
pub fn decode(name: &str, payload: &Value) -> Result<Option<DecodedEvent>, DecodeError> {
    let empty = Map::new();
    let data = match payload {
        Value::Object(map) => map,
        Value::Null => &empty,
        _ => {
            return Err(DecodeError::NotAnObject {
                event: name.to_string(),
            })
        }
    };

    let event = match name {
        events::CONTENT_BLOCK_START => KernelEvent::BlockStart {
            block_type: str_or(data, "block_type", "text"),
            raw_index: block_index(name, data)?,
        },
        events::CONTENT_BLOCK_DELTA => KernelEvent::BlockDelta {
            raw_index: block_index(name, data)?,
            delta: delta_text(data),
        },
        events::CONTENT_BLOCK_END => KernelEvent::BlockEnd {
            raw_index: block_index(name, data)?,
            text: block_text(data),
        },
        events::THINKING_DELTA => KernelEvent::ThinkingDelta {
            delta: str_or(data, "delta", ""),
        },
        events::THINKING_FINAL => KernelEvent::ThinkingFinal {
            content: str_or(data, "content", ""),
        },
        events::TOOL_PRE => KernelEvent::ToolPre {
            tool_call_id: str_or(data, "tool_call_id", ""),
            tool_name: str_or(data, "tool_name", ""),
            arguments: match data.get("tool_input") {
                Some(Value::Null) | None => json!({}),
                Some(input) => input.clone(),
            },
        },
        events::TOOL_POST => {
            let (success, output, error) = tool_outcome(data.get("result"));
            KernelEvent::ToolPost {
                tool_call_id: str_or(data, "tool_call_id", ""),
                success,
                output,
                error,
            }
        }
        events::TOOL_ERROR => KernelEvent::ToolError {
            tool_call_id: str_or(data, "tool_call_id", ""),
            error: data
                .get("error")
                .and_then(error_text)
                .unwrap_or_else(|| "Unknown error".to_string()),
        },
        events::AGENT_SPAWNED => KernelEvent::AgentSpawned {
            parent_id: str_or(data, "parent_id", ""),
            child_id: str_or(data, "child_id", ""),
            agent: str_or(data, "agent", ""),
        },
        events::ORCHESTRATOR_COMPLETE => KernelEvent::TurnComplete {
            turn_count: data.get("turn_count").and_then(as_count).unwrap_or(0),
        },
        events::CANCEL_REQUESTED => KernelEvent::CancelRequested,
        events::CANCEL_COMPLETED => KernelEvent::CancelCompleted,
        events::DISPLAY_MESSAGE => KernelEvent::Display {
            message: str_or(data, "message", ""),
            level: data
                .get("level")
                .and_then(Value::as_str)
                .map(DisplayLevel::parse)
                .unwrap_or_default(),
            source: str_or(data, "source", "system"),
        },
        events::APPROVAL_REQUEST => KernelEvent::ApprovalRequest {
            id: data
                .get("request_id")
                .or_else(|| data.get("id"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            prompt: str_or(data, "prompt", ""),
            options: data
                .get("options")
                .and_then(Value::as_array)
                .map(|opts| {
                    opts.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            timeout: data
                .get("timeout")
                .and_then(Value::as_f64)
                .unwrap_or(DEFAULT_APPROVAL_TIMEOUT_SECS),
            default: str_or(data, "default", DEFAULT_APPROVAL_CHOICE),
        },
        events::LLM_RESPONSE | events::PROVIDER_POST => {
            let usage = data.get("usage").and_then(Value::as_object);
            let count = |key: &str| usage.and_then(|u| u.get(key)).and_then(as_count);
            let input_tokens = count("input_tokens").unwrap_or(0);
            let output_tokens = count("output_tokens").unwrap_or(0);
            KernelEvent::Usage {
                input_tokens,
                output_tokens,
                total_tokens: count("total_tokens")
                    .unwrap_or_else(|| input_tokens.saturating_add(output_tokens)),
                cache_read_tokens: count("cache_read_tokens"),
                cache_write_tokens: count("cache_write_tokens"),
                model: opt_str(data, "model"),
                provider: opt_str(data, "provider"),
                duration_ms: data.get("duration_ms").and_then(as_count),
            }
        }
        _ => return Ok(None),
    };

    Ok(Some(DecodedEvent {
        event,
        lineage: lineage(data),
    }))
}

/// Per-connection translation state
#[derive(Debug, Default)]
pub struct EventTranslator {
    cycle_count: u64,
    block_map: HashMap<(u64, usize), usize>,
    next_index: usize,
    pending_delegates: VecDeque<String>,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    pub fn pending_delegates(&self) -> usize {
        self.pending_delegates.len()
    }

    /// Stable local index for `raw_index` in the current cycle.
    pub fn local_index(&mut self, raw_index: usize) -> usize {
        let key = (self.cycle_count, raw_index);
        if let Some(local) = self.block_map.get(&key) {
            return *local;
        }
        let local = raw_index.max(self.next_index);
        self.block_map.insert(key, local);
        self.next_index = local.saturating_add(1);
        local
    }

    pub fn reset(&mut self) {
        self.cycle_count = 0;
        self.block_map.clear();
        self.next_index = 0;
        self.pending_delegates.clear();
    }

    pub fn translate(
        &mut self,
        name: &str,
        payload: &Value,
    ) -> Result<Option<ServerMessage>, DecodeError> {
        Ok(decode(name, payload)?.map(|decoded| self.apply(decoded)))
    }

    pub fn apply(&mut self, decoded: DecodedEvent) -> ServerMessage {
        let Lineage {
            session_id,
            parent_id,
        } = decoded.lineage;

        match decoded.event {
            KernelEvent::BlockStart {
                block_type,
                raw_index,
            } => ServerMessage::ContentStart {
                block_type,
                index: self.local_index(raw_index),
                session_id,
                parent_id,
            },
            KernelEvent::BlockDelta { raw_index, delta } => ServerMessage::ContentDelta {
                delta,
                index: self.local_index(raw_index),
                session_id,
                parent_id,
            },
            KernelEvent::BlockEnd { raw_index, text } => ServerMessage::ContentEnd {
                index: self.local_index(raw_index),
                text,
                session_id,
                parent_id,
            },
            KernelEvent::ThinkingDelta { delta } => ServerMessage::ThinkingDelta { delta },
            KernelEvent::ThinkingFinal { content } => ServerMessage::ThinkingFinal { content },
            KernelEvent::ToolPre {
                tool_call_id,
                tool_name,
                arguments,
            } => {
                if events::is_delegate_tool(&tool_name) {
                    self.pending_delegates.push_back(tool_call_id.clone());
                }
                ServerMessage::ToolCall {
                    tool_call_id,
                    tool_name,
                    arguments,
                    session_id,
                    parent_id,
                }
            }
            KernelEvent::ToolPost {
                tool_call_id,
                success,
                output,
                error,
            } => {
                self.cycle_count += 1;
                ServerMessage::ToolResult {
                    tool_call_id,
                    success,
                    output,
                    error,
                    session_id,
                    parent_id,
                }
            }
            KernelEvent::ToolError {
                tool_call_id,
                error,
            } => ServerMessage::ToolResult {
                tool_call_id,
                success: false,
                output: None,
                error: Some(error),
                session_id,
                parent_id,
            },
            KernelEvent::AgentSpawned {
                parent_id: fork_parent,
                child_id,
                agent,
            } => ServerMessage::SessionFork {
                parent_id: fork_parent,
                child_id,
                agent,
                parent_tool_call_id: self.pending_delegates.pop_front(),
            },
            KernelEvent::TurnComplete { turn_count } => {
                self.reset();
                ServerMessage::PromptComplete { turn_count }
            }
            KernelEvent::CancelRequested => ServerMessage::CancelAcknowledged,
            KernelEvent::CancelCompleted => ServerMessage::ExecutionCancelled,
            KernelEvent::Display {
                message,
                level,
                source,
            } => ServerMessage::DisplayMessage {
                message,
                level,
                source,
            },
            KernelEvent::ApprovalRequest {
                id,
                prompt,
                options,
                timeout,
                default,
            } => ServerMessage::ApprovalRequest {
                id,
                prompt,
                options,
                timeout,
                default,
            },
            KernelEvent::Usage {
                input_tokens,
                output_tokens,
                total_tokens,
                cache_read_tokens,
                cache_write_tokens,
                model,
                provider,
                duration_ms,
            } => ServerMessage::TokenUsage {
                input_tokens,
                output_tokens,
                total_tokens,
                cache_read_tokens,
                cache_write_tokens,
                model,
                provider,
                duration_ms,
            },
        }
    }
}

/// Raw block index from `block_index` / `index`, top level or under `block`.
pub fn server_index(data: &Map<String, Value>) -> u64 {
    let raw = ["block_index", "index"]
        .iter()
        .find_map(|key| data.get(*key).filter(|v| !v.is_null()))
        .or_else(|| {
            let block = data.get("block")?.as_object()?;
            ["block_index", "index"]
                .iter()
                .find_map(|key| block.get(*key).filter(|v| !v.is_null()))
        });
    raw.and_then(index_value).unwrap_or(0)
}

/// Full text of a finished block, across payload generations.
pub fn block_text(data: &Map<String, Value>) -> String {
    if let Some(block) = data.get("block").and_then(Value::as_object) {
        for key in ["text", "thinking", "content", "delta"] {
            if let Some(text) = block.get(key).and_then(Value::as_str) {
                return text.to_string();
            }
        }
    }
    if let Some(text) = data.get("text").and_then(Value::as_str) {
        return text.to_string();
    }
    data.get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Delta text from a bare string or a `{"text"|"thinking": ..}` object.
pub fn delta_text(data: &Map<String, Value>) -> String {
    match data.get("delta") {
        Some(Value::String(delta)) => delta.clone(),
        Some(Value::Object(delta)) => ["text", "thinking"]
            .iter()
            .filter_map(|key| delta.get(*key).and_then(Value::as_str))
            .find(|text| !text.is_empty())
            .unwrap_or_default()
            .to_string(),
        _ => data
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

fn block_index(event: &str, data: &Map<String, Value>) -> Result<usize, DecodeError> {
    let index = server_index(data);
    if index > MAX_BLOCK_INDEX {
        return Err(DecodeError::IndexOutOfRange {
            event: event.to_string(),
            index,
        });
    }
    usize::try_from(index).map_err(|_| DecodeError::IndexOutOfRange {
        event: event.to_string(),
        index,
    })
}

fn index_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

fn tool_outcome(result: Option<&Value>) -> (bool, Option<String>, Option<String>) {
    match result {
        None | Some(Value::Null) => (true, None, None),
        Some(Value::Object(obj)) => {
            let output = obj.get("output").and_then(|o| match o {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            });
            let error = obj.get("error").and_then(error_text);
            let success = obj
                .get("success")
                .and_then(Value::as_bool)
                .unwrap_or(error.is_none());
            (success, output, error)
        }
        Some(Value::String(s)) => (true, Some(s.clone()), None),
        Some(other) => (true, Some(other.to_string()), None),
    }
}

fn error_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => Some(
            obj.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string()),
        ),
        other => Some(other.to_string()),
    }
}

fn as_count(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
}

fn str_or(data: &Map<String, Value>, key: &str, default: &str) -> String {
    data.get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

fn opt_str(data: &Map<String, Value>, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

fn lineage(data: &Map<String, Value>) -> Lineage {
    let non_empty = |key: &str| {
        data.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    Lineage {
        session_id: non_empty("session_id"),
        parent_id: non_empty("parent_id"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translate(t: &mut EventTranslator, name: &str, payload: Value) -> Option<ServerMessage> {
        t.translate(name, &payload).expect("decode")
    }

    fn index_of(msg: Option<ServerMessage>) -> usize {
        match msg {
            Some(ServerMessage::ContentStart { index, .. })
            | Some(ServerMessage::ContentDelta { index, .. })
            | Some(ServerMessage::ContentEnd { index, .. }) => index,
            other => panic!("expected content message, got {:?}", other),
        }
    }

    #[test]
    fn first_cycle_indices_pass_through() {
        let mut t = EventTranslator::new();
        for raw in 0..3 {
            let msg = translate(&mut t, "content_block:start", json!({"block_index": raw}));
            assert_eq!(index_of(msg), raw);
        }
    }

    #[test]
    fn later_cycles_move_past_assigned_indices() {
        let mut t = EventTranslator::new();
        let first = index_of(translate(&mut t, "content_block:start", json!({"index": 0})));
        translate(&mut t, "tool:post", json!({"tool_call_id": "c1"}));
        let second = index_of(translate(&mut t, "content_block:start", json!({"index": 0})));
        let second_again = index_of(translate(&mut t, "content_block:end", json!({"index": 0})));

        assert_eq!(first, 0);
        assert!(second > first);
        assert_eq!(second, second_again);
        assert_eq!(t.cycle_count(), 1);
    }

    #[test]
    fn indices_never_repeat_within_a_turn() {
        let mut t = EventTranslator::new();
        let mut seen = Vec::new();
        for _ in 0..3 {
            for raw in [0, 1] {
                seen.push(index_of(translate(
                    &mut t,
                    "content_block:start",
                    json!({"block_index": raw}),
                )));
            }
            translate(&mut t, "tool:post", json!({}));
        }
        let mut deduped = seen.clone();
        deduped.dedup();
        assert_eq!(seen, deduped);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn tool_error_does_not_advance_cycle() {
        let mut t = EventTranslator::new();
        let msg = translate(&mut t, "tool:error", json!({"tool_call_id": "c1"}));
        assert_eq!(t.cycle_count(), 0);
        match msg {
            Some(ServerMessage::ToolResult {
                success,
                output,
                error,
                ..
            }) => {
                assert!(!success);
                assert!(output.is_none());
                assert_eq!(error.as_deref(), Some("Unknown error"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn delegate_correlation_is_fifo() {
        let mut t = EventTranslator::new();
        translate(&mut t, "tool:pre", json!({"tool_name": "delegate", "tool_call_id": "A"}));
        translate(&mut t, "tool:pre", json!({"tool_name": "task", "tool_call_id": "B"}));
        translate(&mut t, "tool:pre", json!({"tool_name": "bash", "tool_call_id": "C"}));
        assert_eq!(t.pending_delegates(), 2);

        let parents: Vec<Option<String>> = (0..3)
            .map(|i| {
                match translate(
                    &mut t,
                    "delegate:agent_spawned",
                    json!({"parent_id": "p", "child_id": format!("c{}", i), "agent": "explorer"}),
                ) {
                    Some(ServerMessage::SessionFork {
                        parent_tool_call_id,
                        ..
                    }) => parent_tool_call_id,
                    other => panic!("unexpected {:?}", other),
                }
            })
            .collect();

        assert_eq!(
            parents,
            vec![Some("A".to_string()), Some("B".to_string()), None]
        );
    }

    #[test]
    fn turn_complete_resets_state() {
        let mut t = EventTranslator::new();
        translate(&mut t, "content_block:start", json!({"block_index": 4}));
        translate(&mut t, "tool:pre", json!({"tool_name": "delegate", "tool_call_id": "A"}));
        translate(&mut t, "tool:post", json!({"tool_call_id": "A"}));

        let done = translate(&mut t, "orchestrator:complete", json!({"turn_count": 3}));
        assert_eq!(done, Some(ServerMessage::PromptComplete { turn_count: 3 }));
        assert_eq!(t.cycle_count(), 0);
        assert_eq!(t.pending_delegates(), 0);
        let next = translate(&mut t, "content_block:start", json!({"block_index": 0}));
        assert_eq!(index_of(next), 0);
    }

    #[test]
    fn structured_deltas_are_normalized() {
        let mut t = EventTranslator::new();
        let text = translate(
            &mut t,
            "content_block:delta",
            json!({"block_index": 0, "delta": {"type": "text_delta", "text": "hi"}}),
        );
        let thinking = translate(
            &mut t,
            "content_block:delta",
            json!({"block_index": 1, "delta": {"type": "thinking_delta", "thinking": "hmm"}}),
        );
        let fallback = translate(&mut t, "content_block:delta", json!({"text": "raw"}));

        assert!(matches!(text, Some(ServerMessage::ContentDelta { ref delta, .. }) if delta == "hi"));
        assert!(matches!(thinking, Some(ServerMessage::ContentDelta { ref delta, .. }) if delta == "hmm"));
        assert!(matches!(fallback, Some(ServerMessage::ContentDelta { ref delta, .. }) if delta == "raw"));
    }

    #[test]
    fn tool_post_reads_object_results() {
        let mut t = EventTranslator::new();
        let ok = translate(
            &mut t,
            "tool:post",
            json!({"tool_call_id": "c1", "result": {"output": {"files": 2}, "error": null}}),
        );
        let failed = translate(
            &mut t,
            "tool:post",
            json!({"tool_call_id": "c2", "result": {"output": null, "error": {"message": "denied"}}}),
        );

        match ok {
            Some(ServerMessage::ToolResult { success, output, .. }) => {
                assert!(success);
                assert_eq!(output.as_deref(), Some(r#"{"files":2}"#));
            }
            other => panic!("unexpected {:?}", other),
        }
        match failed {
            Some(ServerMessage::ToolResult { success, error, .. }) => {
                assert!(!success);
                assert_eq!(error.as_deref(), Some("denied"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn lineage_passes_through_on_tool_and_content_events() {
        let mut t = EventTranslator::new();
        let call = translate(
            &mut t,
            "tool:pre",
            json!({"tool_name": "read", "tool_call_id": "c", "session_id": "child", "parent_id": ""}),
        );
        match call {
            Some(ServerMessage::ToolCall {
                session_id,
                parent_id,
                arguments,
                ..
            }) => {
                assert_eq!(session_id.as_deref(), Some("child"));
                assert!(parent_id.is_none());
                assert_eq!(arguments, json!({}));
            }
            other => panic!("unexpected {:?}", other),
        }

        let start = translate(
            &mut t,
            "content_block:start",
            json!({"block_index": 0, "session_id": "child", "parent_id": "root"}),
        );
        assert!(matches!(
            start,
            Some(ServerMessage::ContentStart { parent_id: Some(ref p), .. }) if p == "root"
        ));
    }

    #[test]
    fn usage_total_defaults_to_sum() {
        let mut t = EventTranslator::new();
        let msg = translate(
            &mut t,
            "provider:post",
            json!({"usage": {"input_tokens": 10, "output_tokens": 5}, "model": "m"}),
        );
        match msg {
            Some(ServerMessage::TokenUsage {
                total_tokens,
                model,
                cache_read_tokens,
                ..
            }) => {
                assert_eq!(total_tokens, 15);
                assert_eq!(model.as_deref(), Some("m"));
                assert!(cache_read_tokens.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn approval_request_uses_defaults() {
        let mut t = EventTranslator::new();
        let msg = translate(
            &mut t,
            "approval_request",
            json!({"request_id": "r1", "prompt": "ok?", "options": ["yes", "no"]}),
        );
        assert_eq!(
            msg,
            Some(ServerMessage::ApprovalRequest {
                id: "r1".to_string(),
                prompt: "ok?".to_string(),
                options: vec!["yes".to_string(), "no".to_string()],
                timeout: 300.0,
                default: "deny".to_string(),
            })
        );
    }

    #[test]
    fn index_extraction_accepts_legacy_shapes() {
        let obj = |v: Value| v.as_object().cloned().unwrap();
        assert_eq!(server_index(&obj(json!({"block": {"index": 3}}))), 3);
        assert_eq!(server_index(&obj(json!({"block_index": "7"}))), 7);
        assert_eq!(server_index(&obj(json!({"block_index": null, "index": 2}))), 2);
        assert_eq!(server_index(&obj(json!({"index": "nope"}))), 0);
        assert_eq!(server_index(&obj(json!({}))), 0);
    }

    #[test]
    fn oversized_block_index_is_rejected() {
        let mut t = EventTranslator::new();
        assert_eq!(
            t.translate("content_block:start", &json!({"block_index": u64::MAX})),
            Err(DecodeError::IndexOutOfRange {
                event: "content_block:start".to_string(),
                index: u64::MAX,
            })
        );
        let at_limit = translate(
            &mut t,
            "content_block:start",
            json!({"block_index": MAX_BLOCK_INDEX}),
        );
        assert_eq!(index_of(at_limit), MAX_BLOCK_INDEX as usize);
    }

    #[test]
    fn usage_total_saturates() {
        let mut t = EventTranslator::new();
        let msg = translate(
            &mut t,
            "llm:response",
            json!({"usage": {"input_tokens": u64::MAX, "output_tokens": 5}}),
        );
        match msg {
            Some(ServerMessage::TokenUsage { total_tokens, .. }) => {
                assert_eq!(total_tokens, u64::MAX)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn block_text_prefers_block_fields() {
        let obj = |v: Value| v.as_object().cloned().unwrap();
        assert_eq!(block_text(&obj(json!({"block": {"thinking": "t"}, "text": "x"}))), "t");
        assert_eq!(block_text(&obj(json!({"text": "x"}))), "x");
        assert_eq!(block_text(&obj(json!({"content": "c"}))), "c");
        assert_eq!(block_text(&obj(json!({"content": 5}))), "");
    }

    #[test]
    fn unknown_events_are_suppressed_and_bad_payloads_rejected() {
        let mut t = EventTranslator::new();
        assert_eq!(translate(&mut t, "session:start", json!({})), None);
        assert_eq!(
            t.translate("content_block:start", &json!([1, 2])),
            Err(DecodeError::NotAnObject {
                event: "content_block:start".to_string()
            })
        );
    }
}
