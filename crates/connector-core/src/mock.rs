//! In-process scripted executor.
//!
//! Echoes every input as `echo:<input>` and streams it through the same hook
//! events a real provider would. A few slash inputs drive the host
//! capabilities:
//!
//! - `/delegate <agent> <instruction>` spawns a sub-session via `session.spawn`
//! - `/approve <prompt>` asks the `approval` capability
//! - `/display <message>` pushes a message to the `display` capability
//! - `/fail <reason>` returns a provider error

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use switchyard_protocol::{CancelLevel, DisplayLevel};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::events::{
    CANCEL_COMPLETED, CANCEL_REQUESTED, CONTENT_BLOCK_DELTA, CONTENT_BLOCK_END,
    CONTENT_BLOCK_START, LLM_RESPONSE, ORCHESTRATOR_COMPLETE, TOOL_ERROR, TOOL_POST, TOOL_PRE,
};
use crate::{
    Capability, ConnectorError, CreateRequest, Executor, ExecutorSession, HookId, HookSpec,
    ResumeRequest, SpawnRequest, TranscriptEntry, APPROVAL_CAPABILITY, DISPLAY_CAPABILITY,
    SPAWN_CAPABILITY,
};

const STREAM_CHUNK_CHARS: usize = 5;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Knobs for scripted behavior
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Time each `run` spends "thinking" before answering; cancellable
    pub run_delay: Duration,
    pub resume_delay: Duration,
    /// When false only `content_block:end` carries the text
    pub stream_deltas: bool,
    pub fail_resume: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            run_delay: Duration::ZERO,
            resume_delay: Duration::ZERO,
            stream_deltas: true,
            fail_resume: false,
        }
    }
}

#[derive(Default)]
pub struct MockExecutor {
    behavior: Mutex<MockBehavior>,
    sessions: Mutex<HashMap<String, Arc<MockSession>>>,
    created: AtomicUsize,
    resumed: AtomicUsize,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            ..Self::default()
        }
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *lock(&self.behavior) = behavior;
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn resume_count(&self) -> usize {
        self.resumed.load(Ordering::SeqCst)
    }

    /// Last session object handed out for `session_id`
    pub fn session(&self, session_id: &str) -> Option<Arc<MockSession>> {
        lock(&self.sessions).get(session_id).cloned()
    }

    fn track(&self, session: MockSession) -> Arc<MockSession> {
        let session = Arc::new(session);
        lock(&self.sessions).insert(session.id.clone(), session.clone());
        session
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn create_session(
        &self,
        request: CreateRequest,
    ) -> Result<Arc<dyn ExecutorSession>, ConnectorError> {
        let behavior = lock(&self.behavior).clone();
        self.created.fetch_add(1, Ordering::SeqCst);
        let id = Uuid::new_v4().to_string();
        debug!(
            component = "mock_executor",
            event = "mock.session.created",
            session_id = %id,
            working_dir = %request.working_dir,
            "Mock session created"
        );
        let session = MockSession::new(id, &request.working_dir, behavior, Vec::new());
        Ok(self.track(session))
    }

    async fn resume_session(
        &self,
        request: ResumeRequest,
    ) -> Result<Arc<dyn ExecutorSession>, ConnectorError> {
        let behavior = lock(&self.behavior).clone();
        self.resumed.fetch_add(1, Ordering::SeqCst);
        if !behavior.resume_delay.is_zero() {
            tokio::time::sleep(behavior.resume_delay).await;
        }
        if behavior.fail_resume {
            return Err(ConnectorError::SessionNotFound(request.session_id));
        }
        let session = MockSession::new(
            request.session_id,
            &request.working_dir,
            behavior,
            request.transcript,
        );
        Ok(self.track(session))
    }
}

pub struct MockSession {
    id: String,
    project_id: String,
    behavior: MockBehavior,
    hooks: Mutex<Vec<(HookId, HookSpec)>>,
    next_hook: AtomicU64,
    capabilities: Mutex<HashMap<String, Capability>>,
    transcript: Mutex<Vec<TranscriptEntry>>,
    turns: AtomicU64,
    cancel: Notify,
    cancel_levels: Mutex<Vec<CancelLevel>>,
    journal: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    cleaned_up: AtomicBool,
}

impl MockSession {
    fn new(
        id: String,
        working_dir: &str,
        behavior: MockBehavior,
        transcript: Vec<TranscriptEntry>,
    ) -> Self {
        let project_id = Path::new(working_dir)
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty())
            .unwrap_or("default")
            .to_string();
        let turns = transcript.iter().filter(|e| e.role == "assistant").count() as u64;
        Self {
            id,
            project_id,
            behavior,
            hooks: Mutex::new(Vec::new()),
            next_hook: AtomicU64::new(1),
            capabilities: Mutex::new(HashMap::new()),
            transcript: Mutex::new(transcript),
            turns: AtomicU64::new(turns),
            cancel: Notify::new(),
            cancel_levels: Mutex::new(Vec::new()),
            journal: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            cleaned_up: AtomicBool::new(false),
        }
    }

    /// `start:<input>` / `end:<input>` entries in execution order
    pub fn journal(&self) -> Vec<String> {
        lock(&self.journal).clone()
    }

    /// Highest number of overlapping `run` calls ever observed
    pub fn max_concurrent_runs(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn cancel_levels(&self) -> Vec<CancelLevel> {
        lock(&self.cancel_levels).clone()
    }

    pub fn hook_count(&self) -> usize {
        lock(&self.hooks).len()
    }

    pub fn capability(&self, name: &str) -> Option<Capability> {
        lock(&self.capabilities).get(name).cloned()
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up.load(Ordering::SeqCst)
    }

    fn record(&self, entry: String) {
        lock(&self.journal).push(entry);
    }

    fn emit(&self, event: &str, payload: Value) {
        let sinks: Vec<_> = lock(&self.hooks)
            .iter()
            .filter(|(_, hook)| hook.wants(event))
            .map(|(_, hook)| hook.sink.clone())
            .collect();
        for sink in sinks {
            sink.emit(event, payload.clone());
        }
    }

    async fn respond(&self, input: &str) -> Result<String, ConnectorError> {
        if let Some(reason) = input.strip_prefix("/fail") {
            return Err(ConnectorError::Provider(format!(
                "scripted failure:{}",
                reason
            )));
        }
        if let Some(rest) = input.strip_prefix("/delegate") {
            let mut parts = rest.trim_start().splitn(2, ' ');
            let agent = parts.next().filter(|a| !a.is_empty()).unwrap_or("self");
            let instruction = parts.next().unwrap_or_default();
            return self.delegate(agent, instruction).await;
        }
        if let Some(prompt) = input.strip_prefix("/approve") {
            let approval = match self.capability(APPROVAL_CAPABILITY) {
                Some(Capability::Approval(approval)) => approval,
                _ => return Err(ConnectorError::CapabilityMissing(APPROVAL_CAPABILITY.into())),
            };
            let options = vec!["allow".to_string(), "deny".to_string()];
            let choice = approval
                .request_approval(prompt.trim(), &options, Duration::from_secs(5), "deny")
                .await;
            return Ok(format!("approval:{}", choice));
        }
        if let Some(message) = input.strip_prefix("/display") {
            if let Some(Capability::Display(display)) = self.capability(DISPLAY_CAPABILITY) {
                display.show_message(message.trim(), DisplayLevel::Info, "mock");
            }
            return Ok(format!("displayed:{}", message.trim()));
        }
        Ok(format!("echo:{}", input))
    }

    async fn delegate(&self, agent: &str, instruction: &str) -> Result<String, ConnectorError> {
        let spawner = match self.capability(SPAWN_CAPABILITY) {
            Some(Capability::Spawn(spawner)) => spawner,
            _ => return Err(ConnectorError::CapabilityMissing(SPAWN_CAPABILITY.into())),
        };
        let tool_call_id = format!("call_{}", Uuid::new_v4().simple());
        self.emit(
            TOOL_PRE,
            json!({
                "tool_name": "delegate",
                "tool_call_id": tool_call_id,
                "tool_input": {"agent": agent, "instruction": instruction},
            }),
        );

        let request = SpawnRequest {
            agent_name: agent.to_string(),
            instruction: instruction.to_string(),
            parent_session_id: self.id.clone(),
            sub_session_id: None,
        };
        match spawner.spawn(request).await {
            Ok(result) => {
                self.emit(
                    TOOL_POST,
                    json!({
                        "tool_name": "delegate",
                        "tool_call_id": tool_call_id,
                        "result": {"output": result.response, "error": null},
                    }),
                );
                Ok(format!("delegated:{}", result.response))
            }
            Err(err) => {
                self.emit(
                    TOOL_ERROR,
                    json!({"tool_call_id": tool_call_id, "error": err.to_string()}),
                );
                Err(err)
            }
        }
    }

    fn stream_response(&self, input: &str, response: &str) {
        self.emit(
            CONTENT_BLOCK_START,
            json!({"block_type": "text", "block_index": 0}),
        );
        if self.behavior.stream_deltas {
            let chars: Vec<char> = response.chars().collect();
            for chunk in chars.chunks(STREAM_CHUNK_CHARS) {
                let text: String = chunk.iter().collect();
                self.emit(
                    CONTENT_BLOCK_DELTA,
                    json!({"block_index": 0, "delta": {"type": "text_delta", "text": text}}),
                );
            }
        }
        self.emit(
            CONTENT_BLOCK_END,
            json!({"block_index": 0, "block": {"type": "text", "text": response}}),
        );
        self.emit(
            LLM_RESPONSE,
            json!({
                "usage": {
                    "input_tokens": input.chars().count(),
                    "output_tokens": response.chars().count(),
                },
                "model": "mock-echo",
                "provider": "mock",
            }),
        );
    }

    async fn run_turn(&self, input: &str) -> Result<String, ConnectorError> {
        let cancelled = self.cancel.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();

        if !self.behavior.run_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.behavior.run_delay) => {}
                _ = &mut cancelled => {
                    self.emit(CANCEL_COMPLETED, json!({}));
                    return Err(ConnectorError::Cancelled);
                }
            }
        }

        let response = self.respond(input).await?;
        self.stream_response(input, &response);

        {
            let mut transcript = lock(&self.transcript);
            transcript.push(TranscriptEntry::text("user", input));
            transcript.push(TranscriptEntry::text("assistant", response.clone()));
        }
        let turn_count = self.turns.fetch_add(1, Ordering::SeqCst) + 1;
        self.emit(ORCHESTRATOR_COMPLETE, json!({"turn_count": turn_count}));
        Ok(response)
    }
}

#[async_trait]
impl ExecutorSession for MockSession {
    fn session_id(&self) -> &str {
        &self.id
    }

    fn project_id(&self) -> &str {
        &self.project_id
    }

    async fn run(&self, input: &str) -> Result<String, ConnectorError> {
        let depth = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(depth, Ordering::SeqCst);
        self.record(format!("start:{}", input));

        let result = self.run_turn(input).await;

        self.record(format!("end:{}", input));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn cancel(&self, level: CancelLevel) {
        lock(&self.cancel_levels).push(level);
        self.emit(CANCEL_REQUESTED, json!({"level": level.as_str()}));
        self.cancel.notify_waiters();
    }

    fn register_hook(&self, hook: HookSpec) -> HookId {
        let id = HookId(self.next_hook.fetch_add(1, Ordering::SeqCst));
        lock(&self.hooks).push((id, hook));
        id
    }

    fn unregister_hook(&self, id: HookId) -> bool {
        let mut hooks = lock(&self.hooks);
        let before = hooks.len();
        hooks.retain(|(hook_id, _)| *hook_id != id);
        hooks.len() != before
    }

    fn register_capability(&self, name: &str, capability: Capability) {
        lock(&self.capabilities).insert(name.to_string(), capability);
    }

    async fn messages(&self) -> Vec<TranscriptEntry> {
        lock(&self.transcript).clone()
    }

    async fn cleanup(&self) {
        self.cleaned_up.store(true, Ordering::SeqCst);
    }
}
