//! Typed, synchronous event bus.
//!
//! Every component emits events through an [`EventBus`] handle that is
//! threaded through the orchestrator explicitly. Payloads are a closed enum
//! per category; the `category.verb` type identifier is derived from the
//! payload, never spelled ad hoc.
//!
//! Emission is synchronous and ordered per process. Handlers must return
//! quickly; anything slow (webhook dispatch, UI refresh) belongs in a
//! subscriber that offloads to its own task.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event category, derivable from the `category.verb` type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Orchestration,
    Lane,
    Task,
    Git,
    Recovery,
    Agent,
    State,
    System,
}

/// Typed event payloads. One closed set per category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    // orchestration.*
    OrchestrationStarted { total_lanes: usize },
    CycleDetected { cycle: Vec<String> },
    OrchestrationCompleted { completed: usize, failed: usize, blocked: usize },
    OrchestrationFailed { error: String },

    // lane.*
    LaneStarted { pipeline_branch: String },
    LaneWaiting { waiting_for: Vec<String> },
    LaneCompleted { tasks: usize },
    LaneFailed { error: String },

    // task.*
    TaskStarted { task: String, index: usize },
    TaskCompleted { task: String, index: usize },
    TaskFailed { task: String, error: String },
    TaskBlocked { task: String, reason: String },

    // git.*
    BranchPushed { branch: String, renamed: bool },
    BranchMerged { branch: String, into: String },
    MergeConflict { branch: String, files: Vec<String> },

    // recovery.*
    ContinueSignal { idle_ms: u64 },
    StrongerPrompt { idle_ms: u64 },
    Restart { restart_count: u32 },
    Diagnosed { agent_installed: bool, auth_ok: bool },
    Aborted { pof_path: String },

    // agent.*
    AgentSpawned { pid: u32, task: String },
    AgentExited { exit_code: Option<i32> },
    AgentTimedOut { elapsed_ms: u64 },

    // state.*
    StateRepaired { issues: Vec<String> },
    CheckpointCreated { checkpoint_id: String },

    // system.*
    Cancelled,
}

impl EventPayload {
    /// The `category.verb` type identifier for this payload.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::OrchestrationStarted { .. } => "orchestration.started",
            EventPayload::CycleDetected { .. } => "orchestration.cycle_detected",
            EventPayload::OrchestrationCompleted { .. } => "orchestration.completed",
            EventPayload::OrchestrationFailed { .. } => "orchestration.failed",
            EventPayload::LaneStarted { .. } => "lane.started",
            EventPayload::LaneWaiting { .. } => "lane.waiting",
            EventPayload::LaneCompleted { .. } => "lane.completed",
            EventPayload::LaneFailed { .. } => "lane.failed",
            EventPayload::TaskStarted { .. } => "task.started",
            EventPayload::TaskCompleted { .. } => "task.completed",
            EventPayload::TaskFailed { .. } => "task.failed",
            EventPayload::TaskBlocked { .. } => "task.blocked_dependency",
            EventPayload::BranchPushed { .. } => "git.pushed",
            EventPayload::BranchMerged { .. } => "git.merged",
            EventPayload::MergeConflict { .. } => "git.merge_conflict",
            EventPayload::ContinueSignal { .. } => "recovery.continue_signal",
            EventPayload::StrongerPrompt { .. } => "recovery.stronger_prompt",
            EventPayload::Restart { .. } => "recovery.restart",
            EventPayload::Diagnosed { .. } => "recovery.diagnosed",
            EventPayload::Aborted { .. } => "recovery.aborted",
            EventPayload::AgentSpawned { .. } => "agent.spawned",
            EventPayload::AgentExited { .. } => "agent.exited",
            EventPayload::AgentTimedOut { .. } => "agent.timed_out",
            EventPayload::StateRepaired { .. } => "state.repaired",
            EventPayload::CheckpointCreated { .. } => "state.checkpoint_created",
            EventPayload::Cancelled => "system.cancelled",
        }
    }

    pub fn category(&self) -> EventCategory {
        match self.event_type().split('.').next().unwrap_or("") {
            "orchestration" => EventCategory::Orchestration,
            "lane" => EventCategory::Lane,
            "task" => EventCategory::Task,
            "git" => EventCategory::Git,
            "recovery" => EventCategory::Recovery,
            "agent" => EventCategory::Agent,
            "state" => EventCategory::State,
            _ => EventCategory::System,
        }
    }
}

/// An immutable event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    /// `category.verb`
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<String>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(run_id: &str, lane: Option<&str>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: payload.event_type().to_string(),
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            lane: lane.map(|l| l.to_string()),
            payload,
        }
    }

    pub fn category(&self) -> EventCategory {
        self.payload.category()
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;
type Filter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Process-local synchronous event bus.
///
/// The listener list is guarded by a mutex and copied out before iteration,
/// so handlers may subscribe further listeners without deadlocking.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<Mutex<Vec<(Filter, Handler)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for events matching `filter`.
    pub fn subscribe<F, H>(&self, filter: F, handler: H)
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
        H: Fn(&Event) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.push((Arc::new(filter), Arc::new(handler)));
    }

    /// Register a handler for every event.
    pub fn subscribe_all<H>(&self, handler: H)
    where
        H: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(|_| true, handler);
    }

    /// Synchronously deliver an event to all matching handlers.
    pub fn emit(&self, event: Event) {
        tracing::debug!(
            event_type = %event.event_type,
            lane = event.lane.as_deref().unwrap_or("-"),
            "event"
        );
        let snapshot: Vec<(Filter, Handler)> = {
            let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners.clone()
        };
        for (filter, handler) in snapshot {
            if filter(&event) {
                handler(&event);
            }
        }
    }

    /// Convenience: build and emit in one call.
    pub fn emit_payload(&self, run_id: &str, lane: Option<&str>, payload: EventPayload) {
        self.emit(Event::new(run_id, lane, payload));
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .listeners
            .lock()
            .map(|l| l.len())
            .unwrap_or(0);
        f.debug_struct("EventBus").field("listeners", &count).finish()
    }
}
