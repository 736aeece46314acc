//! Persisted domain types: lane state, flow metadata, task results and the
//! dependency-request contract.
//!
//! Field names use camelCase on disk; the file formats are a stable external
//! interface consumed by viewers and resume tooling.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lane lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneStatus {
    Pending,
    Running,
    Waiting,
    Paused,
    Reviewing,
    Completed,
    Failed,
}

impl fmt::Display for LaneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LaneStatus::Pending => "pending",
            LaneStatus::Running => "running",
            LaneStatus::Waiting => "waiting",
            LaneStatus::Paused => "paused",
            LaneStatus::Reviewing => "reviewing",
            LaneStatus::Completed => "completed",
            LaneStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Overall flow status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Running,
    Completed,
    Failed,
    Partial,
}

/// A structured request from the agent to change external dependencies
/// instead of making the change itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyRequest {
    pub reason: String,
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Per-lane dependency policy, enforced via file permissions and the
/// dependency-request marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyPolicy {
    /// Whether the agent may change package manifests itself.
    #[serde(default)]
    pub allow_dependency_change: bool,
    /// Whether lockfiles are made read-only before each task.
    #[serde(default = "default_true")]
    pub lockfile_read_only: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DependencyPolicy {
    fn default() -> Self {
        Self {
            allow_dependency_change: false,
            lockfile_read_only: true,
        }
    }
}

/// Durable per-lane state, persisted to `state.json` after every step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneState {
    /// Lane name.
    pub label: String,
    pub status: LaneStatus,
    /// Index of the next task to run. Monotonic except on checkpoint
    /// restore.
    pub current_task_index: usize,
    pub total_tasks: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_branch: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_request: Option<DependencyRequest>,
    /// Path of the lane spec file this lane was parsed from.
    pub tasks_file: PathBuf,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Names of tasks that have fully completed, in execution order.
    #[serde(default)]
    pub completed_tasks: Vec<String>,
    /// Outstanding `lane:task` waits, empty unless status is `waiting`.
    #[serde(default)]
    pub waiting_for: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    /// Pid of the worker process that owns this lane, for liveness checks.
    #[serde(default)]
    pub pid: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

impl LaneState {
    /// Fresh state for a lane that has not started yet.
    pub fn new(label: &str, total_tasks: usize, tasks_file: PathBuf, depends_on: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            label: label.to_string(),
            status: LaneStatus::Pending,
            current_task_index: 0,
            total_tasks,
            worktree_dir: None,
            pipeline_branch: None,
            start_time: now,
            end_time: None,
            error: None,
            dependency_request: None,
            tasks_file,
            depends_on,
            completed_tasks: Vec::new(),
            waiting_for: Vec::new(),
            chat_id: None,
            pid: Some(std::process::id()),
            updated_at: now,
        }
    }

    /// Stamp `updated_at`; call before every persist.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether the completed-lane invariants hold.
    pub fn completed_invariants_hold(&self) -> bool {
        self.status != LaneStatus::Completed
            || (self.end_time.is_some()
                && self.current_task_index == self.total_tasks
                && self.completed_tasks.len() == self.total_tasks)
    }
}

/// Terminal result of a whole lane.
#[derive(Debug, Clone, PartialEq)]
pub enum LaneOutcome {
    Completed,
    Failed { error: String },
    BlockedDependency { request: DependencyRequest },
}

/// Conflict details recorded in flow metadata when integration aborts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationConflict {
    pub lane: String,
    pub files: Vec<String>,
}

/// Flow metadata, persisted to `<runDir>/flow.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowMeta {
    pub run_id: String,
    pub base_branch: String,
    pub branch_prefix: String,
    pub feature_branch: String,
    pub started_at: DateTime<Utc>,
    pub status: FlowStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrated_branch: Option<String>,
    #[serde(default)]
    pub lanes_completed: usize,
    #[serde(default)]
    pub lanes_failed: usize,
    #[serde(default)]
    pub lanes_blocked: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<IntegrationConflict>,
}

/// Roles recorded in the conversation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationRole {
    User,
    Assistant,
    System,
    Intervention,
}

/// One line of `conversation.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEntry {
    pub timestamp: DateTime<Utc>,
    pub role: ConversationRole,
    pub task: String,
    pub full_text: String,
    pub text_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ConversationEntry {
    pub fn new(role: ConversationRole, task: &str, text: &str, model: Option<&str>) -> Self {
        Self {
            timestamp: Utc::now(),
            role,
            task: task.to_string(),
            full_text: text.to_string(),
            text_length: text.len(),
            model: model.map(|m| m.to_string()),
        }
    }
}
