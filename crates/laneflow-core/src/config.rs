//! Engine configuration and the on-disk layout of a run.
//!
//! All paths are derived from the repository root. Durable artifacts live
//! under `<repo>/.laneflow`; worktrees live in a sibling directory of the
//! repository so they never shadow tracked files.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory name for laneflow-internal files, both at the repository root
/// (`<repo>/.laneflow`) and inside each worktree (`<worktree>/.laneflow`).
pub const INTERNAL_DIR: &str = ".laneflow";

/// Top-level configuration for a single flow run.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Root of the Git repository the lanes operate on.
    pub repo_root: PathBuf,
    /// Directory containing the `*.json` lane specifications.
    pub tasks_dir: PathBuf,
    /// Root for run logs and state. Defaults to `<repo_root>/.laneflow`.
    pub logs_dir: PathBuf,
    /// Stable run identifier, `run-<unixMs>`.
    pub run_id: String,
    /// Branch lanes are created from. Defaults to the current branch.
    pub base_branch: Option<String>,
    /// Prefix for generated pipeline branch names.
    pub branch_prefix: String,
    /// Name of the final integration branch. Derived from the tasks
    /// directory name when unset.
    pub feature_branch: Option<String>,
    /// Maximum number of lane workers running at once.
    pub max_concurrent_lanes: usize,
    /// Default wall-time limit per task. Task and lane specs may override.
    pub task_timeout: Duration,
    /// How long a task-level `lane:task` wait may block.
    pub dependency_wait_timeout: Duration,
    /// How often dependency state files are polled during a wait.
    pub dependency_poll_interval: Duration,
    /// Delete lane pipeline branches (local and remote) after a successful
    /// integration.
    pub cleanup_lane_branches: bool,
    /// Root directory for lane worktrees. Defaults to a sibling of the
    /// repository named `<repo-name>-laneflow-worktrees`.
    pub worktree_root: Option<PathBuf>,
    /// Agent CLI settings.
    pub agent: AgentConfig,
    /// Stall detection and recovery settings.
    pub stall: StallConfig,
}

impl FlowConfig {
    /// Build a config with defaults for a repository and tasks directory.
    pub fn new(repo_root: impl Into<PathBuf>, tasks_dir: impl Into<PathBuf>) -> Self {
        let repo_root = repo_root.into();
        let logs_dir = repo_root.join(INTERNAL_DIR);
        Self {
            repo_root,
            tasks_dir: tasks_dir.into(),
            logs_dir,
            run_id: new_run_id(),
            base_branch: None,
            branch_prefix: "lane/".to_string(),
            feature_branch: None,
            max_concurrent_lanes: 10,
            task_timeout: Duration::from_secs(600),
            dependency_wait_timeout: Duration::from_secs(1800),
            dependency_poll_interval: Duration::from_secs(5),
            cleanup_lane_branches: false,
            worktree_root: None,
            agent: AgentConfig::default(),
            stall: StallConfig::default(),
        }
    }

    /// `<logs_dir>/runs/<run_id>`
    pub fn run_dir(&self) -> PathBuf {
        self.logs_dir.join("runs").join(&self.run_id)
    }

    /// `<run_dir>/lanes`
    pub fn lanes_dir(&self) -> PathBuf {
        self.run_dir().join("lanes")
    }

    /// `<run_dir>/lanes/<lane>`
    pub fn lane_dir(&self, lane: &str) -> PathBuf {
        self.lanes_dir().join(lane)
    }

    /// `<run_dir>/flow.json`
    pub fn flow_meta_path(&self) -> PathBuf {
        self.run_dir().join("flow.json")
    }

    /// Directory post-mortem documents are written to.
    pub fn pof_dir(&self) -> PathBuf {
        self.logs_dir.join("postmortems")
    }

    /// Directory for cross-process lock files.
    pub fn locks_dir(&self) -> PathBuf {
        self.repo_root.join(INTERNAL_DIR).join("locks")
    }

    /// Root directory under which lane worktrees are created for this run.
    pub fn worktree_base(&self) -> PathBuf {
        let base = self.worktree_root.clone().unwrap_or_else(|| {
            let repo_name = self
                .repo_root
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("repo");
            let base_name = format!("{repo_name}-laneflow-worktrees");
            self.repo_root
                .parent()
                .map(|p| p.join(&base_name))
                .unwrap_or_else(|| PathBuf::from(base_name))
        });
        base.join(&self.run_id)
    }

    /// Name of the integration branch, derived from the tasks directory
    /// when not configured explicitly.
    pub fn feature_branch_name(&self) -> String {
        if let Some(name) = &self.feature_branch {
            return name.clone();
        }
        let dir_name = self
            .tasks_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("flow");
        format!("flow/{dir_name}")
    }
}

/// Settings for the external agent CLI.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Path to the agent binary. Defaults to `cursor-agent` on `$PATH`.
    pub binary: String,
    /// Value passed to `--output-format`.
    pub output_format: OutputFormat,
    /// Keep the child's stdin open so interventions can be forwarded.
    pub intervention_enabled: bool,
    /// Mirror the child's stdout/stderr to the parent process.
    pub echo_output: bool,
    /// Budget for the startup authentication probe.
    pub auth_probe_timeout: Duration,
    /// Attempts per task for transient failures.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt, capped at 30 s.
    pub retry_base_delay: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: "cursor-agent".to_string(),
            output_format: OutputFormat::StreamJson,
            intervention_enabled: true,
            echo_output: true,
            auth_probe_timeout: Duration::from_secs(10),
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Agent output format requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    StreamJson,
    Json,
    Plain,
}

impl OutputFormat {
    pub fn as_arg(&self) -> &'static str {
        match self {
            OutputFormat::StreamJson => "stream-json",
            OutputFormat::Json => "json",
            OutputFormat::Plain => "plain",
        }
    }
}

/// Stall detection and tiered-recovery settings.
#[derive(Debug, Clone)]
pub struct StallConfig {
    /// Idle time (no stdout bytes) before the recovery ladder engages.
    pub idle_timeout: Duration,
    /// Idle allowance while a long operation (install, compile, ...) is
    /// believed to be in progress.
    pub long_operation_grace: Duration,
    /// Minimum time between two ladder transitions.
    pub stage_grace: Duration,
    /// How often lane idle state is evaluated.
    pub tick_interval: Duration,
    /// Agent restarts allowed before diagnosing and aborting.
    pub max_restarts: u32,
    /// Regex patterns that mark the last output snippet as a long
    /// operation. Empty by default.
    pub long_operation_patterns: Vec<String>,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            long_operation_grace: Duration::from_secs(300),
            stage_grace: Duration::from_secs(60),
            tick_interval: Duration::from_secs(10),
            max_restarts: 2,
            long_operation_patterns: Vec::new(),
        }
    }
}

/// Generate a run identifier from the current wall clock.
pub fn new_run_id() -> String {
    let ms = chrono::Utc::now().timestamp_millis();
    format!("run-{ms}")
}

/// Five random lowercase alphanumeric characters, used in branch names,
/// checkpoint ids and temp-file suffixes.
pub fn rand5() -> String {
    use rand::Rng;
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..5)
        .map(|_| CHARS[rng.random_range(0..CHARS.len())] as char)
        .collect()
}

/// Milliseconds since the epoch rendered in base 36, used in generated
/// pipeline branch names.
pub fn timestamp_base36() -> String {
    let mut n = chrono::Utc::now().timestamp_millis() as u64;
    if n == 0 {
        return "0".to_string();
    }
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Generate a pipeline branch name: `<prefix><timestamp-base36>-<rand5>`.
pub fn generate_pipeline_branch(prefix: &str) -> String {
    format!("{prefix}{}-{}", timestamp_base36(), rand5())
}

/// Check a lane or task name against the allowed alphabet.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Path helpers for files inside a lane run directory.
pub mod lane_files {
    use super::*;

    pub fn state(lane_dir: &Path) -> PathBuf {
        lane_dir.join("state.json")
    }

    pub fn conversation_log(lane_dir: &Path) -> PathBuf {
        lane_dir.join("conversation.jsonl")
    }

    pub fn terminal_log(lane_dir: &Path) -> PathBuf {
        lane_dir.join("terminal.jsonl")
    }

    pub fn checkpoints(lane_dir: &Path) -> PathBuf {
        lane_dir.join("checkpoints")
    }

    pub fn pending_intervention(lane_dir: &Path) -> PathBuf {
        lane_dir.join("pending-intervention.json")
    }

    pub fn intervention(lane_dir: &Path) -> PathBuf {
        lane_dir.join("intervention.txt")
    }

    pub fn timeout_override(lane_dir: &Path) -> PathBuf {
        lane_dir.join("timeout.txt")
    }
}
