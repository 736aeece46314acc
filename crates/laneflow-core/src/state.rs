//! Durable state store.
//!
//! JSON documents are written atomically (`<path>.<rand5>.tmp` + rename),
//! so a reader never observes a partially written state. Event and
//! conversation logs are append-only line-delimited JSON.
//!
//! Loading is tolerant by default: a missing or corrupt file yields `None`
//! and a log line rather than an error, because a half-provisioned lane
//! directory is an expected sight during resume.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::config::rand5;
use crate::git::Git;
use crate::locks::pid_alive;
use crate::model::{LaneState, LaneStatus};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("i/o error during {operation} on {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state corrupted at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("state file missing: {0}")]
    Missing(PathBuf),
}

/// Atomically persist a JSON document.
///
/// Writes to `<path>.<rand5>.tmp` in the same directory, then renames over
/// the destination. The temp file is removed on any failure. The parent
/// directory is created if missing.
pub fn save<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StateError::Io {
            operation: "create_dir",
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(format!(".{}.tmp", rand5()));
    let tmp = PathBuf::from(tmp);
    let write_result = (|| -> Result<(), StateError> {
        let json = serde_json::to_string_pretty(value).map_err(|e| StateError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut file = std::fs::File::create(&tmp).map_err(|e| StateError::Io {
            operation: "create",
            path: tmp.clone(),
            source: e,
        })?;
        file.write_all(json.as_bytes()).map_err(|e| StateError::Io {
            operation: "write",
            path: tmp.clone(),
            source: e,
        })?;
        file.sync_all().map_err(|e| StateError::Io {
            operation: "sync",
            path: tmp.clone(),
            source: e,
        })?;
        std::fs::rename(&tmp, path).map_err(|e| StateError::Io {
            operation: "rename",
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(())
    })();

    if write_result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    write_result
}

/// Load a JSON document, returning `None` on a missing or invalid file.
pub fn load<T: DeserializeOwned>(path: &Path) -> Option<T> {
    match load_strict(path) {
        Ok(value) => Some(value),
        Err(StateError::Missing(_)) => None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable state file");
            None
        }
    }
}

/// Load a JSON document, surfacing parse failures as [`StateError::Parse`].
pub fn load_strict<T: DeserializeOwned>(path: &Path) -> Result<T, StateError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StateError::Missing(path.to_path_buf()));
        }
        Err(e) => {
            return Err(StateError::Io {
                operation: "read",
                path: path.to_path_buf(),
                source: e,
            });
        }
    };
    serde_json::from_slice(&bytes).map_err(|e| StateError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Append one JSON line to a line-delimited log.
pub fn append_log<T: Serialize>(path: &Path, entry: &T) -> Result<(), StateError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StateError::Io {
            operation: "create_dir",
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    let mut line = serde_json::to_string(entry).map_err(|e| StateError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    line.push('\n');
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StateError::Io {
            operation: "open",
            path: path.to_path_buf(),
            source: e,
        })?;
    file.write_all(line.as_bytes()).map_err(|e| StateError::Io {
        operation: "append",
        path: path.to_path_buf(),
        source: e,
    })
}

/// A problem found while validating a persisted lane state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateIssue {
    MissingField(String),
    IndexOutOfRange { current: usize, total: usize },
    WorktreeMissing(PathBuf),
    BranchMissing(String),
    Corrupt(String),
}

impl std::fmt::Display for StateIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateIssue::MissingField(name) => write!(f, "missing field {name:?}"),
            StateIssue::IndexOutOfRange { current, total } => {
                write!(f, "currentTaskIndex {current} exceeds totalTasks {total}")
            }
            StateIssue::WorktreeMissing(path) => {
                write!(f, "worktree missing: {}", path.display())
            }
            StateIssue::BranchMissing(branch) => write!(f, "branch missing: {branch}"),
            StateIssue::Corrupt(msg) => write!(f, "corrupt state: {msg}"),
        }
    }
}

/// Result of [`validate`].
#[derive(Debug)]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<StateIssue>,
    pub repaired: bool,
    pub repaired_state: Option<LaneState>,
}

/// Options for [`validate`].
pub struct ValidateOptions<'a> {
    /// Verify that the referenced worktree directory exists.
    pub check_worktree: bool,
    /// Verify that the pipeline branch exists, via this repo handle.
    pub check_branch: Option<&'a Git>,
    /// Write a repaired state back to disk when issues are found.
    pub auto_repair: bool,
}

impl Default for ValidateOptions<'_> {
    fn default() -> Self {
        Self {
            check_worktree: true,
            check_branch: None,
            auto_repair: false,
        }
    }
}

const REQUIRED_FIELDS: &[&str] = &[
    "label",
    "status",
    "currentTaskIndex",
    "totalTasks",
    "startTime",
    "tasksFile",
    "updatedAt",
];

/// Validate a persisted lane state and optionally repair it.
///
/// Repair clamps an out-of-range task index, clears references to a
/// worktree or branch that no longer exist, and resets the status to
/// `pending` so the lane can be resumed.
pub async fn validate(path: &Path, opts: ValidateOptions<'_>) -> Result<ValidationReport, StateError> {
    let raw: serde_json::Value = load_strict(path)?;
    let mut issues = Vec::new();

    for field in REQUIRED_FIELDS {
        if raw.get(field).is_none() {
            issues.push(StateIssue::MissingField(field.to_string()));
        }
    }

    let state: Option<LaneState> = match serde_json::from_value(raw) {
        Ok(s) => Some(s),
        Err(e) => {
            if issues.is_empty() {
                issues.push(StateIssue::Corrupt(e.to_string()));
            }
            None
        }
    };

    let Some(mut state) = state else {
        return Ok(ValidationReport {
            valid: false,
            issues,
            repaired: false,
            repaired_state: None,
        });
    };

    if state.current_task_index > state.total_tasks {
        issues.push(StateIssue::IndexOutOfRange {
            current: state.current_task_index,
            total: state.total_tasks,
        });
    }

    if opts.check_worktree {
        if let Some(dir) = &state.worktree_dir {
            if !dir.exists() {
                issues.push(StateIssue::WorktreeMissing(dir.clone()));
            }
        }
    }

    if let Some(git) = opts.check_branch {
        if let Some(branch) = &state.pipeline_branch {
            match git.branch_exists(branch, false).await {
                Ok(false) => issues.push(StateIssue::BranchMissing(branch.clone())),
                Ok(true) => {}
                Err(e) => {
                    tracing::warn!(branch = %branch, error = %e, "branch check failed, skipping");
                }
            }
        }
    }

    if issues.is_empty() {
        return Ok(ValidationReport {
            valid: true,
            issues,
            repaired: false,
            repaired_state: None,
        });
    }

    if !opts.auto_repair {
        return Ok(ValidationReport {
            valid: false,
            issues,
            repaired: false,
            repaired_state: None,
        });
    }

    // Repair: clamp, clear dangling references, reset for resume.
    for issue in &issues {
        match issue {
            StateIssue::IndexOutOfRange { .. } => {
                state.current_task_index = state.total_tasks;
            }
            StateIssue::WorktreeMissing(_) => {
                state.worktree_dir = None;
            }
            StateIssue::BranchMissing(_) => {
                state.pipeline_branch = None;
            }
            _ => {}
        }
    }
    state.status = LaneStatus::Pending;
    state.error = None;
    state.touch();
    save(path, &state)?;

    tracing::info!(
        path = %path.display(),
        issues = issues.len(),
        "repaired lane state for resume"
    );

    Ok(ValidationReport {
        valid: false,
        issues,
        repaired: true,
        repaired_state: Some(state),
    })
}

/// Whether the persisted state belongs to a crashed worker: status says
/// `running` or `reviewing` but the recorded pid is gone.
pub fn needs_recovery(path: &Path) -> bool {
    let Some(state) = load::<LaneState>(path) else {
        return false;
    };
    if !matches!(state.status, LaneStatus::Running | LaneStatus::Reviewing) {
        return false;
    }
    match state.pid {
        Some(pid) => !pid_alive(pid),
        None => true,
    }
}
