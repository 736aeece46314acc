//! Checkpoint manager.
//!
//! A checkpoint is an immutable value-copy of the lane state plus the
//! captured Git position, written before each task, before dependency
//! merges, and before restart-style recovery. At most `max_checkpoints`
//! are kept per lane; ids are timestamp-prefixed so a lexical sort is a
//! chronological sort.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{lane_files, rand5};
use crate::git::Git;
use crate::model::{LaneState, LaneStatus};
use crate::state;

pub const DEFAULT_MAX_CHECKPOINTS: usize = 5;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("cannot checkpoint {lane:?}: no lane state at {path}")]
    StateMissing { lane: String, path: PathBuf },

    #[error(transparent)]
    State(#[from] state::StateError),
}

/// Captured Git position of a worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSnapshot {
    pub branch: String,
    pub commit: String,
    pub uncommitted_changes: bool,
    pub changed_files: Vec<String>,
}

/// An immutable lane snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// `cp-<ms>-<rand5>`
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub lane: String,
    pub state: LaneState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_state: Option<GitSnapshot>,
    pub task_index: usize,
    pub description: String,
}

/// Result of a restore attempt. Restore never fails hard; problems that do
/// not prevent resuming are reported as warnings.
#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub success: bool,
    pub warnings: Vec<String>,
}

fn new_checkpoint_id() -> String {
    format!("cp-{}-{}", Utc::now().timestamp_millis(), rand5())
}

/// Snapshot the lane's current state (and Git position, when a worktree is
/// given) into `<laneDir>/checkpoints/`, trimming the ring to
/// `max_checkpoints`.
pub async fn create_checkpoint(
    lane_dir: &Path,
    lane: &str,
    worktree_dir: Option<&Path>,
    description: &str,
    max_checkpoints: usize,
) -> Result<Checkpoint, CheckpointError> {
    let state_path = lane_files::state(lane_dir);
    let lane_state: LaneState =
        state::load(&state_path).ok_or_else(|| CheckpointError::StateMissing {
            lane: lane.to_string(),
            path: state_path.clone(),
        })?;

    let git_state = match worktree_dir {
        Some(dir) if dir.exists() => capture_git_snapshot(dir).await,
        _ => None,
    };

    let checkpoint = Checkpoint {
        id: new_checkpoint_id(),
        timestamp: Utc::now(),
        lane: lane.to_string(),
        task_index: lane_state.current_task_index,
        state: lane_state,
        git_state,
        description: description.to_string(),
    };

    let cp_dir = lane_files::checkpoints(lane_dir);
    let cp_path = cp_dir.join(format!("{}.json", checkpoint.id));
    state::save(&cp_path, &checkpoint)?;

    trim_ring(&cp_dir, max_checkpoints);

    tracing::debug!(
        lane = lane,
        checkpoint = %checkpoint.id,
        description = description,
        "checkpoint created"
    );

    Ok(checkpoint)
}

async fn capture_git_snapshot(worktree_dir: &Path) -> Option<GitSnapshot> {
    let git = Git::new(worktree_dir);
    let branch = git.current_branch().await.ok()?;
    let commit = git.head_commit().await.ok()?;
    let changed_files = git.changed_files().await.unwrap_or_default();
    Some(GitSnapshot {
        branch,
        uncommitted_changes: !changed_files.is_empty(),
        changed_files,
        commit,
    })
}

/// Keep only the newest `max` checkpoints. Ids sort chronologically.
fn trim_ring(cp_dir: &Path, max: usize) {
    let Ok(entries) = std::fs::read_dir(cp_dir) else {
        return;
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.starts_with("cp-") && n.ends_with(".json"))
        .collect();
    if names.len() <= max {
        return;
    }
    names.sort();
    let excess = names.len() - max;
    for name in names.into_iter().take(excess) {
        let path = cp_dir.join(&name);
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to trim checkpoint");
        }
    }
}

/// List a lane's checkpoints, newest first.
pub fn list_checkpoints(lane_dir: &Path) -> Vec<Checkpoint> {
    let cp_dir = lane_files::checkpoints(lane_dir);
    let Ok(entries) = std::fs::read_dir(&cp_dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();
    paths.reverse();
    paths
        .iter()
        .filter_map(|p| state::load::<Checkpoint>(p))
        .collect()
}

/// Options for [`restore_from_checkpoint`].
#[derive(Debug, Default)]
pub struct RestoreOptions<'a> {
    /// Also move the worktree back to the captured commit (stashing any
    /// uncommitted changes first).
    pub restore_git_state: bool,
    pub worktree_dir: Option<&'a Path>,
}

/// Reset the lane state to the snapshot, forcing status to `pending` and
/// clearing the error so the lane can be re-run from the checkpoint.
pub async fn restore_from_checkpoint(
    checkpoint: &Checkpoint,
    lane_dir: &Path,
    opts: RestoreOptions<'_>,
) -> RestoreReport {
    let mut warnings = Vec::new();

    let mut restored = checkpoint.state.clone();
    restored.status = LaneStatus::Pending;
    restored.error = None;
    restored.touch();

    let state_path = lane_files::state(lane_dir);
    if let Err(e) = state::save(&state_path, &restored) {
        return RestoreReport {
            success: false,
            warnings: vec![format!("failed to write restored state: {e}")],
        };
    }

    if opts.restore_git_state {
        match (&checkpoint.git_state, opts.worktree_dir) {
            (Some(snapshot), Some(dir)) if dir.exists() => {
                let git = Git::new(dir);
                match git.stash_push(&format!("laneflow restore {}", checkpoint.id)).await {
                    Ok(true) => {
                        tracing::info!(lane = %checkpoint.lane, "stashed uncommitted changes before restore");
                    }
                    Ok(false) => {}
                    Err(e) => warnings.push(format!("stash failed: {e}")),
                }
                if let Err(e) = git.checkout(&snapshot.commit).await {
                    warnings.push(format!("checkout of {} failed: {e}", snapshot.commit));
                }
            }
            (Some(_), Some(dir)) => {
                warnings.push(format!("worktree missing at {}, git state not restored", dir.display()));
            }
            (Some(_), None) => {
                warnings.push("no worktree directory given, git state not restored".to_string());
            }
            (None, _) => {}
        }
    }

    RestoreReport {
        success: true,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn seed_state(lane_dir: &Path) -> LaneState {
        let state = LaneState::new("lane-a", 3, PathBuf::from("lane-a.json"), vec![]);
        state::save(&lane_files::state(lane_dir), &state).unwrap();
        state
    }

    #[tokio::test]
    async fn checkpoint_requires_lane_state() {
        let dir = TempDir::new().unwrap();
        let err = create_checkpoint(dir.path(), "lane-a", None, "before task 1", 5)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::StateMissing { .. }));
    }

    #[tokio::test]
    async fn checkpoint_snapshots_state() {
        let dir = TempDir::new().unwrap();
        let state = seed_state(dir.path());

        let cp = create_checkpoint(dir.path(), "lane-a", None, "before task 1", 5)
            .await
            .unwrap();
        assert!(cp.id.starts_with("cp-"));
        assert_eq!(cp.state, state);
        assert_eq!(cp.task_index, 0);
        assert!(cp.git_state.is_none());

        let listed = list_checkpoints(dir.path());
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, cp.id);
    }

    #[tokio::test]
    async fn ring_is_bounded() {
        let dir = TempDir::new().unwrap();
        seed_state(dir.path());

        for i in 0..8 {
            create_checkpoint(dir.path(), "lane-a", None, &format!("cp {i}"), 3)
                .await
                .unwrap();
            // Millisecond ids must differ for a deterministic sort.
            tokio::time::sleep(std::time::Duration::from_millis(3)).await;
        }

        let listed = list_checkpoints(dir.path());
        assert_eq!(listed.len(), 3);
        // Newest first: the surviving ones are from the last three rounds.
        assert_eq!(listed[0].description, "cp 7");
        assert_eq!(listed[2].description, "cp 5");
    }

    #[tokio::test]
    async fn restore_resets_status_and_error() {
        let dir = TempDir::new().unwrap();
        let mut state = seed_state(dir.path());

        let cp = create_checkpoint(dir.path(), "lane-a", None, "good point", 5)
            .await
            .unwrap();

        // Lane later fails.
        state.status = LaneStatus::Failed;
        state.error = Some("agent exploded".to_string());
        state.current_task_index = 2;
        state::save(&lane_files::state(dir.path()), &state).unwrap();

        let report = restore_from_checkpoint(&cp, dir.path(), RestoreOptions::default()).await;
        assert!(report.success);
        assert!(report.warnings.is_empty());

        let restored: LaneState = state::load(&lane_files::state(dir.path())).unwrap();
        assert_eq!(restored.status, LaneStatus::Pending);
        assert_eq!(restored.error, None);
        assert_eq!(restored.current_task_index, 0);
    }

    #[tokio::test]
    async fn restore_with_missing_worktree_warns() {
        let dir = TempDir::new().unwrap();
        seed_state(dir.path());
        let mut cp = create_checkpoint(dir.path(), "lane-a", None, "cp", 5)
            .await
            .unwrap();
        cp.git_state = Some(GitSnapshot {
            branch: "lane/x".to_string(),
            commit: "deadbeef".to_string(),
            uncommitted_changes: false,
            changed_files: vec![],
        });

        let gone = dir.path().join("no-such-worktree");
        let report = restore_from_checkpoint(
            &cp,
            dir.path(),
            RestoreOptions {
                restore_git_state: true,
                worktree_dir: Some(&gone),
            },
        )
        .await;
        assert!(report.success);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("worktree missing"));
    }
}
