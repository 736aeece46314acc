//! Post-mortem of failure (POF) documents.
//!
//! When the recovery ladder aborts a lane, a durable JSON record is written
//! describing what happened, what was tried, and how to resume. Writing a
//! second POF for the same run pushes the prior document into
//! `previousFailures`, forming a history chain.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::recovery::{FailureRecord, RecoverySnapshot};
use crate::state::{self, StateError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootCause {
    #[serde(rename = "type")]
    pub cause_type: String,
    pub description: String,
    pub symptoms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffectedLane {
    pub lane: String,
    pub recovery_attempts: Vec<FailureRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryHint {
    pub command: String,
    pub alternative_command: String,
}

/// The durable post-mortem record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMortem {
    pub title: String,
    pub run_id: String,
    pub failure_time: DateTime<Utc>,
    pub summary: String,
    pub root_cause: RootCause,
    pub affected_lanes: Vec<AffectedLane>,
    pub possible_causes: Vec<String>,
    pub recovery: RecoveryHint,
    #[serde(default)]
    pub previous_failures: Vec<PostMortem>,
}

/// Path of the POF document for a run.
pub fn pof_path(pof_dir: &Path, run_id: &str) -> PathBuf {
    pof_dir.join(format!("pof-{run_id}.json"))
}

/// Compose a POF from a lane's recovery snapshot and diagnostics.
pub fn compose_post_mortem(
    run_id: &str,
    run_dir: &Path,
    lane: &str,
    snapshot: &RecoverySnapshot,
) -> PostMortem {
    let diagnostics = snapshot.diagnostics.as_ref();

    let (cause_type, description) = match diagnostics {
        Some(d) if !d.agent_installed => (
            "agent_missing",
            "The agent binary could not be executed.".to_string(),
        ),
        Some(d) if !d.auth_ok => (
            "auth",
            "The agent rejected the authentication probe.".to_string(),
        ),
        Some(d) if !d.workspace_writable => (
            "filesystem",
            "The lane worktree is not writable.".to_string(),
        ),
        Some(d) if !d.remote_reachable => (
            "network",
            "The Git remote could not be reached.".to_string(),
        ),
        _ => (
            "stall",
            format!(
                "The agent produced no output despite {} continue signal(s) and {} restart(s).",
                snapshot.continue_signals_sent, snapshot.restart_count
            ),
        ),
    };

    let mut symptoms = vec![format!(
        "{} bytes of output received before the stall",
        snapshot.total_bytes
    )];
    if let Some(last) = snapshot.last_output.last() {
        symptoms.push(format!("last output: {last:?}"));
    }
    if let Some(d) = diagnostics {
        symptoms.extend(d.notes.iter().cloned());
    }

    let mut possible_causes = vec![
        "The agent is waiting on input it can never receive".to_string(),
        "A long-running command hung inside the worktree".to_string(),
    ];
    match cause_type {
        "auth" => possible_causes.insert(0, "Expired or missing agent credentials".to_string()),
        "network" => possible_causes.insert(0, "Network outage or unreachable Git remote".to_string()),
        _ => {}
    }

    PostMortem {
        title: format!("Lane {lane} aborted after exhausting recovery"),
        run_id: run_id.to_string(),
        failure_time: Utc::now(),
        summary: format!(
            "Lane {lane} was aborted at recovery stage {:?} after {} restart(s).",
            snapshot.stage, snapshot.restart_count
        ),
        root_cause: RootCause {
            cause_type: cause_type.to_string(),
            description,
            symptoms,
        },
        affected_lanes: vec![AffectedLane {
            lane: lane.to_string(),
            recovery_attempts: snapshot.failure_history.clone(),
        }],
        possible_causes,
        recovery: RecoveryHint {
            command: format!("resume --all --run-dir {}", run_dir.display()),
            alternative_command: format!("resume --all --restart --run-dir {}", run_dir.display()),
        },
        previous_failures: Vec::new(),
    }
}

/// Atomically write a POF, chaining any existing document for the same run
/// into `previousFailures`.
pub fn write_post_mortem(
    pof_dir: &Path,
    mut pof: PostMortem,
) -> Result<PathBuf, StateError> {
    let path = pof_path(pof_dir, &pof.run_id);

    if let Some(mut existing) = state::load::<PostMortem>(&path) {
        let mut chain = std::mem::take(&mut existing.previous_failures);
        chain.push(existing);
        pof.previous_failures = chain;
    }

    state::save(&path, &pof)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::{DiagnosticInfo, RecoveryStage};
    use tempfile::TempDir;

    fn snapshot() -> RecoverySnapshot {
        RecoverySnapshot {
            stage: RecoveryStage::Abort,
            restart_count: 1,
            continue_signals_sent: 1,
            total_bytes: 0,
            last_output: vec![],
            failure_history: vec![],
            diagnostics: None,
        }
    }

    #[test]
    fn first_write_has_no_previous_failures() {
        let dir = TempDir::new().unwrap();
        let pof = compose_post_mortem("run-1", Path::new("/runs/run-1"), "lane-a", &snapshot());
        let path = write_post_mortem(dir.path(), pof).unwrap();
        assert_eq!(path.file_name().unwrap(), "pof-run-1.json");

        let loaded: PostMortem = state::load(&path).unwrap();
        assert!(loaded.previous_failures.is_empty());
        assert_eq!(loaded.root_cause.cause_type, "stall");
        assert!(loaded.recovery.command.contains("resume --all --run-dir"));
        assert!(loaded.recovery.alternative_command.contains("--restart"));
    }

    #[test]
    fn second_write_chains_the_first() {
        let dir = TempDir::new().unwrap();
        let first = compose_post_mortem("run-1", Path::new("/r"), "lane-a", &snapshot());
        write_post_mortem(dir.path(), first.clone()).unwrap();

        let second = compose_post_mortem("run-1", Path::new("/r"), "lane-b", &snapshot());
        let path = write_post_mortem(dir.path(), second).unwrap();

        let loaded: PostMortem = state::load(&path).unwrap();
        assert_eq!(loaded.previous_failures.len(), 1);
        assert_eq!(loaded.previous_failures[0].title, first.title);
        assert_eq!(loaded.affected_lanes[0].lane, "lane-b");

        // Third write extends the chain in order.
        let third = compose_post_mortem("run-1", Path::new("/r"), "lane-c", &snapshot());
        write_post_mortem(dir.path(), third).unwrap();
        let loaded: PostMortem = state::load(&path).unwrap();
        assert_eq!(loaded.previous_failures.len(), 2);
        assert_eq!(loaded.previous_failures[0].affected_lanes[0].lane, "lane-a");
        assert_eq!(loaded.previous_failures[1].affected_lanes[0].lane, "lane-b");
    }

    #[test]
    fn diagnostics_drive_root_cause() {
        let mut snap = snapshot();
        snap.diagnostics = Some(DiagnosticInfo {
            agent_installed: true,
            auth_ok: false,
            workspace_writable: true,
            remote_reachable: true,
            notes: vec!["probe returned 401".to_string()],
        });
        let pof = compose_post_mortem("run-2", Path::new("/r"), "lane-a", &snap);
        assert_eq!(pof.root_cause.cause_type, "auth");
        assert!(pof.root_cause.symptoms.iter().any(|s| s.contains("401")));
    }
}
