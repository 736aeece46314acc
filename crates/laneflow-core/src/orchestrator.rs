//! DAG-aware orchestrator: runs a flow to completion by spawning one lane
//! runner per runnable lane, honoring `dependsOn` order and the
//! concurrency limit, propagating dependency failures, and invoking the
//! flow integrator once every lane is terminal.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::agent::AgentSupervisor;
use crate::config::{FlowConfig, lane_files};
use crate::events::{EventBus, EventPayload};
use crate::git::Git;
use crate::integrate;
use crate::lane::{LaneRunner, RunnerContext};
use crate::locks::LockManager;
use crate::model::{FlowMeta, FlowStatus, LaneOutcome, LaneState, LaneStatus};
use crate::recovery::StallDetector;
use crate::spec::{self, Lane, SpecError};
use crate::state;

/// Terminal outcome of a whole flow, mapped onto the CLI exit codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutcome {
    /// Every lane completed and integration succeeded.
    Completed,
    /// At least one lane failed (or integration did).
    Failed,
    /// Some lanes completed, some failed; completed work was integrated.
    Partial,
    /// One or more lanes blocked on a dependency change.
    Blocked,
    /// The lane specs did not validate (cycle, unknown dependency,
    /// duplicate task name, ...).
    ValidationFailed,
    /// No repo, no agent, or no auth.
    PreflightFailed,
}

impl FlowOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            FlowOutcome::Completed => 0,
            FlowOutcome::Failed | FlowOutcome::Partial => 1,
            FlowOutcome::Blocked => 2,
            FlowOutcome::ValidationFailed => 3,
            FlowOutcome::PreflightFailed => 4,
        }
    }
}

/// Final report returned to the CLI.
#[derive(Debug, Clone)]
pub struct FlowReport {
    pub outcome: FlowOutcome,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub blocked: Vec<String>,
    pub integrated_branch: Option<String>,
    pub run_dir: PathBuf,
    /// One-line human message describing what happened.
    pub message: String,
}

struct LaneDone {
    lane: String,
    outcome: LaneOutcome,
}

pub struct Orchestrator {
    cfg: Arc<FlowConfig>,
    bus: EventBus,
}

impl Orchestrator {
    pub fn new(cfg: Arc<FlowConfig>, bus: EventBus) -> Self {
        Self { cfg, bus }
    }

    /// Run (or resume) the flow.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<FlowReport> {
        let run_dir = self.cfg.run_dir();

        // ------------------------------------------------------------------
        // 1. Parse and validate lane specs.
        // ------------------------------------------------------------------
        let lanes = match spec::load_lanes(&self.cfg.tasks_dir) {
            Ok(lanes) => lanes,
            Err(e) => {
                if let SpecError::CycleDetected(_) = &e {
                    self.bus.emit_payload(
                        &self.cfg.run_id,
                        None,
                        EventPayload::CycleDetected {
                            cycle: e.cycle_lanes().unwrap_or_default(),
                        },
                    );
                }
                return Ok(FlowReport {
                    outcome: FlowOutcome::ValidationFailed,
                    completed: vec![],
                    failed: vec![],
                    blocked: vec![],
                    integrated_branch: None,
                    run_dir,
                    message: format!("lane validation failed: {e}"),
                });
            }
        };

        // ------------------------------------------------------------------
        // 2. Preflight: repo, agent binary, auth. Nothing starts otherwise.
        // ------------------------------------------------------------------
        let repo_git = Git::new(&self.cfg.repo_root);
        if !repo_git.is_git_repo().await {
            return Ok(FlowReport {
                outcome: FlowOutcome::PreflightFailed,
                completed: vec![],
                failed: vec![],
                blocked: vec![],
                integrated_branch: None,
                run_dir,
                message: format!("{} is not a git repository", self.cfg.repo_root.display()),
            });
        }

        let supervisor = Arc::new(AgentSupervisor::new(Arc::clone(&self.cfg), self.bus.clone()));
        if let Err(e) = supervisor.preflight().await {
            return Ok(FlowReport {
                outcome: FlowOutcome::PreflightFailed,
                completed: vec![],
                failed: vec![],
                blocked: vec![],
                integrated_branch: None,
                run_dir,
                message: format!("agent preflight failed: {e}"),
            });
        }

        // ------------------------------------------------------------------
        // 3. Run directory and flow metadata.
        // ------------------------------------------------------------------
        std::fs::create_dir_all(self.cfg.lanes_dir())
            .with_context(|| format!("failed to create run dir {}", run_dir.display()))?;

        let base_branch = match &self.cfg.base_branch {
            Some(b) => b.clone(),
            None => repo_git
                .current_branch()
                .await
                .context("failed to resolve base branch")?,
        };
        let mut meta = FlowMeta {
            run_id: self.cfg.run_id.clone(),
            base_branch,
            branch_prefix: self.cfg.branch_prefix.clone(),
            feature_branch: self.cfg.feature_branch_name(),
            started_at: chrono::Utc::now(),
            status: FlowStatus::Running,
            error: None,
            integrated_branch: None,
            lanes_completed: 0,
            lanes_failed: 0,
            lanes_blocked: 0,
            conflict: None,
        };
        state::save(&self.cfg.flow_meta_path(), &meta)?;

        self.bus.emit_payload(
            &self.cfg.run_id,
            None,
            EventPayload::OrchestrationStarted {
                total_lanes: lanes.len(),
            },
        );

        // ------------------------------------------------------------------
        // 4. Shared services for the runners.
        // ------------------------------------------------------------------
        let locks = Arc::new(LockManager::new(self.cfg.locks_dir()));
        locks.sweep_stale();
        let detector = Arc::new(StallDetector::new(
            self.cfg.stall.clone(),
            self.bus.clone(),
            &self.cfg.run_id,
        ));

        let ctx = RunnerContext {
            cfg: Arc::clone(&self.cfg),
            bus: self.bus.clone(),
            locks,
            supervisor,
            detector,
            cancel: cancel.clone(),
        };

        // ------------------------------------------------------------------
        // 5. Scheduling loop.
        // ------------------------------------------------------------------
        let lane_map: HashMap<String, Lane> =
            lanes.iter().map(|l| (l.name.clone(), l.clone())).collect();
        let all_names: Vec<String> = lanes.iter().map(|l| l.name.clone()).collect();

        let semaphore = Arc::new(Semaphore::new(self.cfg.max_concurrent_lanes.max(1)));
        let (tx, mut rx) = mpsc::channel::<LaneDone>(all_names.len().max(1));

        let mut started: HashSet<String> = HashSet::new();
        let mut completed: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut in_flight: usize = 0;

        loop {
            if cancel.is_cancelled() {
                tracing::info!(run_id = %self.cfg.run_id, "cancelled, draining running lanes");
                let drain_deadline = tokio::time::Instant::now() + Duration::from_secs(10);
                while in_flight > 0 {
                    match tokio::time::timeout_at(drain_deadline, rx.recv()).await {
                        Ok(Some(done)) => {
                            in_flight -= 1;
                            record_done(&done, &mut completed, &mut failed, &mut blocked);
                        }
                        _ => break,
                    }
                }
                self.bus
                    .emit_payload(&self.cfg.run_id, None, EventPayload::Cancelled);
                // Lanes that never started fail as cancelled.
                for name in &all_names {
                    if !started.contains(name) {
                        self.write_unstarted_failure(&lane_map[name], "cancelled");
                        failed.insert(name.clone());
                    }
                }
                break;
            }

            // Drain finished lanes without blocking.
            while let Ok(done) = rx.try_recv() {
                in_flight -= 1;
                record_done(&done, &mut completed, &mut failed, &mut blocked);
            }

            // A lane whose dependency failed (or blocked) never starts.
            for lane in &lanes {
                if started.contains(&lane.name) {
                    continue;
                }
                if let Some(bad_dep) = lane
                    .depends_on
                    .iter()
                    .find(|d| failed.contains(*d) || blocked.contains(*d))
                {
                    let reason = format!("dependency {bad_dep} failed");
                    self.write_unstarted_failure(lane, &reason);
                    started.insert(lane.name.clone());
                    failed.insert(lane.name.clone());
                }
            }

            // Termination: everything started and nothing in flight.
            if started.len() == all_names.len() && in_flight == 0 {
                break;
            }

            // Spawn every lane whose dependencies are all completed.
            let ready: Vec<&Lane> = lanes
                .iter()
                .filter(|l| {
                    !started.contains(&l.name)
                        && l.depends_on.iter().all(|d| completed.contains(d))
                })
                .collect();
            let spawned_any = !ready.is_empty();

            for lane in ready {
                let permit = Arc::clone(&semaphore).acquire_owned().await?;
                started.insert(lane.name.clone());
                in_flight += 1;

                let runner = LaneRunner::new(lane.clone(), ctx.clone());
                let tx = tx.clone();
                let lane_name = lane.name.clone();
                tokio::spawn(async move {
                    let outcome = runner.run().await;
                    drop(permit);
                    let _ = tx
                        .send(LaneDone {
                            lane: lane_name,
                            outcome,
                        })
                        .await;
                });
            }

            if in_flight > 0 {
                tokio::select! {
                    done = rx.recv() => {
                        if let Some(done) = done {
                            in_flight -= 1;
                            record_done(&done, &mut completed, &mut failed, &mut blocked);
                        }
                    }
                    _ = cancel.cancelled() => continue,
                }
            } else if !spawned_any {
                // Nothing runnable right now; re-check shortly.
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                    _ = cancel.cancelled() => continue,
                }
            }
        }

        // ------------------------------------------------------------------
        // 6. Terminal flow status and integration.
        // ------------------------------------------------------------------
        meta.lanes_completed = completed.len();
        meta.lanes_failed = failed.len();
        meta.lanes_blocked = blocked.len();

        let mut integrated_branch = None;
        let outcome = if !blocked.is_empty() {
            meta.status = FlowStatus::Failed;
            meta.error = Some("one or more lanes blocked on dependency change".to_string());
            FlowOutcome::Blocked
        } else if completed.is_empty() {
            meta.status = FlowStatus::Failed;
            meta.error = Some("no lane completed".to_string());
            FlowOutcome::Failed
        } else {
            let order = spec::topological_order(&lanes);
            let report = integrate::integrate_flow(&self.cfg, &self.bus, &order).await?;
            integrated_branch = report.integrated_branch.clone();
            if report.success {
                meta.integrated_branch = report.integrated_branch;
                if failed.is_empty() {
                    meta.status = FlowStatus::Completed;
                    FlowOutcome::Completed
                } else {
                    meta.status = FlowStatus::Partial;
                    FlowOutcome::Partial
                }
            } else {
                meta.status = FlowStatus::Failed;
                meta.error = report.error;
                meta.conflict = report.conflict;
                FlowOutcome::Failed
            }
        };

        state::save(&self.cfg.flow_meta_path(), &meta)?;

        let payload = if outcome == FlowOutcome::Completed {
            EventPayload::OrchestrationCompleted {
                completed: completed.len(),
                failed: failed.len(),
                blocked: blocked.len(),
            }
        } else {
            EventPayload::OrchestrationFailed {
                error: meta.error.clone().unwrap_or_else(|| "flow incomplete".to_string()),
            }
        };
        self.bus.emit_payload(&self.cfg.run_id, None, payload);

        let mut completed: Vec<String> = completed.into_iter().collect();
        let mut failed: Vec<String> = failed.into_iter().collect();
        let mut blocked: Vec<String> = blocked.into_iter().collect();
        completed.sort();
        failed.sort();
        blocked.sort();

        let message = match &outcome {
            FlowOutcome::Completed => format!(
                "{} lane(s) completed, integrated into {}",
                completed.len(),
                integrated_branch.as_deref().unwrap_or("?")
            ),
            FlowOutcome::Partial => format!(
                "{} lane(s) completed, {} failed; completed work integrated",
                completed.len(),
                failed.len()
            ),
            FlowOutcome::Blocked => format!("{} lane(s) blocked on dependency change", blocked.len()),
            FlowOutcome::Failed => meta
                .error
                .clone()
                .unwrap_or_else(|| "flow failed".to_string()),
            FlowOutcome::ValidationFailed | FlowOutcome::PreflightFailed => unreachable!(),
        };

        Ok(FlowReport {
            outcome,
            completed,
            failed,
            blocked,
            integrated_branch,
            run_dir,
            message,
        })
    }

    /// Persist a failure state for a lane that never ran, so dependents and
    /// resume tooling see a terminal record.
    fn write_unstarted_failure(&self, lane: &Lane, reason: &str) {
        let lane_dir = self.cfg.lane_dir(&lane.name);
        let state_path = lane_files::state(&lane_dir);
        // Never clobber real progress from a previous attempt.
        let mut lane_state: LaneState = state::load(&state_path).unwrap_or_else(|| {
            LaneState::new(
                &lane.name,
                lane.tasks.len(),
                lane.spec_path.clone(),
                lane.depends_on.clone(),
            )
        });
        if lane_state.status == LaneStatus::Completed {
            return;
        }
        lane_state.status = LaneStatus::Failed;
        lane_state.error = Some(reason.to_string());
        lane_state.end_time = Some(chrono::Utc::now());
        lane_state.touch();
        if let Err(e) = state::save(&state_path, &lane_state) {
            tracing::error!(lane = %lane.name, error = %e, "failed to write failure state");
        }
        self.bus.emit_payload(
            &self.cfg.run_id,
            Some(&lane.name),
            EventPayload::LaneFailed {
                error: reason.to_string(),
            },
        );
    }
}

fn record_done(
    done: &LaneDone,
    completed: &mut HashSet<String>,
    failed: &mut HashSet<String>,
    blocked: &mut HashSet<String>,
) {
    match &done.outcome {
        LaneOutcome::Completed => {
            tracing::info!(lane = %done.lane, "lane completed");
            completed.insert(done.lane.clone());
        }
        LaneOutcome::Failed { error } => {
            tracing::warn!(lane = %done.lane, error = %error, "lane failed");
            failed.insert(done.lane.clone());
        }
        LaneOutcome::BlockedDependency { request } => {
            tracing::warn!(
                lane = %done.lane,
                reason = %request.reason,
                "lane blocked on dependency change"
            );
            blocked.insert(done.lane.clone());
        }
    }
}
