//! Cross-lane dependency coordination.
//!
//! A task may declare `lane:task` dependencies on tasks in *other* lanes.
//! The coordinator polls those lanes' state files until every dependency is
//! satisfied, a dependency becomes permanently unsatisfiable (its lane
//! failed), the timeout elapses, or the flow is cancelled.
//!
//! The orchestrator has already rejected cyclic lane graphs; the
//! coordinator trusts that and only polls.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::lane_files;
use crate::model::{LaneState, LaneStatus};
use crate::spec::parse_task_dependency;
use crate::state;

/// What to do when the wait times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Treat the timeout as a failure.
    Fail,
    /// Continue without the unsatisfied dependencies.
    Proceed,
}

#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub on_timeout: TimeoutPolicy,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1800),
            poll_interval: Duration::from_secs(5),
            on_timeout: TimeoutPolicy::Fail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitOutcome {
    pub success: bool,
    pub timed_out: bool,
    pub elapsed: Duration,
    /// Dependencies that failed or were still unsatisfied at the end.
    pub failed_dependencies: Vec<String>,
}

/// Wait until every `lane` / `lane:task` dependency is satisfied.
///
/// A `lane:task` is satisfied when the other lane's persisted state has
/// `status` of `completed` or `reviewing` and the task appears in its
/// `completedTasks`. A bare `lane` requires `completed`. A failed lane
/// makes its dependents permanently unsatisfiable.
pub async fn wait_for(
    lanes_dir: &Path,
    deps: &[String],
    opts: &WaitOptions,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(&str),
) -> WaitOutcome {
    let started = std::time::Instant::now();
    let mut satisfied: HashSet<String> = HashSet::new();

    loop {
        let mut failed = Vec::new();

        for dep in deps {
            if satisfied.contains(dep) {
                continue;
            }
            let Some((lane, task)) = parse_task_dependency(dep) else {
                failed.push(dep.clone());
                continue;
            };

            let state_path = lane_files::state(&lanes_dir.join(lane));
            let Some(lane_state) = state::load::<LaneState>(&state_path) else {
                continue; // Lane has not started yet.
            };

            match lane_state.status {
                LaneStatus::Failed => {
                    failed.push(dep.clone());
                }
                LaneStatus::Completed if task.is_empty() => {
                    satisfied.insert(dep.clone());
                    on_progress(dep);
                }
                LaneStatus::Completed | LaneStatus::Reviewing => {
                    if !task.is_empty() && lane_state.completed_tasks.iter().any(|t| t == task) {
                        satisfied.insert(dep.clone());
                        on_progress(dep);
                    }
                }
                _ => {
                    // Running lanes satisfy task-level waits as soon as the
                    // task lands in completedTasks.
                    if !task.is_empty() && lane_state.completed_tasks.iter().any(|t| t == task) {
                        satisfied.insert(dep.clone());
                        on_progress(dep);
                    }
                }
            }
        }

        if !failed.is_empty() {
            return WaitOutcome {
                success: false,
                timed_out: false,
                elapsed: started.elapsed(),
                failed_dependencies: failed,
            };
        }

        if satisfied.len() == deps.len() {
            return WaitOutcome {
                success: true,
                timed_out: false,
                elapsed: started.elapsed(),
                failed_dependencies: Vec::new(),
            };
        }

        if started.elapsed() >= opts.timeout {
            let outstanding: Vec<String> = deps
                .iter()
                .filter(|d| !satisfied.contains(*d))
                .cloned()
                .collect();
            return WaitOutcome {
                success: opts.on_timeout == TimeoutPolicy::Proceed,
                timed_out: true,
                elapsed: started.elapsed(),
                failed_dependencies: outstanding,
            };
        }

        tokio::select! {
            _ = tokio::time::sleep(opts.poll_interval) => {}
            _ = cancel.cancelled() => {
                return WaitOutcome {
                    success: false,
                    timed_out: false,
                    elapsed: started.elapsed(),
                    failed_dependencies: deps
                        .iter()
                        .filter(|d| !satisfied.contains(*d))
                        .cloned()
                        .collect(),
                };
            }
        }
    }
}
