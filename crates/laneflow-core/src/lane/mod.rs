//! Lane runner: one worker driving one lane to completion.
//!
//! The runner exclusively owns its worktree, pipeline branch, chat session
//! and state file. It prepares the worktree, merges lane-level
//! dependencies, then feeds tasks to the agent one at a time, committing,
//! pushing and merging after each. State is persisted after every step,
//! always *before* the event announcing it, so a crash at any point leaves
//! a resumable run directory behind.

pub mod prompt;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::agent::{AgentSupervisor, SendRequest};
use crate::checkpoint::{self, DEFAULT_MAX_CHECKPOINTS};
use crate::config::{FlowConfig, generate_pipeline_branch, lane_files};
use crate::coordinator::{self, TimeoutPolicy, WaitOptions};
use crate::events::{EventBus, EventPayload};
use crate::git::{Git, MergeOptions};
use crate::locks::LockManager;
use crate::model::{LaneOutcome, LaneState, LaneStatus};
use crate::model::{ConversationEntry, ConversationRole};
use crate::recovery::StallDetector;
use crate::spec::{Lane, parse_task_dependency};
use crate::state::{self, ValidateOptions};

/// Everything a lane runner needs from its surroundings.
#[derive(Clone)]
pub struct RunnerContext {
    pub cfg: Arc<FlowConfig>,
    pub bus: EventBus,
    pub locks: Arc<LockManager>,
    pub supervisor: Arc<AgentSupervisor>,
    pub detector: Arc<StallDetector>,
    pub cancel: CancellationToken,
}

pub struct LaneRunner {
    lane: Lane,
    ctx: RunnerContext,
    lane_dir: PathBuf,
}

impl LaneRunner {
    pub fn new(lane: Lane, ctx: RunnerContext) -> Self {
        let lane_dir = ctx.cfg.lane_dir(&lane.name);
        Self { lane, ctx, lane_dir }
    }

    /// Drive the lane to a terminal state. Never panics; every failure is
    /// recorded in the lane state first.
    pub async fn run(&self) -> LaneOutcome {
        match self.run_inner().await {
            Ok(outcome) => outcome,
            Err(error) => {
                let message = format!("{error:#}");
                self.fail_lane(&message);
                LaneOutcome::Failed { error: message }
            }
        }
    }

    async fn run_inner(&self) -> anyhow::Result<LaneOutcome> {
        use anyhow::Context;

        let name = &self.lane.name;
        let state_path = lane_files::state(&self.lane_dir);
        std::fs::create_dir_all(&self.lane_dir)
            .with_context(|| format!("failed to create lane dir {}", self.lane_dir.display()))?;

        // ------------------------------------------------------------------
        // Load-or-create state; repair before trusting anything on disk.
        // ------------------------------------------------------------------
        let mut lane_state = if state_path.exists() {
            let report = state::validate(
                &state_path,
                ValidateOptions {
                    check_worktree: true,
                    check_branch: None,
                    auto_repair: true,
                },
            )
            .await
            .with_context(|| format!("lane {name} state validation failed"))?;

            if report.repaired {
                let issues: Vec<String> =
                    report.issues.iter().map(|i| i.to_string()).collect();
                self.ctx.bus.emit_payload(
                    &self.ctx.cfg.run_id,
                    Some(name),
                    EventPayload::StateRepaired { issues },
                );
            }

            let mut loaded: LaneState = report
                .repaired_state
                .or_else(|| state::load(&state_path))
                .with_context(|| format!("lane {name} state unreadable after repair"))?;

            // A crashed worker left `running` behind; resume from pending.
            if state::needs_recovery(&state_path) {
                tracing::info!(lane = %name, "previous worker died mid-run, resuming");
                loaded.status = LaneStatus::Pending;
            }
            loaded
        } else {
            LaneState::new(
                name,
                self.lane.tasks.len(),
                self.lane.spec_path.clone(),
                self.lane.depends_on.clone(),
            )
        };

        // Re-running a finished lane is a no-op.
        if lane_state.status == LaneStatus::Completed {
            tracing::info!(lane = %name, "lane already completed, nothing to do");
            return Ok(LaneOutcome::Completed);
        }

        let resuming = lane_state.current_task_index > 0;
        self.ctx.detector.register(name, &self.lane_dir);

        // ------------------------------------------------------------------
        // PREPARING: worktree, pipeline branch, chat session, dep merges.
        // ------------------------------------------------------------------
        let repo_git = Git::new(&self.ctx.cfg.repo_root);
        let base_branch = match self.lane.base_branch.clone().or_else(|| self.ctx.cfg.base_branch.clone()) {
            Some(b) => b,
            None => repo_git
                .current_branch()
                .await
                .context("failed to resolve base branch")?,
        };

        let pipeline_branch = lane_state
            .pipeline_branch
            .clone()
            .or_else(|| self.lane.pipeline_branch.clone())
            .unwrap_or_else(|| {
                let prefix = self
                    .lane
                    .branch_prefix
                    .as_deref()
                    .unwrap_or(&self.ctx.cfg.branch_prefix);
                generate_pipeline_branch(prefix)
            });

        let worktree_dir = lane_state.worktree_dir.clone().unwrap_or_else(|| {
            let base = match &self.lane.worktree_root {
                Some(root) => root.join(&self.ctx.cfg.run_id),
                None => self.ctx.cfg.worktree_base(),
            };
            base.join(name)
        });

        self.ensure_worktree(&repo_git, &worktree_dir, &pipeline_branch, &base_branch)
            .await
            .with_context(|| format!("failed to prepare worktree for lane {name}"))?;

        let chat_id = match lane_state.chat_id.clone() {
            Some(id) => id,
            None => self
                .ctx
                .supervisor
                .create_chat()
                .await
                .context("failed to create chat session")?,
        };

        lane_state.status = LaneStatus::Running;
        lane_state.pid = Some(std::process::id());
        lane_state.pipeline_branch = Some(pipeline_branch.clone());
        lane_state.worktree_dir = Some(worktree_dir.clone());
        lane_state.chat_id = Some(chat_id.clone());
        self.persist(&mut lane_state)?;
        self.ctx.bus.emit_payload(
            &self.ctx.cfg.run_id,
            Some(name),
            EventPayload::LaneStarted {
                pipeline_branch: pipeline_branch.clone(),
            },
        );

        let wt_git = Git::new(&worktree_dir);

        if !resuming {
            self.merge_lane_dependencies(&wt_git, &mut lane_state).await?;
        }

        // ------------------------------------------------------------------
        // Task loop.
        // ------------------------------------------------------------------
        let mut chat_id = chat_id;
        for index in lane_state.current_task_index..self.lane.tasks.len() {
            if self.ctx.cancel.is_cancelled() {
                anyhow::bail!("cancelled");
            }

            let task = self.lane.tasks[index].clone();

            match checkpoint::create_checkpoint(
                &self.lane_dir,
                name,
                Some(&worktree_dir),
                &format!("Before task {}", index + 1),
                DEFAULT_MAX_CHECKPOINTS,
            )
            .await
            {
                Ok(cp) => self.ctx.bus.emit_payload(
                    &self.ctx.cfg.run_id,
                    Some(name),
                    EventPayload::CheckpointCreated { checkpoint_id: cp.id },
                ),
                Err(e) => {
                    tracing::warn!(lane = %name, error = %e, "checkpoint before task failed");
                }
            }

            // Task-level cross-lane waits.
            if !task.depends_on.is_empty() {
                self.await_task_dependencies(&wt_git, &mut lane_state, &task.depends_on)
                    .await?;
            }

            prompt::apply_dependency_policy(&worktree_dir, &self.lane.dependency_policy);

            let task_branch = task.branch_name(&pipeline_branch, index);
            wt_git
                .checkout_new(&task_branch)
                .await
                .with_context(|| format!("failed to create task branch {task_branch}"))?;

            let wrapped = prompt::build_wrapped_prompt(
                &task,
                &worktree_dir,
                &pipeline_branch,
                &self.lane.dependency_policy,
            );
            // The conversation log keeps the user's original prompt.
            let _ = state::append_log(
                &lane_files::conversation_log(&self.lane_dir),
                &ConversationEntry::new(
                    ConversationRole::User,
                    &task.name,
                    &task.prompt,
                    task.model.as_deref(),
                ),
            );

            self.ctx.bus.emit_payload(
                &self.ctx.cfg.run_id,
                Some(name),
                EventPayload::TaskStarted {
                    task: task.name.clone(),
                    index,
                },
            );

            let timeout = task
                .timeout
                .or(self.lane.timeout)
                .map(Duration::from_millis)
                .unwrap_or(self.ctx.cfg.task_timeout);

            let report = self
                .ctx
                .supervisor
                .send(
                    SendRequest {
                        lane: name,
                        task: &task.name,
                        prompt: &wrapped,
                        workspace: &worktree_dir,
                        lane_dir: &self.lane_dir,
                        chat_id: chat_id.clone(),
                        model: task.model.as_deref(),
                        timeout,
                    },
                    &self.ctx.detector,
                    &self.ctx.cancel,
                )
                .await;

            if report.chat_id != chat_id {
                chat_id = report.chat_id.clone();
                lane_state.chat_id = Some(chat_id.clone());
                self.persist(&mut lane_state)?;
            }

            if !report.ok {
                let error = report
                    .error
                    .unwrap_or_else(|| "agent failed without detail".to_string());
                lane_state.status = LaneStatus::Failed;
                lane_state.error = Some(error.clone());
                lane_state.end_time = Some(chrono::Utc::now());
                self.persist(&mut lane_state)?;
                self.ctx.bus.emit_payload(
                    &self.ctx.cfg.run_id,
                    Some(name),
                    EventPayload::TaskFailed {
                        task: task.name.clone(),
                        error: error.clone(),
                    },
                );
                self.ctx.bus.emit_payload(
                    &self.ctx.cfg.run_id,
                    Some(name),
                    EventPayload::LaneFailed { error: error.clone() },
                );
                return Ok(LaneOutcome::Failed { error });
            }

            // Dependency request: blocked when the policy disallows it.
            if let Some(request) = report.dependency_request {
                if !self.lane.dependency_policy.allow_dependency_change {
                    lane_state.status = LaneStatus::Failed;
                    lane_state.error =
                        Some(format!("blocked on dependency change: {}", request.reason));
                    lane_state.dependency_request = Some(request.clone());
                    lane_state.end_time = Some(chrono::Utc::now());
                    self.persist(&mut lane_state)?;
                    self.ctx.bus.emit_payload(
                        &self.ctx.cfg.run_id,
                        Some(name),
                        EventPayload::TaskBlocked {
                            task: task.name.clone(),
                            reason: request.reason.clone(),
                        },
                    );
                    return Ok(LaneOutcome::BlockedDependency { request });
                }
                tracing::info!(
                    lane = %name,
                    task = %task.name,
                    reason = %request.reason,
                    "dependency request noted (policy allows changes)"
                );
            }
            crate::agent::output::clear_request_file(&worktree_dir);

            // The wrapped prompt told the agent to commit; pick up leftovers.
            prompt::release_dependency_policy(&worktree_dir);
            match wt_git.commit(&format!("{}: task work", task.name), true).await {
                Ok(true) => tracing::debug!(lane = %name, task = %task.name, "committed leftover changes"),
                Ok(false) => {}
                Err(e) => tracing::warn!(lane = %name, error = %e, "leftover commit failed"),
            }

            // Push the task branch, renaming on non-fast-forward rejection.
            let push = wt_git
                .push_with_fallback_branch_name(&task_branch, 3)
                .await
                .with_context(|| format!("failed to push task branch {task_branch}"))?;
            if !push.success {
                anyhow::bail!("push of task branch {task_branch} failed after fallback rename");
            }
            self.ctx.bus.emit_payload(
                &self.ctx.cfg.run_id,
                Some(name),
                EventPayload::BranchPushed {
                    branch: push.final_branch_name.clone(),
                    renamed: push.renamed,
                },
            );

            // Merge the task branch into the pipeline branch.
            wt_git
                .checkout(&pipeline_branch)
                .await
                .with_context(|| format!("failed to check out pipeline branch {pipeline_branch}"))?;
            let merge = wt_git
                .safe_merge(
                    &push.final_branch_name,
                    &MergeOptions {
                        no_ff: true,
                        message: Some(format!("Merge task {} into pipeline", task.name)),
                        abort_on_conflict: true,
                        strategy: None,
                    },
                )
                .await
                .with_context(|| format!("merge of {} failed", push.final_branch_name))?;

            if merge.conflict {
                // The task branch stays behind for inspection.
                self.ctx.bus.emit_payload(
                    &self.ctx.cfg.run_id,
                    Some(name),
                    EventPayload::MergeConflict {
                        branch: push.final_branch_name.clone(),
                        files: merge.conflicting_files.clone(),
                    },
                );
                anyhow::bail!(
                    "merge conflict integrating task {} into {}: {}",
                    task.name,
                    pipeline_branch,
                    merge.conflicting_files.join(", ")
                );
            }
            if !merge.success {
                anyhow::bail!(
                    "merge of task {} failed: {}",
                    task.name,
                    merge.error.unwrap_or_default()
                );
            }
            self.ctx.bus.emit_payload(
                &self.ctx.cfg.run_id,
                Some(name),
                EventPayload::BranchMerged {
                    branch: push.final_branch_name.clone(),
                    into: pipeline_branch.clone(),
                },
            );

            wt_git
                .push(&pipeline_branch, true, false)
                .await
                .with_context(|| format!("failed to push pipeline branch {pipeline_branch}"))?;

            lane_state.completed_tasks.push(task.name.clone());
            lane_state.current_task_index = index + 1;
            self.persist(&mut lane_state)?;
            self.ctx.bus.emit_payload(
                &self.ctx.cfg.run_id,
                Some(name),
                EventPayload::TaskCompleted {
                    task: task.name.clone(),
                    index,
                },
            );
            self.ctx.detector.task_completed(name);
        }

        // ------------------------------------------------------------------
        // Terminal.
        // ------------------------------------------------------------------
        lane_state.status = LaneStatus::Completed;
        lane_state.end_time = Some(chrono::Utc::now());
        self.persist(&mut lane_state)?;
        self.ctx.bus.emit_payload(
            &self.ctx.cfg.run_id,
            Some(name),
            EventPayload::LaneCompleted {
                tasks: self.lane.tasks.len(),
            },
        );
        self.ctx.detector.deregister(name);

        Ok(LaneOutcome::Completed)
    }

    /// Make sure the worktree exists and is healthy, recreating it when it
    /// is not.
    async fn ensure_worktree(
        &self,
        repo_git: &Git,
        worktree_dir: &std::path::Path,
        pipeline_branch: &str,
        base_branch: &str,
    ) -> anyhow::Result<()> {
        if Git::is_valid_worktree(worktree_dir) {
            return Ok(());
        }
        if worktree_dir.exists() {
            tracing::warn!(
                lane = %self.lane.name,
                path = %worktree_dir.display(),
                "removing invalid worktree directory"
            );
            repo_git.cleanup_invalid_worktree_dir(worktree_dir)?;
            let _ = repo_git.run(&["worktree", "prune"]).await;
        }
        repo_git
            .create_worktree(&self.ctx.locks, worktree_dir, pipeline_branch, base_branch)
            .await?;
        Ok(())
    }

    /// Merge the pipeline branches of lane-level dependencies into this
    /// lane's pipeline branch.
    async fn merge_lane_dependencies(
        &self,
        wt_git: &Git,
        lane_state: &mut LaneState,
    ) -> anyhow::Result<()> {
        for dep in &self.lane.depends_on {
            let dep_state_path = lane_files::state(&self.ctx.cfg.lane_dir(dep));
            let Some(dep_state) = state::load::<LaneState>(&dep_state_path) else {
                tracing::warn!(lane = %self.lane.name, dependency = %dep, "dependency has no state, skipping merge");
                continue;
            };
            if dep_state.status != LaneStatus::Completed {
                tracing::warn!(
                    lane = %self.lane.name,
                    dependency = %dep,
                    status = %dep_state.status,
                    "dependency is not completed, merging anyway"
                );
            }
            let Some(dep_branch) = dep_state.pipeline_branch else {
                tracing::warn!(lane = %self.lane.name, dependency = %dep, "dependency has no pipeline branch, skipping merge");
                continue;
            };

            let merge = wt_git
                .safe_merge(
                    &dep_branch,
                    &MergeOptions {
                        no_ff: true,
                        message: Some(format!("Merge dependency lane {dep}")),
                        abort_on_conflict: true,
                        strategy: None,
                    },
                )
                .await?;
            if merge.conflict {
                self.ctx.bus.emit_payload(
                    &self.ctx.cfg.run_id,
                    Some(&self.lane.name),
                    EventPayload::MergeConflict {
                        branch: dep_branch.clone(),
                        files: merge.conflicting_files.clone(),
                    },
                );
                anyhow::bail!(
                    "merge conflict merging dependency lane {dep} ({})",
                    merge.conflicting_files.join(", ")
                );
            }
            if !merge.success {
                anyhow::bail!(
                    "merge of dependency lane {dep} failed: {}",
                    merge.error.unwrap_or_default()
                );
            }
            self.ctx.bus.emit_payload(
                &self.ctx.cfg.run_id,
                Some(&self.lane.name),
                EventPayload::BranchMerged {
                    branch: dep_branch,
                    into: lane_state.pipeline_branch.clone().unwrap_or_default(),
                },
            );
        }
        Ok(())
    }

    /// Wait for `lane:task` dependencies, then merge those lanes' pipeline
    /// branches.
    async fn await_task_dependencies(
        &self,
        wt_git: &Git,
        lane_state: &mut LaneState,
        deps: &[String],
    ) -> anyhow::Result<()> {
        let name = &self.lane.name;

        lane_state.status = LaneStatus::Waiting;
        lane_state.waiting_for = deps.to_vec();
        self.persist(lane_state)?;
        self.ctx.bus.emit_payload(
            &self.ctx.cfg.run_id,
            Some(name),
            EventPayload::LaneWaiting {
                waiting_for: deps.to_vec(),
            },
        );

        let _ = checkpoint::create_checkpoint(
            &self.lane_dir,
            name,
            None,
            "Before merging task dependencies",
            DEFAULT_MAX_CHECKPOINTS,
        )
        .await;

        let outcome = coordinator::wait_for(
            &self.ctx.cfg.lanes_dir(),
            deps,
            &WaitOptions {
                timeout: self.ctx.cfg.dependency_wait_timeout,
                poll_interval: self.ctx.cfg.dependency_poll_interval,
                on_timeout: TimeoutPolicy::Fail,
            },
            &self.ctx.cancel,
            |dep| tracing::info!(lane = %name, dependency = dep, "dependency satisfied"),
        )
        .await;

        if !outcome.success {
            let detail = if outcome.timed_out {
                format!(
                    "timed out after {:?} waiting for {}",
                    outcome.elapsed,
                    outcome.failed_dependencies.join(", ")
                )
            } else {
                format!("failed dependencies: {}", outcome.failed_dependencies.join(", "))
            };
            anyhow::bail!("dependency wait failed: {detail}");
        }

        // Merge each upstream lane's pipeline branch once.
        let mut merged = std::collections::HashSet::new();
        for dep in deps {
            let Some((dep_lane, _)) = parse_task_dependency(dep) else {
                continue;
            };
            if !merged.insert(dep_lane.to_string()) {
                continue;
            }
            let dep_state_path = lane_files::state(&self.ctx.cfg.lane_dir(dep_lane));
            let Some(dep_state) = state::load::<LaneState>(&dep_state_path) else {
                continue;
            };
            let Some(dep_branch) = dep_state.pipeline_branch else {
                continue;
            };
            let merge = wt_git
                .safe_merge(
                    &dep_branch,
                    &MergeOptions {
                        no_ff: true,
                        message: Some(format!("Merge dependency {dep_lane}")),
                        abort_on_conflict: true,
                        strategy: None,
                    },
                )
                .await?;
            if !merge.success {
                anyhow::bail!(
                    "merge of dependency {dep_lane} failed{}",
                    if merge.conflict {
                        format!(" with conflicts: {}", merge.conflicting_files.join(", "))
                    } else {
                        String::new()
                    }
                );
            }
        }

        lane_state.status = LaneStatus::Running;
        lane_state.waiting_for = Vec::new();
        self.persist(lane_state)?;
        Ok(())
    }

    fn persist(&self, lane_state: &mut LaneState) -> anyhow::Result<()> {
        lane_state.touch();
        state::save(&lane_files::state(&self.lane_dir), lane_state)?;
        Ok(())
    }

    /// Best-effort terminal failure write, used when `run_inner` errors.
    fn fail_lane(&self, error: &str) {
        let state_path = lane_files::state(&self.lane_dir);
        let mut lane_state: LaneState = state::load(&state_path).unwrap_or_else(|| {
            LaneState::new(
                &self.lane.name,
                self.lane.tasks.len(),
                self.lane.spec_path.clone(),
                self.lane.depends_on.clone(),
            )
        });
        lane_state.status = LaneStatus::Failed;
        lane_state.error = Some(error.to_string());
        lane_state.end_time = Some(chrono::Utc::now());
        lane_state.touch();
        if let Err(e) = state::save(&state_path, &lane_state) {
            tracing::error!(lane = %self.lane.name, error = %e, "failed to persist failure state");
        }
        self.ctx.bus.emit_payload(
            &self.ctx.cfg.run_id,
            Some(&self.lane.name),
            EventPayload::LaneFailed {
                error: error.to_string(),
            },
        );
        self.ctx.detector.deregister(&self.lane.name);
    }
}
