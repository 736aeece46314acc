//! Flow integration: the final merge of all completed lane pipeline
//! branches into a single feature branch.
//!
//! Merges happen sequentially in DAG topological order with `--no-ff`.
//! The first conflict aborts that merge, leaves the feature branch at the
//! last successful merge commit, and fails the flow with the conflicting
//! lane and files recorded in the flow metadata.

use crate::config::{FlowConfig, lane_files};
use crate::events::{EventBus, EventPayload};
use crate::git::{Git, MergeOptions};
use crate::model::{IntegrationConflict, LaneState, LaneStatus};
use crate::state;

/// Result of the integration step.
#[derive(Debug, Clone)]
pub struct IntegrationReport {
    pub success: bool,
    pub integrated_branch: Option<String>,
    pub merged_lanes: Vec<String>,
    pub conflict: Option<IntegrationConflict>,
    pub error: Option<String>,
}

/// Merge the pipeline branches of all completed lanes into the feature
/// branch. `lanes_in_order` is the full lane list in topological order;
/// lanes that did not complete are skipped.
pub async fn integrate_flow(
    cfg: &FlowConfig,
    bus: &EventBus,
    lanes_in_order: &[String],
) -> anyhow::Result<IntegrationReport> {
    use anyhow::Context;

    let git = Git::new(&cfg.repo_root);
    let base_branch = match &cfg.base_branch {
        Some(b) => b.clone(),
        None => git
            .current_branch()
            .await
            .context("failed to resolve base branch for integration")?,
    };
    let feature_branch = cfg.feature_branch_name();

    git.checkout(&base_branch)
        .await
        .with_context(|| format!("failed to check out base branch {base_branch}"))?;
    git.checkout_new(&feature_branch)
        .await
        .with_context(|| format!("failed to create feature branch {feature_branch}"))?;

    let mut merged_lanes = Vec::new();

    for lane in lanes_in_order {
        let state_path = lane_files::state(&cfg.lane_dir(lane));
        let Some(lane_state) = state::load::<LaneState>(&state_path) else {
            continue;
        };
        if lane_state.status != LaneStatus::Completed {
            continue;
        }
        let Some(branch) = lane_state.pipeline_branch else {
            tracing::warn!(lane = %lane, "completed lane has no pipeline branch, skipping");
            continue;
        };

        let merge = git
            .safe_merge(
                &branch,
                &MergeOptions {
                    no_ff: true,
                    message: Some(format!("Integrate lane {lane}")),
                    abort_on_conflict: true,
                    strategy: None,
                },
            )
            .await
            .with_context(|| format!("integration merge of {branch} failed to run"))?;

        if merge.conflict {
            bus.emit_payload(
                &cfg.run_id,
                Some(lane),
                EventPayload::MergeConflict {
                    branch: branch.clone(),
                    files: merge.conflicting_files.clone(),
                },
            );
            // The aborted merge left the feature branch at the previous
            // successful merge commit.
            return Ok(IntegrationReport {
                success: false,
                integrated_branch: Some(feature_branch),
                merged_lanes,
                conflict: Some(IntegrationConflict {
                    lane: lane.clone(),
                    files: merge.conflicting_files,
                }),
                error: Some("Merge conflict during integration".to_string()),
            });
        }
        if !merge.success {
            return Ok(IntegrationReport {
                success: false,
                integrated_branch: Some(feature_branch),
                merged_lanes,
                conflict: None,
                error: Some(format!(
                    "integration merge of lane {lane} failed: {}",
                    merge.error.unwrap_or_default()
                )),
            });
        }

        bus.emit_payload(
            &cfg.run_id,
            Some(lane),
            EventPayload::BranchMerged {
                branch,
                into: feature_branch.clone(),
            },
        );
        merged_lanes.push(lane.clone());
    }

    git.push(&feature_branch, true, false)
        .await
        .with_context(|| format!("failed to push integrated branch {feature_branch}"))?;

    if cfg.cleanup_lane_branches {
        cleanup_lane_branches(cfg, &git, &merged_lanes).await;
    }

    Ok(IntegrationReport {
        success: true,
        integrated_branch: Some(feature_branch),
        merged_lanes,
        conflict: None,
        error: None,
    })
}

/// Remove merged lanes' worktrees and delete their branches, local and
/// remote. Best-effort.
async fn cleanup_lane_branches(cfg: &FlowConfig, git: &Git, lanes: &[String]) {
    for lane in lanes {
        let state_path = lane_files::state(&cfg.lane_dir(lane));
        let Some(lane_state) = state::load::<LaneState>(&state_path) else {
            continue;
        };
        if let Some(dir) = &lane_state.worktree_dir {
            let dir_str = dir.to_string_lossy();
            if let Err(e) = git
                .run(&["worktree", "remove", "--force", &dir_str])
                .await
            {
                tracing::warn!(lane = %lane, error = %e, "worktree removal failed");
            }
        }
        if let Some(branch) = &lane_state.pipeline_branch {
            if let Err(e) = git.delete_branch(branch, false).await {
                tracing::warn!(lane = %lane, branch = %branch, error = %e, "local branch delete failed");
            }
            if git.has_remote("origin").await {
                if let Err(e) = git.delete_branch(branch, true).await {
                    tracing::warn!(lane = %lane, branch = %branch, error = %e, "remote branch delete failed");
                }
            }
        }
    }
}
