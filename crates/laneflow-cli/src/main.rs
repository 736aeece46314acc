//! `laneflow` — parallel lane orchestrator for interactive coding agents.
//!
//! Thin binary over `laneflow-core`: resolves configuration, wires the
//! event bus and cancellation, and maps the flow outcome onto the exit
//! codes resume tooling depends on.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use laneflow_core::config::{FlowConfig, lane_files};
use laneflow_core::model::{FlowMeta, LaneState};
use laneflow_core::{EventBus, Orchestrator};

#[derive(Parser)]
#[command(name = "laneflow", about = "Parallel lane orchestrator for coding agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every lane spec in a directory against the current repository
    Run {
        /// Directory of `*.json` lane specifications
        tasks_dir: PathBuf,
        /// Repository to operate on (defaults to the current directory)
        #[arg(long)]
        repo: Option<PathBuf>,
        /// Maximum number of lanes running at once
        #[arg(long, default_value_t = 10)]
        max_concurrent: usize,
        /// Branch lanes are created from (defaults to the current branch)
        #[arg(long)]
        base_branch: Option<String>,
        /// Name of the final integration branch
        #[arg(long)]
        feature_branch: Option<String>,
        /// Default task timeout in seconds
        #[arg(long, default_value_t = 600)]
        task_timeout: u64,
        /// Agent binary to drive
        #[arg(long)]
        agent: Option<String>,
        /// Delete lane branches after a successful integration
        #[arg(long)]
        cleanup: bool,
    },
    /// Resume an interrupted run from its run directory
    Resume {
        /// Run directory (`<repo>/.laneflow/runs/<runId>`)
        #[arg(long)]
        run_dir: PathBuf,
        /// Resume every lane (the only supported mode today)
        #[arg(long)]
        all: bool,
        /// Restore each lane to its last checkpoint before resuming
        #[arg(long)]
        restart: bool,
        /// Agent binary to drive
        #[arg(long)]
        agent: Option<String>,
    },
    /// Show the status of a run
    Status {
        /// Run directory (`<repo>/.laneflow/runs/<runId>`)
        #[arg(long)]
        run_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            tasks_dir,
            repo,
            max_concurrent,
            base_branch,
            feature_branch,
            task_timeout,
            agent,
            cleanup,
        } => {
            let repo_root = match repo {
                Some(r) => r,
                None => std::env::current_dir().context("cannot determine current directory")?,
            };
            let mut cfg = FlowConfig::new(repo_root, tasks_dir);
            cfg.max_concurrent_lanes = max_concurrent;
            cfg.base_branch = base_branch;
            cfg.feature_branch = feature_branch;
            cfg.task_timeout = Duration::from_secs(task_timeout);
            cfg.cleanup_lane_branches = cleanup;
            if let Some(agent) = agent {
                cfg.agent.binary = agent;
            }
            run_flow(cfg).await
        }
        Commands::Resume {
            run_dir,
            all,
            restart,
            agent,
        } => {
            if !all {
                anyhow::bail!("per-lane resume is not supported; pass --all");
            }
            let mut cfg = config_from_run_dir(&run_dir)?;
            if let Some(agent) = agent {
                cfg.agent.binary = agent;
            }
            if restart {
                restore_lanes_to_checkpoints(&cfg).await;
            }
            run_flow(cfg).await
        }
        Commands::Status { run_dir } => {
            print_status(&run_dir);
            Ok(())
        }
    }
}

async fn run_flow(cfg: FlowConfig) -> anyhow::Result<()> {
    let cfg = Arc::new(cfg);
    let bus = EventBus::new();
    bus.subscribe_all(|event| {
        tracing::info!(
            event_type = %event.event_type,
            lane = event.lane.as_deref().unwrap_or("-"),
            "flow event"
        );
    });

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling flow");
            ctrl_c_cancel.cancel();
        }
    });

    let orchestrator = Orchestrator::new(cfg, bus);
    let report = orchestrator.run(cancel).await?;

    println!("{}", report.message);
    if !report.failed.is_empty() {
        println!("failed lanes: {}", report.failed.join(", "));
    }
    if !report.blocked.is_empty() {
        println!("blocked lanes: {}", report.blocked.join(", "));
    }
    println!("run directory: {}", report.run_dir.display());

    std::process::exit(report.outcome.exit_code());
}

/// Rebuild a `FlowConfig` from an existing run directory so the same run
/// id (and therefore the same lane state, branches and worktrees) is
/// reused.
fn config_from_run_dir(run_dir: &std::path::Path) -> anyhow::Result<FlowConfig> {
    let run_id = run_dir
        .file_name()
        .and_then(|n| n.to_str())
        .context("run directory has no name")?
        .to_string();
    // `<repo>/.laneflow/runs/<runId>` -> repo root.
    let logs_dir = run_dir
        .parent()
        .and_then(|p| p.parent())
        .context("run directory is not under a .laneflow layout")?
        .to_path_buf();
    let repo_root = logs_dir
        .parent()
        .context("cannot locate repository root from run directory")?
        .to_path_buf();

    let meta: FlowMeta = laneflow_core::state::load(&run_dir.join("flow.json"))
        .context("run directory has no readable flow.json")?;

    // The tasks dir is recorded per lane; any lane's record works.
    let tasks_dir = first_lane_state(run_dir)
        .and_then(|s| s.tasks_file.parent().map(|p| p.to_path_buf()))
        .context("cannot determine tasks directory from lane states")?;

    let mut cfg = FlowConfig::new(repo_root, tasks_dir);
    cfg.logs_dir = logs_dir;
    cfg.run_id = run_id;
    cfg.base_branch = Some(meta.base_branch);
    cfg.branch_prefix = meta.branch_prefix;
    cfg.feature_branch = Some(meta.feature_branch);
    Ok(cfg)
}

fn first_lane_state(run_dir: &std::path::Path) -> Option<LaneState> {
    let lanes_dir = run_dir.join("lanes");
    let entries = std::fs::read_dir(&lanes_dir).ok()?;
    for entry in entries.flatten() {
        if let Some(state) =
            laneflow_core::state::load::<LaneState>(&lane_files::state(&entry.path()))
        {
            return Some(state);
        }
    }
    None
}

/// `resume --restart`: roll every non-completed lane back to its newest
/// checkpoint before re-running.
async fn restore_lanes_to_checkpoints(cfg: &FlowConfig) {
    let Ok(entries) = std::fs::read_dir(cfg.lanes_dir()) else {
        return;
    };
    for entry in entries.flatten() {
        let lane_dir = entry.path();
        let Some(state) =
            laneflow_core::state::load::<LaneState>(&lane_files::state(&lane_dir))
        else {
            continue;
        };
        if state.status == laneflow_core::LaneStatus::Completed {
            continue;
        }
        let Some(checkpoint) = laneflow_core::checkpoint::list_checkpoints(&lane_dir)
            .into_iter()
            .next()
        else {
            continue;
        };
        let report = laneflow_core::checkpoint::restore_from_checkpoint(
            &checkpoint,
            &lane_dir,
            laneflow_core::checkpoint::RestoreOptions {
                restore_git_state: true,
                worktree_dir: state.worktree_dir.as_deref(),
            },
        )
        .await;
        for warning in report.warnings {
            tracing::warn!(lane = %state.label, warning = %warning, "checkpoint restore warning");
        }
    }
}

fn print_status(run_dir: &std::path::Path) {
    match laneflow_core::state::load::<FlowMeta>(&run_dir.join("flow.json")) {
        Some(meta) => {
            println!("run:        {}", meta.run_id);
            println!("status:     {:?}", meta.status);
            println!(
                "lanes:      {} completed / {} failed / {} blocked",
                meta.lanes_completed, meta.lanes_failed, meta.lanes_blocked
            );
            if let Some(branch) = meta.integrated_branch {
                println!("integrated: {branch}");
            }
            if let Some(error) = meta.error {
                println!("error:      {error}");
            }
        }
        None => println!("no flow.json under {}", run_dir.display()),
    }

    let lanes_dir = run_dir.join("lanes");
    let Ok(entries) = std::fs::read_dir(&lanes_dir) else {
        return;
    };
    let mut lane_dirs: Vec<_> = entries.flatten().map(|e| e.path()).collect();
    lane_dirs.sort();
    for lane_dir in lane_dirs {
        if let Some(state) =
            laneflow_core::state::load::<LaneState>(&lane_files::state(&lane_dir))
        {
            println!(
                "  {:<20} {:<10} task {}/{}{}",
                state.label,
                state.status.to_string(),
                state.current_task_index,
                state.total_tasks,
                state
                    .error
                    .map(|e| format!("  ({e})"))
                    .unwrap_or_default()
            );
        }
    }
}
