//! End-to-end orchestrator scenarios driven by stub agent scripts against
//! real temporary Git repositories.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use laneflow_core::config::{FlowConfig, lane_files};
use laneflow_core::events::{Event, EventBus};
use laneflow_core::git::Git;
use laneflow_core::model::{FlowMeta, FlowStatus, LaneState, LaneStatus};
use laneflow_core::orchestrator::{FlowOutcome, Orchestrator};
use laneflow_core::state;

use laneflow_test_utils::{
    GitRepoFixture, stub_agent_blocked, stub_agent_committing, write_lane_spec, write_script,
};

fn test_config(fixture: &GitRepoFixture, tasks_dir: &Path, agent: &Path) -> Arc<FlowConfig> {
    let mut cfg = FlowConfig::new(fixture.repo_path(), tasks_dir);
    cfg.agent.binary = agent.to_string_lossy().to_string();
    cfg.agent.echo_output = false;
    cfg.agent.max_attempts = 1;
    cfg.agent.retry_base_delay = Duration::from_millis(20);
    cfg.task_timeout = Duration::from_secs(30);
    cfg.stall.idle_timeout = Duration::from_secs(60);
    Arc::new(cfg)
}

fn collecting_bus() -> (EventBus, Arc<Mutex<Vec<Event>>>) {
    let bus = EventBus::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    bus.subscribe_all(move |e| sink.lock().unwrap().push(e.clone()));
    (bus, events)
}

fn event_types(events: &Arc<Mutex<Vec<Event>>>) -> Vec<String> {
    events
        .lock()
        .unwrap()
        .iter()
        .map(|e| e.event_type.clone())
        .collect()
}

fn lane_state(cfg: &FlowConfig, lane: &str) -> LaneState {
    state::load(&lane_files::state(&cfg.lane_dir(lane))).expect("lane state should exist")
}

// ---------------------------------------------------------------------------
// S1: two independent lanes complete and integrate.
// ---------------------------------------------------------------------------
#[tokio::test(flavor = "multi_thread")]
async fn two_independent_lanes_complete_and_integrate() {
    let fixture = GitRepoFixture::with_remote();
    let agent = stub_agent_committing(fixture.scratch_path());
    let tasks_dir = fixture.scratch_path().join("specs");
    write_lane_spec(
        &tasks_dir,
        "lane-a",
        &serde_json::json!({"tasks": [{"name": "init", "prompt": "write a file"}]}),
    );
    write_lane_spec(
        &tasks_dir,
        "lane-b",
        &serde_json::json!({"tasks": [{"name": "init", "prompt": "write a file"}]}),
    );

    let cfg = test_config(&fixture, &tasks_dir, &agent);
    let (bus, events) = collecting_bus();
    let report = Orchestrator::new(Arc::clone(&cfg), bus)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, FlowOutcome::Completed, "{}", report.message);
    assert_eq!(report.outcome.exit_code(), 0);
    assert_eq!(report.completed, vec!["lane-a", "lane-b"]);
    assert!(report.failed.is_empty());

    for lane in ["lane-a", "lane-b"] {
        let st = lane_state(&cfg, lane);
        assert_eq!(st.status, LaneStatus::Completed);
        assert_eq!(st.current_task_index, 1);
        assert_eq!(st.completed_tasks, vec!["init".to_string()]);
        assert!(st.end_time.is_some());
    }

    // The integrated branch is checked out and contains both lanes' files.
    let git = Git::new(fixture.repo_path());
    let branch = report.integrated_branch.clone().unwrap();
    assert_eq!(git.current_branch().await.unwrap(), branch);
    let agent_files: Vec<_> = std::fs::read_dir(fixture.repo_path())
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("agent-"))
        .collect();
    assert_eq!(agent_files.len(), 2, "one file per lane should be integrated");

    let meta: FlowMeta = state::load(&cfg.flow_meta_path()).unwrap();
    assert_eq!(meta.status, FlowStatus::Completed);
    assert_eq!(meta.integrated_branch.as_deref(), Some(branch.as_str()));

    let types = event_types(&events);
    assert_eq!(types.iter().filter(|t| *t == "lane.completed").count(), 2);
    assert!(types.contains(&"orchestration.completed".to_string()));

    // A checkpoint was written before the task ran.
    for lane in ["lane-a", "lane-b"] {
        let checkpoints = laneflow_core::checkpoint::list_checkpoints(&cfg.lane_dir(lane));
        assert!(!checkpoints.is_empty());
        assert_eq!(checkpoints.last().unwrap().description, "Before task 1");
    }
}

// ---------------------------------------------------------------------------
// S2: a dependency chain runs in order and inherits commits.
// ---------------------------------------------------------------------------
#[tokio::test(flavor = "multi_thread")]
async fn dependency_chain_orders_lanes_and_merges_upstream() {
    let fixture = GitRepoFixture::with_remote();
    let agent = stub_agent_committing(fixture.scratch_path());
    let tasks_dir = fixture.scratch_path().join("specs");
    write_lane_spec(
        &tasks_dir,
        "lane-a",
        &serde_json::json!({"tasks": [{"name": "base-work", "prompt": "p"}]}),
    );
    write_lane_spec(
        &tasks_dir,
        "lane-b",
        &serde_json::json!({
            "tasks": [{"name": "follow-up", "prompt": "p"}],
            "dependsOn": ["lane-a"]
        }),
    );

    let cfg = test_config(&fixture, &tasks_dir, &agent);
    let (bus, events) = collecting_bus();
    let report = Orchestrator::new(Arc::clone(&cfg), bus)
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, FlowOutcome::Completed, "{}", report.message);

    // lane-b must have started only after lane-a completed.
    let recorded = events.lock().unwrap();
    let a_completed = recorded
        .iter()
        .position(|e| e.event_type == "lane.completed" && e.lane.as_deref() == Some("lane-a"))
        .expect("lane-a completion event");
    let b_started = recorded
        .iter()
        .position(|e| e.event_type == "lane.started" && e.lane.as_deref() == Some("lane-b"))
        .expect("lane-b start event");
    assert!(
        a_completed < b_started,
        "lane-b started (index {b_started}) before lane-a completed (index {a_completed})"
    );
    drop(recorded);

    // lane-a's pipeline head is an ancestor of lane-b's pipeline head.
    let a_branch = lane_state(&cfg, "lane-a").pipeline_branch.unwrap();
    let b_branch = lane_state(&cfg, "lane-b").pipeline_branch.unwrap();
    let git = Git::new(fixture.repo_path());
    let a_head = git.run_checked(&["rev-parse", &a_branch]).await.unwrap();
    let ancestor_check = git
        .run(&["merge-base", "--is-ancestor", &a_head, &b_branch])
        .await
        .unwrap();
    assert!(
        ancestor_check.success,
        "lane-a head {a_head} should be an ancestor of {b_branch}"
    );
}

// ---------------------------------------------------------------------------
// Task-level `lane:task` waits block until the upstream task completes.
// ---------------------------------------------------------------------------
#[tokio::test(flavor = "multi_thread")]
async fn task_level_dependency_waits_and_merges_upstream_pipeline() {
    let fixture = GitRepoFixture::with_remote();
    let agent = stub_agent_committing(fixture.scratch_path());
    let tasks_dir = fixture.scratch_path().join("specs");
    write_lane_spec(
        &tasks_dir,
        "lane-a",
        &serde_json::json!({"tasks": [{"name": "build", "prompt": "p"}]}),
    );
    // No lane-level dependsOn: lane-b starts in parallel and must wait at
    // the task level.
    write_lane_spec(
        &tasks_dir,
        "lane-b",
        &serde_json::json!({"tasks": [
            {"name": "use-build", "prompt": "p", "dependsOn": ["lane-a:build"]}
        ]}),
    );

    let mut cfg = FlowConfig::new(fixture.repo_path(), &tasks_dir);
    cfg.agent.binary = agent.to_string_lossy().to_string();
    cfg.agent.echo_output = false;
    cfg.agent.max_attempts = 1;
    cfg.task_timeout = Duration::from_secs(30);
    cfg.stall.idle_timeout = Duration::from_secs(60);
    cfg.dependency_poll_interval = Duration::from_millis(50);
    let cfg = Arc::new(cfg);

    let (bus, events) = collecting_bus();
    let report = Orchestrator::new(Arc::clone(&cfg), bus)
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, FlowOutcome::Completed, "{}", report.message);

    // lane-b passed through the waiting state.
    let types = event_types(&events);
    assert!(types.contains(&"lane.waiting".to_string()));

    // The wait is recorded as cleared in the final state.
    let st_b = lane_state(&cfg, "lane-b");
    assert_eq!(st_b.status, LaneStatus::Completed);
    assert!(st_b.waiting_for.is_empty());

    // lane-a's work was merged into lane-b's pipeline before the task ran.
    let a_branch = lane_state(&cfg, "lane-a").pipeline_branch.unwrap();
    let b_branch = st_b.pipeline_branch.unwrap();
    let git = Git::new(fixture.repo_path());
    let a_head = git.run_checked(&["rev-parse", &a_branch]).await.unwrap();
    assert!(
        git.run(&["merge-base", "--is-ancestor", &a_head, &b_branch])
            .await
            .unwrap()
            .success
    );
}

// ---------------------------------------------------------------------------
// S3: a cycle is rejected before any work starts.
// ---------------------------------------------------------------------------
#[tokio::test(flavor = "multi_thread")]
async fn cycle_is_rejected_before_any_worktree_exists() {
    let fixture = GitRepoFixture::new();
    let agent = stub_agent_committing(fixture.scratch_path());
    let tasks_dir = fixture.scratch_path().join("specs");
    write_lane_spec(
        &tasks_dir,
        "lane-a",
        &serde_json::json!({"tasks": [{"name": "t", "prompt": "p"}], "dependsOn": ["lane-b"]}),
    );
    write_lane_spec(
        &tasks_dir,
        "lane-b",
        &serde_json::json!({"tasks": [{"name": "t", "prompt": "p"}], "dependsOn": ["lane-a"]}),
    );

    let cfg = test_config(&fixture, &tasks_dir, &agent);
    let (bus, events) = collecting_bus();
    let report = Orchestrator::new(Arc::clone(&cfg), bus)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, FlowOutcome::ValidationFailed);
    assert_eq!(report.outcome.exit_code(), 3);

    let types = event_types(&events);
    assert_eq!(
        types
            .iter()
            .filter(|t| *t == "orchestration.cycle_detected")
            .count(),
        1
    );

    // No worktree was created and no lane directory written.
    assert!(!cfg.worktree_base().exists());
    assert!(!cfg.lanes_dir().exists());
}

// ---------------------------------------------------------------------------
// S4: a dependency request under a deny policy blocks the lane.
// ---------------------------------------------------------------------------
#[tokio::test(flavor = "multi_thread")]
async fn dependency_request_blocks_lane_under_deny_policy() {
    let fixture = GitRepoFixture::with_remote();
    let agent = stub_agent_blocked(fixture.scratch_path());
    let tasks_dir = fixture.scratch_path().join("specs");
    write_lane_spec(
        &tasks_dir,
        "lane-a",
        &serde_json::json!({
            "tasks": [{"name": "needs-dep", "prompt": "p"}],
            "dependencyPolicy": {"allowDependencyChange": false, "lockfileReadOnly": true}
        }),
    );

    let cfg = test_config(&fixture, &tasks_dir, &agent);
    let (bus, _events) = collecting_bus();
    let report = Orchestrator::new(Arc::clone(&cfg), bus)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, FlowOutcome::Blocked);
    assert_eq!(report.outcome.exit_code(), 2);
    assert_eq!(report.blocked, vec!["lane-a"]);

    let st = lane_state(&cfg, "lane-a");
    assert_eq!(st.status, LaneStatus::Failed);
    let request = st.dependency_request.expect("request should be recorded");
    assert_eq!(request.reason, "need x");
    assert_eq!(request.commands, vec!["add x".to_string()]);

    // Nothing was merged into the pipeline branch: it still points at base.
    let git = Git::new(fixture.repo_path());
    let base_head = git.run_checked(&["rev-parse", "main"]).await.unwrap();
    let pipeline_head = git
        .run_checked(&["rev-parse", &st.pipeline_branch.unwrap()])
        .await
        .unwrap();
    assert_eq!(pipeline_head, base_head);
}

// ---------------------------------------------------------------------------
// A lane whose dependency failed never starts.
// ---------------------------------------------------------------------------
#[tokio::test(flavor = "multi_thread")]
async fn dependent_lane_fails_without_starting_when_dependency_fails() {
    let fixture = GitRepoFixture::with_remote();
    // Fails every send (exits without a result line).
    let agent = write_script(
        &fixture.scratch_path().join("failing-agent.sh"),
        "#!/bin/sh\nif [ \"$1\" = \"create-chat\" ]; then echo chat-1; exit 0; fi\nexit 1\n",
    );
    let tasks_dir = fixture.scratch_path().join("specs");
    write_lane_spec(
        &tasks_dir,
        "lane-a",
        &serde_json::json!({"tasks": [{"name": "t", "prompt": "p"}]}),
    );
    write_lane_spec(
        &tasks_dir,
        "lane-b",
        &serde_json::json!({"tasks": [{"name": "t", "prompt": "p"}], "dependsOn": ["lane-a"]}),
    );

    let cfg = test_config(&fixture, &tasks_dir, &agent);
    let (bus, _events) = collecting_bus();
    let report = Orchestrator::new(Arc::clone(&cfg), bus)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, FlowOutcome::Failed);
    assert_eq!(report.outcome.exit_code(), 1);
    assert_eq!(report.failed, vec!["lane-a", "lane-b"]);

    let st_b = lane_state(&cfg, "lane-b");
    assert_eq!(st_b.status, LaneStatus::Failed);
    assert!(st_b.error.unwrap().contains("dependency lane-a failed"));
    // lane-b never ran: no worktree, no tasks.
    assert!(st_b.worktree_dir.is_none());
    assert_eq!(st_b.current_task_index, 0);
}

// ---------------------------------------------------------------------------
// Law: re-running a completed run is a no-op.
// ---------------------------------------------------------------------------
#[tokio::test(flavor = "multi_thread")]
async fn rerunning_completed_flow_is_a_noop() {
    let fixture = GitRepoFixture::with_remote();
    let agent = stub_agent_committing(fixture.scratch_path());
    let tasks_dir = fixture.scratch_path().join("specs");
    write_lane_spec(
        &tasks_dir,
        "lane-a",
        &serde_json::json!({"tasks": [{"name": "init", "prompt": "p"}]}),
    );

    let cfg = test_config(&fixture, &tasks_dir, &agent);
    let (bus, _e) = collecting_bus();
    let first = Orchestrator::new(Arc::clone(&cfg), bus)
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.outcome, FlowOutcome::Completed, "{}", first.message);
    let state_before = lane_state(&cfg, "lane-a");

    let (bus, events) = collecting_bus();
    let second = Orchestrator::new(Arc::clone(&cfg), bus)
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.outcome, FlowOutcome::Completed);
    assert_eq!(second.completed, vec!["lane-a"]);

    // Lane state untouched; the lane did not re-execute.
    let state_after = lane_state(&cfg, "lane-a");
    assert_eq!(state_after, state_before);
    let types = event_types(&events);
    assert!(!types.contains(&"task.started".to_string()));
}

// ---------------------------------------------------------------------------
// Resume: a failed lane continues from its persisted task index.
// ---------------------------------------------------------------------------
#[tokio::test(flavor = "multi_thread")]
async fn resume_continues_from_persisted_task_index() {
    let fixture = GitRepoFixture::with_remote();
    let counter = fixture.scratch_path().join("calls");
    let gate = fixture.scratch_path().join("gate");
    // Succeeds normally, but the second distinct send fails until the gate
    // file appears. Counts sends in a side file.
    let agent = write_script(
        &fixture.scratch_path().join("flaky-agent.sh"),
        &format!(
            r#"#!/bin/sh
if [ "$1" = "create-chat" ]; then echo "chat-$$"; exit 0; fi
count=$(cat {counter} 2>/dev/null || echo 0)
count=$((count + 1))
echo "$count" > {counter}
workspace=""
while [ $# -gt 0 ]; do
    case "$1" in
        --workspace) workspace="$2"; shift 2 ;;
        *) shift ;;
    esac
done
if [ "$count" = "2" ] && [ ! -f {gate} ]; then
    exit 1
fi
cd "$workspace" || exit 1
echo "step $count" >> progress.txt
git add -A >/dev/null 2>&1
git commit -m "step $count" >/dev/null 2>&1
echo '{{"type":"result","is_error":false,"session_id":"s","result":"ok"}}'
"#,
            counter = counter.display(),
            gate = gate.display(),
        ),
    );

    let tasks_dir = fixture.scratch_path().join("specs");
    write_lane_spec(
        &tasks_dir,
        "lane-a",
        &serde_json::json!({"tasks": [
            {"name": "one", "prompt": "p1"},
            {"name": "two", "prompt": "p2"}
        ]}),
    );

    let cfg = test_config(&fixture, &tasks_dir, &agent);
    let (bus, _e) = collecting_bus();
    let first = Orchestrator::new(Arc::clone(&cfg), bus)
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.outcome, FlowOutcome::Failed);
    let st = lane_state(&cfg, "lane-a");
    assert_eq!(st.status, LaneStatus::Failed);
    assert_eq!(st.current_task_index, 1);
    assert_eq!(st.completed_tasks, vec!["one".to_string()]);

    // Unblock the agent and resume the same run.
    std::fs::write(&gate, "go").unwrap();
    let (bus, _e) = collecting_bus();
    let second = Orchestrator::new(Arc::clone(&cfg), bus)
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.outcome, FlowOutcome::Completed, "{}", second.message);

    let st = lane_state(&cfg, "lane-a");
    assert_eq!(st.status, LaneStatus::Completed);
    assert_eq!(st.current_task_index, 2);
    assert_eq!(st.completed_tasks, vec!["one".to_string(), "two".to_string()]);

    // Task one ran once, task two ran twice (fail + retry-after-resume).
    let calls: u32 = std::fs::read_to_string(&counter).unwrap().trim().parse().unwrap();
    assert_eq!(calls, 3);
}
