//! S5: a silently stalled agent is driven through the full recovery
//! ladder and ends in an abort with a post-mortem document.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use laneflow_core::config::{FlowConfig, StallConfig, lane_files};
use laneflow_core::events::{Event, EventBus};
use laneflow_core::model::{LaneState, LaneStatus};
use laneflow_core::orchestrator::{FlowOutcome, Orchestrator};
use laneflow_core::recovery::postmortem::PostMortem;
use laneflow_core::state;

use laneflow_test_utils::{GitRepoFixture, stub_agent_silent, write_lane_spec};

#[tokio::test(flavor = "multi_thread")]
async fn stalled_agent_walks_ladder_to_abort_with_post_mortem() {
    let fixture = GitRepoFixture::new();
    let agent = stub_agent_silent(fixture.scratch_path());
    let tasks_dir = fixture.scratch_path().join("specs");
    write_lane_spec(
        &tasks_dir,
        "lane-a",
        &serde_json::json!({"tasks": [{"name": "stuck", "prompt": "never answers"}]}),
    );

    let mut cfg = FlowConfig::new(fixture.repo_path(), &tasks_dir);
    cfg.agent.binary = agent.to_string_lossy().to_string();
    cfg.agent.echo_output = false;
    cfg.agent.max_attempts = 1;
    // The hard timeout must not fire before the ladder finishes.
    cfg.task_timeout = Duration::from_secs(120);
    cfg.stall = StallConfig {
        idle_timeout: Duration::from_millis(300),
        long_operation_grace: Duration::from_millis(300),
        stage_grace: Duration::from_millis(200),
        tick_interval: Duration::from_millis(50),
        max_restarts: 1,
        long_operation_patterns: Vec::new(),
    };
    let cfg = Arc::new(cfg);

    let bus = EventBus::new();
    let events: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    bus.subscribe_all(move |e| sink.lock().unwrap().push(e.clone()));

    let report = Orchestrator::new(Arc::clone(&cfg), bus)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, FlowOutcome::Failed);
    assert_eq!(report.failed, vec!["lane-a"]);

    // The lane is failed and the recovery ladder ran in order.
    let st: LaneState = state::load(&lane_files::state(&cfg.lane_dir("lane-a"))).unwrap();
    assert_eq!(st.status, LaneStatus::Failed);
    assert!(st.error.unwrap().contains("aborted by stall recovery"));

    let recovery_events: Vec<String> = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.event_type.starts_with("recovery."))
        .map(|e| e.event_type.clone())
        .collect();
    assert_eq!(
        recovery_events,
        vec![
            "recovery.continue_signal",
            "recovery.stronger_prompt",
            "recovery.restart",
            "recovery.diagnosed",
            "recovery.aborted",
        ]
    );

    // The post-mortem exists, names the run, and has no prior failures.
    let pof_path = cfg.pof_dir().join(format!("pof-{}.json", cfg.run_id));
    assert!(pof_path.exists(), "expected {}", pof_path.display());
    let pof: PostMortem = state::load(&pof_path).unwrap();
    assert_eq!(pof.run_id, cfg.run_id);
    assert!(pof.previous_failures.is_empty());
    assert_eq!(pof.affected_lanes.len(), 1);
    assert_eq!(pof.affected_lanes[0].lane, "lane-a");
    assert!(
        !pof.affected_lanes[0].recovery_attempts.is_empty(),
        "failure history should be attached"
    );
    assert!(pof.recovery.command.contains("resume --all --run-dir"));
}
