//! S6: two lanes that edit the same line both complete, and the flow
//! integrator merges the first but aborts on the second.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use laneflow_core::config::FlowConfig;
use laneflow_core::events::EventBus;
use laneflow_core::git::Git;
use laneflow_core::model::{FlowMeta, FlowStatus};
use laneflow_core::orchestrator::{FlowOutcome, Orchestrator};
use laneflow_core::state;

use laneflow_test_utils::{GitRepoFixture, stub_agent_conflicting, write_lane_spec};

#[tokio::test(flavor = "multi_thread")]
async fn integration_stops_at_first_conflicting_lane() {
    let fixture = GitRepoFixture::with_remote();
    let agent = stub_agent_conflicting(fixture.scratch_path(), "README.md");
    let tasks_dir = fixture.scratch_path().join("specs");
    for lane in ["alpha", "beta"] {
        write_lane_spec(
            &tasks_dir,
            lane,
            &serde_json::json!({"tasks": [{"name": "edit", "prompt": "edit the readme"}]}),
        );
    }

    let mut cfg = FlowConfig::new(fixture.repo_path(), &tasks_dir);
    cfg.agent.binary = agent.to_string_lossy().to_string();
    cfg.agent.echo_output = false;
    cfg.agent.max_attempts = 1;
    cfg.task_timeout = Duration::from_secs(30);
    cfg.stall.idle_timeout = Duration::from_secs(60);
    let cfg = Arc::new(cfg);

    let report = Orchestrator::new(Arc::clone(&cfg), EventBus::new())
        .run(CancellationToken::new())
        .await
        .unwrap();

    // Both lanes completed on their own branches; the flow failed only at
    // integration time.
    assert_eq!(report.outcome, FlowOutcome::Failed, "{}", report.message);
    assert_eq!(report.completed, vec!["alpha", "beta"]);
    assert!(report.failed.is_empty());
    assert!(report.message.contains("Merge conflict during integration"));

    let meta: FlowMeta = state::load(&cfg.flow_meta_path()).unwrap();
    assert_eq!(meta.status, FlowStatus::Failed);
    assert_eq!(
        meta.error.as_deref(),
        Some("Merge conflict during integration")
    );
    let conflict = meta.conflict.expect("conflict details should be recorded");
    assert_eq!(conflict.lane, "beta", "lanes integrate in topological order");
    assert_eq!(conflict.files, vec!["README.md".to_string()]);

    // The integrated branch is left at the first successful merge: it
    // carries alpha's edit, and the aborted beta merge left no residue.
    let git = Git::new(fixture.repo_path());
    let branch = report.integrated_branch.unwrap();
    assert_eq!(git.current_branch().await.unwrap(), branch);
    assert!(git.changed_files().await.unwrap().is_empty());
    let readme = std::fs::read_to_string(fixture.repo_path().join("README.md")).unwrap();
    assert!(
        readme.starts_with("edited by"),
        "alpha's merge should be present, got: {readme:?}"
    );
}
