//! laneflow-core: a concurrent execution engine that orchestrates parallel
//! runs of an external interactive coding agent across a Git repository.
//!
//! A flow is a DAG of *lanes*; each lane is a sequence of *tasks* executed
//! by one worker in an isolated Git worktree on its own pipeline branch.
//! Task results are committed and pushed as they land, stalled agents are
//! driven through a tiered recovery ladder, and completed lane branches
//! are finally integrated into a single feature branch. Every step
//! persists durable state first, so a crashed run resumes from its last
//! checkpoint.
//!
//! Entry point: [`orchestrator::Orchestrator`]. Collaborators (TUI,
//! webhooks, review tooling) attach through [`events::EventBus`] and the
//! documented run-directory layout; they are not part of this crate.

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod git;
pub mod integrate;
pub mod lane;
pub mod locks;
pub mod model;
pub mod orchestrator;
pub mod recovery;
pub mod spec;
pub mod state;

pub use config::{AgentConfig, FlowConfig, StallConfig};
pub use events::{Event, EventBus, EventPayload};
pub use model::{LaneOutcome, LaneState, LaneStatus};
pub use orchestrator::{FlowOutcome, FlowReport, Orchestrator};
