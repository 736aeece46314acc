//! Stall detection and tiered auto-recovery.
//!
//! Each lane has an idle tracker fed by the agent supervisor with every
//! chunk of child output. When a lane goes quiet past its threshold, the
//! detector climbs a recovery ladder, one rung per grace period:
//!
//! ```text
//! NORMAL -> CONTINUE_SIGNAL -> STRONGER_PROMPT -> RESTART* -> DIAGNOSE -> ABORT
//! ```
//!
//! The first two rungs are handled here by writing a
//! `pending-intervention.json` the supervisor forwards to the agent's
//! stdin. Restart and abort require control of the child process, so those
//! rungs are returned to the supervisor as [`Escalation`] values.
//!
//! Stall detection is advisory: it never terminates a lane except through
//! the restart/abort escalations.

pub mod postmortem;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{StallConfig, lane_files};
use crate::events::{EventBus, EventPayload};
use crate::state;

/// Rungs of the recovery ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStage {
    Normal,
    ContinueSignal,
    StrongerPrompt,
    Restart,
    Diagnose,
    Abort,
}

/// One ladder transition, kept for the post-mortem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub stage: RecoveryStage,
    pub timestamp: DateTime<Utc>,
    pub idle_ms: u64,
    pub detail: String,
}

/// Environment findings gathered at the DIAGNOSE rung.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticInfo {
    pub agent_installed: bool,
    pub auth_ok: bool,
    pub workspace_writable: bool,
    pub remote_reachable: bool,
    pub notes: Vec<String>,
}

/// Escalations the supervisor must carry out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Kill the child, recreate the chat session, resend the task.
    Restart,
    /// Run environment diagnostics and record them.
    Diagnose,
    /// Write the post-mortem and fail the lane.
    Abort,
}

/// Copy of a lane's recovery state, used for post-mortem composition.
#[derive(Debug, Clone)]
pub struct RecoverySnapshot {
    pub stage: RecoveryStage,
    pub restart_count: u32,
    pub continue_signals_sent: u32,
    pub total_bytes: u64,
    pub last_output: Vec<String>,
    pub failure_history: Vec<FailureRecord>,
    pub diagnostics: Option<DiagnosticInfo>,
}

const LAST_OUTPUT_RING: usize = 16;

/// Body of `pending-intervention.json`, consumed by the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingIntervention {
    pub message: String,
    pub stage: RecoveryStage,
    pub timestamp: DateTime<Utc>,
}

struct LaneTracker {
    lane_dir: PathBuf,
    stage: RecoveryStage,
    /// Rung the ladder resumes from after a restart (no fresh activity
    /// observed). Fresh activity drops this back to `Normal`.
    ladder_floor: RecoveryStage,
    last_activity: Instant,
    total_bytes: u64,
    last_output: Vec<String>,
    restart_count: u32,
    continue_signals_sent: u32,
    last_stage_change: Instant,
    is_long_operation: bool,
    failure_history: Vec<FailureRecord>,
    current_task: Option<(String, String)>,
    diagnostics: Option<DiagnosticInfo>,
}

impl LaneTracker {
    fn new(lane_dir: PathBuf) -> Self {
        let now = Instant::now();
        Self {
            lane_dir,
            stage: RecoveryStage::Normal,
            ladder_floor: RecoveryStage::Normal,
            last_activity: now,
            total_bytes: 0,
            last_output: Vec::new(),
            restart_count: 0,
            continue_signals_sent: 0,
            last_stage_change: now,
            is_long_operation: false,
            failure_history: Vec::new(),
            current_task: None,
            diagnostics: None,
        }
    }
}

/// Per-run stall detector shared by all lane supervisors.
pub struct StallDetector {
    cfg: StallConfig,
    patterns: Vec<Regex>,
    lanes: Mutex<HashMap<String, LaneTracker>>,
    bus: EventBus,
    run_id: String,
}

impl StallDetector {
    pub fn new(cfg: StallConfig, bus: EventBus, run_id: &str) -> Self {
        let patterns = cfg
            .long_operation_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "ignoring invalid long-operation pattern");
                    None
                }
            })
            .collect();
        Self {
            cfg,
            patterns,
            lanes: Mutex::new(HashMap::new()),
            bus,
            run_id: run_id.to_string(),
        }
    }

    pub fn config(&self) -> &StallConfig {
        &self.cfg
    }

    /// Begin tracking a lane. Resets any prior tracker for the name.
    pub fn register(&self, lane: &str, lane_dir: &std::path::Path) {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes.insert(lane.to_string(), LaneTracker::new(lane_dir.to_path_buf()));
    }

    pub fn deregister(&self, lane: &str) {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes.remove(lane);
    }

    /// Record which task the lane is on, for the stronger-prompt message.
    pub fn set_current_task(&self, lane: &str, task: &str, prompt: &str) {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(t) = lanes.get_mut(lane) {
            t.current_task = Some((task.to_string(), prompt.to_string()));
        }
    }

    /// Feed child-output activity. Any byte count >= 1 resets the ladder.
    pub fn on_activity(&self, lane: &str, bytes: usize, snippet: &str) {
        if bytes == 0 {
            return;
        }
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        let Some(t) = lanes.get_mut(lane) else {
            return;
        };
        t.last_activity = Instant::now();
        t.total_bytes += bytes as u64;
        t.stage = RecoveryStage::Normal;
        t.ladder_floor = RecoveryStage::Normal;
        if !snippet.is_empty() {
            if t.last_output.len() == LAST_OUTPUT_RING {
                t.last_output.remove(0);
            }
            t.last_output.push(snippet.to_string());
            t.is_long_operation = self.patterns.iter().any(|re| re.is_match(snippet));
        }
    }

    /// Evaluate one lane's idle state, climbing at most one rung.
    ///
    /// Continue-signal and stronger-prompt rungs are executed here (the
    /// intervention file is written). Restart/diagnose/abort are returned
    /// for the supervisor to execute.
    pub fn evaluate(&self, lane: &str) -> Option<Escalation> {
        let now = Instant::now();
        // Events are emitted after the tracker lock is released so that
        // subscribers may call back into the detector.
        let (escalation, event) = {
            let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
            let t = lanes.get_mut(lane)?;

            if t.stage == RecoveryStage::Abort {
                return None;
            }

            let idle = now.duration_since(t.last_activity);
            let threshold = if t.is_long_operation {
                self.cfg.long_operation_grace
            } else {
                self.cfg.idle_timeout
            };
            if idle < threshold {
                return None;
            }
            if t.stage != RecoveryStage::Normal
                && now.duration_since(t.last_stage_change) < self.cfg.stage_grace
            {
                return None;
            }

            let effective = t.stage.max(t.ladder_floor);
            let next = match effective {
                RecoveryStage::Normal => RecoveryStage::ContinueSignal,
                RecoveryStage::ContinueSignal => RecoveryStage::StrongerPrompt,
                RecoveryStage::StrongerPrompt | RecoveryStage::Restart => {
                    if t.restart_count < self.cfg.max_restarts {
                        RecoveryStage::Restart
                    } else {
                        RecoveryStage::Diagnose
                    }
                }
                RecoveryStage::Diagnose => RecoveryStage::Abort,
                RecoveryStage::Abort => return None,
            };

            let idle_ms = idle.as_millis() as u64;
            t.stage = next;
            t.last_stage_change = now;
            t.failure_history.push(FailureRecord {
                stage: next,
                timestamp: Utc::now(),
                idle_ms,
                detail: format!("idle for {idle_ms} ms"),
            });

            match next {
                RecoveryStage::ContinueSignal => {
                    t.continue_signals_sent += 1;
                    self.write_intervention(t, next, continue_message());
                    (None, Some(EventPayload::ContinueSignal { idle_ms }))
                }
                RecoveryStage::StrongerPrompt => {
                    let message = stronger_message(t.current_task.as_ref());
                    self.write_intervention(t, next, message);
                    (None, Some(EventPayload::StrongerPrompt { idle_ms }))
                }
                RecoveryStage::Restart => {
                    t.restart_count += 1;
                    (
                        Some(Escalation::Restart),
                        Some(EventPayload::Restart {
                            restart_count: t.restart_count,
                        }),
                    )
                }
                RecoveryStage::Diagnose => (Some(Escalation::Diagnose), None),
                RecoveryStage::Abort => (Some(Escalation::Abort), None),
                RecoveryStage::Normal => (None, None),
            }
        };

        if let Some(payload) = event {
            self.bus.emit_payload(&self.run_id, Some(lane), payload);
        }
        escalation
    }

    fn write_intervention(&self, t: &LaneTracker, stage: RecoveryStage, message: String) {
        let body = PendingIntervention {
            message,
            stage,
            timestamp: Utc::now(),
        };
        let path = lane_files::pending_intervention(&t.lane_dir);
        if let Err(e) = state::save(&path, &body) {
            tracing::warn!(path = %path.display(), error = %e, "failed to write intervention");
        }
    }

    /// The supervisor restarted the agent: the lane re-enters NORMAL with a
    /// fresh activity clock, but the ladder resumes past the prompts.
    pub fn on_restart_performed(&self, lane: &str) {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(t) = lanes.get_mut(lane) {
            t.stage = RecoveryStage::Normal;
            t.ladder_floor = RecoveryStage::StrongerPrompt;
            t.last_activity = Instant::now();
            t.last_stage_change = Instant::now();
        }
    }

    /// Store diagnostics gathered by the supervisor and emit the event.
    pub fn record_diagnostics(&self, lane: &str, info: DiagnosticInfo) {
        let payload = EventPayload::Diagnosed {
            agent_installed: info.agent_installed,
            auth_ok: info.auth_ok,
        };
        let recorded = {
            let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
            match lanes.get_mut(lane) {
                Some(t) => {
                    t.diagnostics = Some(info);
                    true
                }
                None => false,
            }
        };
        if recorded {
            self.bus.emit_payload(&self.run_id, Some(lane), payload);
        }
    }

    /// The post-mortem has been written; the lane is terminal.
    pub fn mark_aborted(&self, lane: &str, pof_path: &std::path::Path) {
        {
            let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(t) = lanes.get_mut(lane) {
                t.stage = RecoveryStage::Abort;
            }
        }
        self.bus.emit_payload(
            &self.run_id,
            Some(lane),
            EventPayload::Aborted {
                pof_path: pof_path.display().to_string(),
            },
        );
    }

    /// The current task finished successfully; the incident is over.
    pub fn task_completed(&self, lane: &str) {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(t) = lanes.get_mut(lane) {
            t.stage = RecoveryStage::Normal;
            t.ladder_floor = RecoveryStage::Normal;
            t.continue_signals_sent = 0;
            t.is_long_operation = false;
            t.last_activity = Instant::now();
        }
    }

    /// Value-copy of a lane's recovery state for post-mortem composition.
    pub fn snapshot(&self, lane: &str) -> Option<RecoverySnapshot> {
        let lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes.get(lane).map(|t| RecoverySnapshot {
            stage: t.stage,
            restart_count: t.restart_count,
            continue_signals_sent: t.continue_signals_sent,
            total_bytes: t.total_bytes,
            last_output: t.last_output.clone(),
            failure_history: t.failure_history.clone(),
            diagnostics: t.diagnostics.clone(),
        })
    }
}

fn continue_message() -> String {
    "You appear to have paused. Please continue working on the current task. \
     If something is blocking you, state what it is and proceed as far as you can."
        .to_string()
}

fn stronger_message(current_task: Option<&(String, String)>) -> String {
    match current_task {
        Some((name, prompt)) => format!(
            "No output has been observed for an extended period. You are working on task \
             {name:?}. The task is:\n\n{prompt}\n\nReport your current status, then continue. \
             If you are finished, commit and push your work now."
        ),
        None => "No output has been observed for an extended period. Report your current \
                 status, then continue working."
            .to_string(),
    }
}
