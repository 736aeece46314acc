//! Agent supervisor.
//!
//! Owns every interaction with the external coding agent CLI: the startup
//! authentication probe, per-lane chat sessions, spawning the agent child
//! for each task, streaming and capturing its output, forwarding
//! interventions to its stdin, enforcing the (reschedulable) hard timeout,
//! and driving the stall detector's escalations.
//!
//! The binary path is the substitution seam: tests point the config at a
//! shell script that speaks the same wire format.

pub mod output;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::checkpoint;
use crate::config::{FlowConfig, lane_files};
use crate::events::{EventBus, EventPayload};
use crate::git::Git;
use crate::model::{ConversationEntry, ConversationRole, DependencyRequest};
use crate::recovery::{DiagnosticInfo, Escalation, PendingIntervention, StallDetector};
use crate::state;

use output::{extract_dependency_request, is_auth_error, is_transient_error, parse_final_result};

/// Keep at most this much of the child's stdout for final-result parsing.
const STDOUT_TAIL_CAP: usize = 512 * 1024;

/// How often the signal files are polled.
const WATCH_INTERVAL: Duration = Duration::from_millis(500);

/// Heartbeat log cadence while a child is running.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent binary {binary:?} not found on PATH")]
    NotInstalled { binary: String },

    #[error("agent authentication failed: {message}")]
    AuthFailed { message: String },

    #[error("agent probe failed: {message}")]
    ProbeFailed { message: String },

    #[error("failed to spawn agent: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },

    #[error("chat session creation failed: {stderr}")]
    ChatCreateFailed { stderr: String },
}

/// One task-send request.
pub struct SendRequest<'a> {
    pub lane: &'a str,
    pub task: &'a str,
    /// The wrapped prompt handed to the agent.
    pub prompt: &'a str,
    pub workspace: &'a Path,
    pub lane_dir: &'a Path,
    pub chat_id: String,
    pub model: Option<&'a str>,
    pub timeout: Duration,
}

/// Outcome of [`AgentSupervisor::send`]. No panics or errors cross this
/// boundary; failure is data.
#[derive(Debug, Clone)]
pub struct SendReport {
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub session_id: Option<String>,
    pub result_text: Option<String>,
    pub error: Option<String>,
    /// Populated after a successful send when the agent requested a
    /// dependency change (file form wins over the text marker).
    pub dependency_request: Option<DependencyRequest>,
    /// The chat session after the send; differs from the request's when a
    /// recovery restart re-created it.
    pub chat_id: String,
    /// True when the recovery ladder aborted the task.
    pub aborted: bool,
    pub pof_path: Option<PathBuf>,
}

impl SendReport {
    fn failure(chat_id: String, exit_code: Option<i32>, error: String) -> Self {
        Self {
            ok: false,
            exit_code,
            session_id: None,
            result_text: None,
            error: Some(error),
            dependency_request: None,
            chat_id,
            aborted: false,
            pof_path: None,
        }
    }
}

enum AttemptOutcome {
    Exited { exit_code: Option<i32>, stdout: String },
    TimedOut { elapsed: Duration },
    Restart,
    Abort,
    Cancelled,
}

/// Supervises the agent CLI for one run.
pub struct AgentSupervisor {
    cfg: Arc<FlowConfig>,
    bus: EventBus,
}

impl AgentSupervisor {
    pub fn new(cfg: Arc<FlowConfig>, bus: EventBus) -> Self {
        Self { cfg, bus }
    }

    /// Startup preconditions, checked once per run: the agent binary must
    /// be runnable and an empty chat session must be creatable within the
    /// probe budget.
    pub async fn preflight(&self) -> Result<(), AgentError> {
        self.create_chat().await.map(|_| ())
    }

    /// Allocate a chat session. Each lane calls this once and resumes the
    /// same session for every task.
    pub async fn create_chat(&self) -> Result<String, AgentError> {
        let agent = &self.cfg.agent;
        let mut cmd = Command::new(&agent.binary);
        cmd.arg("create-chat")
            .current_dir(&self.cfg.repo_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::NotInstalled {
                    binary: agent.binary.clone(),
                }
            } else {
                AgentError::Spawn { source: e }
            }
        })?;

        let output = tokio::time::timeout(agent.auth_probe_timeout, child.wait_with_output())
            .await
            .map_err(|_| AgentError::ProbeFailed {
                message: format!("create-chat did not answer within {:?}", agent.auth_probe_timeout),
            })?
            .map_err(|e| AgentError::Spawn { source: e })?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() || stdout.is_empty() {
            if is_auth_error(&stderr) {
                return Err(AgentError::AuthFailed { message: stderr });
            }
            return Err(AgentError::ChatCreateFailed { stderr });
        }

        Ok(stdout)
    }

    /// Run one task to completion, with bounded retries for transient
    /// failures and the recovery ladder for stalls.
    pub async fn send(
        &self,
        mut req: SendRequest<'_>,
        detector: &StallDetector,
        cancel: &CancellationToken,
    ) -> SendReport {
        detector.set_current_task(req.lane, req.task, req.prompt);

        let max_attempts = self.cfg.agent.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            let outcome = match self.run_attempt(&mut req, detector, cancel).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Spawn-class failures are transient per policy.
                    attempt += 1;
                    if attempt >= max_attempts {
                        return SendReport::failure(req.chat_id, None, e.to_string());
                    }
                    self.backoff(attempt).await;
                    continue;
                }
            };

            match outcome {
                AttemptOutcome::Exited { exit_code, stdout } => {
                    let parsed = parse_final_result(&stdout);
                    match parsed {
                        Some(result) if !result.is_error => {
                            let entry = ConversationEntry::new(
                                ConversationRole::Assistant,
                                req.task,
                                &result.result_text,
                                req.model,
                            );
                            let _ = state::append_log(
                                &lane_files::conversation_log(req.lane_dir),
                                &entry,
                            );

                            let dependency_request =
                                extract_dependency_request(req.workspace, &result.result_text);

                            return SendReport {
                                ok: true,
                                exit_code,
                                session_id: result.session_id,
                                result_text: Some(result.result_text),
                                error: None,
                                dependency_request,
                                chat_id: req.chat_id,
                                aborted: false,
                                pof_path: None,
                            };
                        }
                        Some(result) => {
                            let error = if result.result_text.is_empty() {
                                "agent reported an error result".to_string()
                            } else {
                                result.result_text
                            };
                            if is_auth_error(&error) {
                                return SendReport::failure(req.chat_id, exit_code, error);
                            }
                            attempt += 1;
                            if !is_transient_error(&error) || attempt >= max_attempts {
                                return SendReport::failure(req.chat_id, exit_code, error);
                            }
                            tracing::warn!(
                                lane = req.lane,
                                task = req.task,
                                attempt = attempt,
                                error = %error,
                                "transient agent error, retrying"
                            );
                            self.backoff(attempt).await;
                        }
                        None => {
                            let code = exit_code
                                .map_or_else(|| "unknown".to_string(), |c| c.to_string());
                            let error =
                                format!("agent exited (code {code}) without a result line");
                            let tail = stdout.chars().rev().take(400).collect::<String>();
                            let tail: String = tail.chars().rev().collect();
                            if is_auth_error(&tail) {
                                return SendReport::failure(
                                    req.chat_id,
                                    exit_code,
                                    format!("{error}: {tail}"),
                                );
                            }
                            attempt += 1;
                            let transient =
                                exit_code != Some(0) && (is_transient_error(&tail) || tail.is_empty());
                            if !transient || attempt >= max_attempts {
                                return SendReport::failure(req.chat_id, exit_code, error);
                            }
                            self.backoff(attempt).await;
                        }
                    }
                }
                AttemptOutcome::TimedOut { elapsed } => {
                    self.bus.emit_payload(
                        &self.cfg.run_id,
                        Some(req.lane),
                        EventPayload::AgentTimedOut {
                            elapsed_ms: elapsed.as_millis() as u64,
                        },
                    );
                    attempt += 1;
                    if attempt >= max_attempts {
                        return SendReport::failure(
                            req.chat_id,
                            None,
                            format!("agent timed out after {elapsed:?}"),
                        );
                    }
                    self.backoff(attempt).await;
                }
                AttemptOutcome::Restart => {
                    // Checkpoint before the restart-style recovery action.
                    let _ = checkpoint::create_checkpoint(
                        req.lane_dir,
                        req.lane,
                        Some(req.workspace),
                        "Before recovery restart",
                        checkpoint::DEFAULT_MAX_CHECKPOINTS,
                    )
                    .await;

                    match self.create_chat().await {
                        Ok(new_chat) => {
                            tracing::warn!(
                                lane = req.lane,
                                task = req.task,
                                old_chat = %req.chat_id,
                                new_chat = %new_chat,
                                "restarting agent with a fresh chat session"
                            );
                            req.chat_id = new_chat;
                        }
                        Err(e) => {
                            tracing::warn!(
                                lane = req.lane,
                                error = %e,
                                "chat re-creation failed during restart, reusing session"
                            );
                        }
                    }
                    detector.on_restart_performed(req.lane);
                    // A restart does not consume a transient-retry attempt.
                }
                AttemptOutcome::Abort => {
                    let snapshot = detector.snapshot(req.lane).unwrap_or(
                        crate::recovery::RecoverySnapshot {
                            stage: crate::recovery::RecoveryStage::Abort,
                            restart_count: 0,
                            continue_signals_sent: 0,
                            total_bytes: 0,
                            last_output: vec![],
                            failure_history: vec![],
                            diagnostics: None,
                        },
                    );
                    let pof = crate::recovery::postmortem::compose_post_mortem(
                        &self.cfg.run_id,
                        &self.cfg.run_dir(),
                        req.lane,
                        &snapshot,
                    );
                    let pof_path = match crate::recovery::postmortem::write_post_mortem(
                        &self.cfg.pof_dir(),
                        pof,
                    ) {
                        Ok(path) => {
                            detector.mark_aborted(req.lane, &path);
                            Some(path)
                        }
                        Err(e) => {
                            tracing::error!(lane = req.lane, error = %e, "failed to write post-mortem");
                            detector.mark_aborted(req.lane, Path::new("unwritten"));
                            None
                        }
                    };
                    return SendReport {
                        ok: false,
                        exit_code: None,
                        session_id: None,
                        result_text: None,
                        error: Some("aborted by stall recovery".to_string()),
                        dependency_request: None,
                        chat_id: req.chat_id,
                        aborted: true,
                        pof_path,
                    };
                }
                AttemptOutcome::Cancelled => {
                    return SendReport::failure(req.chat_id, None, "cancelled".to_string());
                }
            }
        }
    }

    async fn backoff(&self, attempt: u32) {
        use rand::Rng;
        let base = self.cfg.agent.retry_base_delay;
        let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(Duration::from_secs(30));
        let jitter = Duration::from_millis(rand::rng().random_range(0..250));
        tokio::time::sleep(capped + jitter).await;
    }

    /// Run a single agent child to exit, timeout, or escalation.
    async fn run_attempt(
        &self,
        req: &mut SendRequest<'_>,
        detector: &StallDetector,
        cancel: &CancellationToken,
    ) -> Result<AttemptOutcome, AgentError> {
        let agent = &self.cfg.agent;

        let mut cmd = Command::new(&agent.binary);
        cmd.arg("--print")
            .arg("--force")
            .arg("--approve-mcps")
            .arg("--output-format")
            .arg(agent.output_format.as_arg())
            .arg("--workspace")
            .arg(req.workspace)
            .arg("--resume")
            .arg(&req.chat_id);
        if let Some(model) = req.model {
            cmd.arg("--model").arg(model);
        }
        cmd.arg(req.prompt);

        cmd.current_dir(req.workspace);
        // Inherit the parent environment, minus debugger flags that would
        // make the child wait for an attach.
        if let Ok(node_options) = std::env::var("NODE_OPTIONS") {
            let stripped: Vec<&str> = node_options
                .split_whitespace()
                .filter(|opt| !opt.starts_with("--inspect"))
                .collect();
            cmd.env("NODE_OPTIONS", stripped.join(" "));
        }
        cmd.env("FORCE_UNBUFFERED_OUTPUT", "1");

        cmd.stdin(if agent.intervention_enabled {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::NotInstalled {
                    binary: agent.binary.clone(),
                }
            } else {
                AgentError::Spawn { source: e }
            }
        })?;

        let pid = child.id().unwrap_or_default();
        self.bus.emit_payload(
            &self.cfg.run_id,
            Some(req.lane),
            EventPayload::AgentSpawned {
                pid,
                task: req.task.to_string(),
            },
        );

        let mut stdin = child.stdin.take();
        let (tx, mut rx) = mpsc::channel::<(bool, Vec<u8>)>(64);
        spawn_reader(child.stdout.take(), true, tx.clone());
        spawn_reader(child.stderr.take(), false, tx);

        let start = tokio::time::Instant::now();
        let mut deadline = start + req.timeout;
        let mut stdout_tail = String::new();
        let mut line_buffer = String::new();
        let mut bytes_received: u64 = 0;
        let mut readers_done = false;

        let mut heartbeat =
            tokio::time::interval_at(start + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        let mut watcher = tokio::time::interval_at(start + WATCH_INTERVAL, WATCH_INTERVAL);
        let tick = detector.config().tick_interval;
        let mut stall_tick = tokio::time::interval_at(start + tick, tick);

        // What the select loop decided; the child is only killed outside
        // the select so the wait() future never aliases it.
        enum LoopAction {
            Exited(Option<i32>),
            Timeout,
            Restart,
            Abort,
            Cancelled,
            Continue,
        }

        loop {
            let action = tokio::select! {
                status = child.wait() => {
                    LoopAction::Exited(status.ok().and_then(|s| s.code()))
                }

                chunk = rx.recv(), if !readers_done => {
                    match chunk {
                        Some((is_stdout, chunk)) => {
                            self.consume_chunk(
                                req, detector, is_stdout, &chunk,
                                &mut stdout_tail, &mut line_buffer, &mut bytes_received,
                            ).await;
                        }
                        None => readers_done = true,
                    }
                    LoopAction::Continue
                }

                _ = heartbeat.tick() => {
                    tracing::info!(
                        lane = req.lane,
                        task = req.task,
                        elapsed_s = start.elapsed().as_secs(),
                        bytes = bytes_received,
                        "agent heartbeat"
                    );
                    LoopAction::Continue
                }

                _ = watcher.tick() => {
                    self.consume_signal_files(req, &mut stdin, start, &mut deadline).await;
                    LoopAction::Continue
                }

                _ = tokio::time::sleep_until(deadline) => LoopAction::Timeout,

                _ = stall_tick.tick() => {
                    match detector.evaluate(req.lane) {
                        Some(Escalation::Restart) => LoopAction::Restart,
                        Some(Escalation::Diagnose) => {
                            let info = self.run_diagnostics(req.workspace).await;
                            detector.record_diagnostics(req.lane, info);
                            LoopAction::Continue
                        }
                        Some(Escalation::Abort) => LoopAction::Abort,
                        None => LoopAction::Continue,
                    }
                }

                _ = cancel.cancelled() => LoopAction::Cancelled,
            };

            match action {
                LoopAction::Continue => {}
                LoopAction::Exited(exit_code) => {
                    // Drain whatever the readers still hold.
                    loop {
                        match tokio::time::timeout(Duration::from_millis(250), rx.recv()).await {
                            Ok(Some((is_stdout, chunk))) => {
                                self.consume_chunk(
                                    req, detector, is_stdout, &chunk,
                                    &mut stdout_tail, &mut line_buffer, &mut bytes_received,
                                ).await;
                            }
                            Ok(None) | Err(_) => break,
                        }
                    }
                    self.bus.emit_payload(
                        &self.cfg.run_id,
                        Some(req.lane),
                        EventPayload::AgentExited { exit_code },
                    );
                    return Ok(AttemptOutcome::Exited { exit_code, stdout: stdout_tail });
                }
                LoopAction::Timeout => {
                    tracing::warn!(lane = req.lane, task = req.task, "agent hard timeout, killing child");
                    kill_child(&mut child).await;
                    return Ok(AttemptOutcome::TimedOut { elapsed: start.elapsed() });
                }
                LoopAction::Restart => {
                    kill_child(&mut child).await;
                    return Ok(AttemptOutcome::Restart);
                }
                LoopAction::Abort => {
                    kill_child(&mut child).await;
                    return Ok(AttemptOutcome::Abort);
                }
                LoopAction::Cancelled => {
                    kill_child(&mut child).await;
                    return Ok(AttemptOutcome::Cancelled);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn consume_chunk(
        &self,
        req: &SendRequest<'_>,
        detector: &StallDetector,
        is_stdout: bool,
        chunk: &[u8],
        stdout_tail: &mut String,
        line_buffer: &mut String,
        bytes_received: &mut u64,
    ) {
        let text = String::from_utf8_lossy(chunk);
        *bytes_received += chunk.len() as u64;

        let snippet: String = text.chars().rev().take(200).collect::<String>().chars().rev().collect();
        detector.on_activity(req.lane, chunk.len(), snippet.trim());

        if self.cfg.agent.echo_output {
            if is_stdout {
                let _ = tokio::io::stdout().write_all(chunk).await;
            } else {
                let _ = tokio::io::stderr().write_all(chunk).await;
            }
        }

        if is_stdout {
            stdout_tail.push_str(&text);
            if stdout_tail.len() > STDOUT_TAIL_CAP {
                let cut = stdout_tail.len() - STDOUT_TAIL_CAP;
                let cut = stdout_tail
                    .char_indices()
                    .find(|(i, _)| *i >= cut)
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                stdout_tail.drain(..cut);
            }

            // Structured terminal log, one JSON object per line.
            line_buffer.push_str(&text);
            while let Some(pos) = line_buffer.find('\n') {
                let line: String = line_buffer.drain(..=pos).collect();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
                    let _ = state::append_log(&lane_files::terminal_log(req.lane_dir), &value);
                }
            }
        }
    }

    /// Check the lane directory for externally dropped signal files.
    async fn consume_signal_files(
        &self,
        req: &SendRequest<'_>,
        stdin: &mut Option<ChildStdin>,
        start: tokio::time::Instant,
        deadline: &mut tokio::time::Instant,
    ) {
        let intervention = lane_files::intervention(req.lane_dir);
        if let Ok(content) = std::fs::read_to_string(&intervention) {
            let _ = std::fs::remove_file(&intervention);
            self.forward_intervention(req, stdin, content.trim_end()).await;
        }

        let pending = lane_files::pending_intervention(req.lane_dir);
        if pending.exists() {
            if let Some(body) = state::load::<PendingIntervention>(&pending) {
                let _ = std::fs::remove_file(&pending);
                self.forward_intervention(req, stdin, &body.message).await;
            } else {
                let _ = std::fs::remove_file(&pending);
            }
        }

        let timeout_file = lane_files::timeout_override(req.lane_dir);
        if let Ok(content) = std::fs::read_to_string(&timeout_file) {
            let _ = std::fs::remove_file(&timeout_file);
            if let Ok(ms) = content.trim().parse::<u64>() {
                *deadline = start + Duration::from_millis(ms);
                tracing::info!(lane = req.lane, new_timeout_ms = ms, "task timeout rescheduled");
            }
        }
    }

    async fn forward_intervention(
        &self,
        req: &SendRequest<'_>,
        stdin: &mut Option<ChildStdin>,
        message: &str,
    ) {
        if message.is_empty() {
            return;
        }
        if let Some(pipe) = stdin.as_mut() {
            let payload = format!("{message}\n");
            if let Err(e) = pipe.write_all(payload.as_bytes()).await {
                tracing::warn!(lane = req.lane, error = %e, "failed to write intervention to agent stdin");
            } else {
                let _ = pipe.flush().await;
            }
        } else {
            tracing::warn!(lane = req.lane, "intervention dropped: agent stdin not available");
        }
        let entry =
            ConversationEntry::new(ConversationRole::Intervention, req.task, message, None);
        let _ = state::append_log(&lane_files::conversation_log(req.lane_dir), &entry);
    }

    /// Environment checks for the DIAGNOSE recovery rung.
    pub async fn run_diagnostics(&self, workspace: &Path) -> DiagnosticInfo {
        let mut notes = Vec::new();

        let (agent_installed, auth_ok) = match self.create_chat().await {
            Ok(_) => (true, true),
            Err(AgentError::NotInstalled { binary }) => {
                notes.push(format!("agent binary {binary:?} not found"));
                (false, false)
            }
            Err(AgentError::AuthFailed { message }) => {
                notes.push(format!("auth probe failed: {message}"));
                (true, false)
            }
            Err(e) => {
                notes.push(format!("agent probe failed: {e}"));
                (true, false)
            }
        };

        let workspace_writable = {
            let probe = workspace.join(".laneflow-write-probe");
            let ok = std::fs::write(&probe, b"probe").is_ok();
            let _ = std::fs::remove_file(&probe);
            if !ok {
                notes.push(format!("workspace {} not writable", workspace.display()));
            }
            ok
        };

        let git = Git::new(workspace).with_timeout(Duration::from_secs(10));
        let remote_reachable = if git.has_remote("origin").await {
            match git.run(&["ls-remote", "--heads", "origin"]).await {
                Ok(r) if r.success => true,
                Ok(r) => {
                    notes.push(format!("ls-remote failed: {}", r.stderr.trim()));
                    false
                }
                Err(e) => {
                    notes.push(format!("ls-remote failed: {e}"));
                    false
                }
            }
        } else {
            true
        };

        DiagnosticInfo {
            agent_installed,
            auth_ok,
            workspace_writable,
            remote_reachable,
            notes,
        }
    }
}

fn spawn_reader<R>(reader: Option<R>, is_stdout: bool, tx: mpsc::Sender<(bool, Vec<u8>)>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let Some(mut reader) = reader else {
        return;
    };
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send((is_stdout, buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// SIGTERM, a 5-second grace, then SIGKILL.
async fn kill_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .is_ok()
        {
            return;
        }
    }
    let _ = child.kill().await;
}
