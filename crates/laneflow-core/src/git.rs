//! Git facade.
//!
//! Every Git interaction in the engine goes through [`Git`], which wraps the
//! external `git` binary with a 30-second default timeout and typed results.
//! Operations on a single worktree are serialised by the owning lane runner;
//! worktree creation is additionally serialised across processes by the
//! `worktree` lock.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

use crate::locks::LockManager;

/// SHA of Git's empty tree, used as the diff base for root commits.
const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// Default wall-time limit for a single git command.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum GitError {
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    #[error("failed to run git {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("invalid worktree at {path}: {reason}")]
    InvalidWorktree { path: PathBuf, reason: String },

    #[error("refusing to remove valid worktree at {0}")]
    WorktreeStillValid(PathBuf),

    #[error("branch {branch} diverged from origin/{branch}")]
    Diverged { branch: String },

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Raw result of one git invocation.
#[derive(Debug, Clone)]
pub struct CmdResult {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Information about one registered worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head_commit: String,
}

/// Result of a merge-conflict pre-check via `merge-tree`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictCheck {
    pub will_conflict: bool,
    pub conflicting_files: Vec<String>,
}

/// Options for [`Git::safe_merge`].
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub no_ff: bool,
    pub message: Option<String>,
    pub abort_on_conflict: bool,
    pub strategy: Option<String>,
}

/// Result of [`Git::safe_merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub success: bool,
    pub conflict: bool,
    pub conflicting_files: Vec<String>,
    pub aborted: bool,
    pub error: Option<String>,
}

/// Result of [`Git::push_with_fallback_branch_name`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReport {
    pub success: bool,
    pub final_branch_name: String,
    pub renamed: bool,
}

/// A handle bound to one working directory (repo root or a worktree).
#[derive(Debug, Clone)]
pub struct Git {
    cwd: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Run `git <args>` with the configured timeout.
    pub async fn run(&self, args: &[&str]) -> Result<CmdResult, GitError> {
        let command = args.join(" ");
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.cwd)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| GitError::Spawn {
            command: command.clone(),
            source: e,
        })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| GitError::Timeout {
                command: command.clone(),
                timeout: self.timeout,
            })?
            .map_err(|e| GitError::Spawn {
                command: command.clone(),
                source: e,
            })?;

        Ok(CmdResult {
            success: output.status.success(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: filter_remote_noise(&String::from_utf8_lossy(&output.stderr)),
        })
    }

    /// Run and fail on non-zero exit; returns trimmed stdout.
    pub async fn run_checked(&self, args: &[&str]) -> Result<String, GitError> {
        let result = self.run(args).await?;
        if !result.success {
            return Err(GitError::Exit {
                command: args.join(" "),
                code: result.exit_code,
                stderr: result.stderr,
            });
        }
        Ok(result.stdout.trim().to_string())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn is_git_repo(&self) -> bool {
        self.run(&["rev-parse", "--git-dir"])
            .await
            .map(|r| r.success)
            .unwrap_or(false)
    }

    pub async fn current_branch(&self) -> Result<String, GitError> {
        self.run_checked(&["branch", "--show-current"]).await
    }

    pub async fn repo_root(&self) -> Result<PathBuf, GitError> {
        let out = self.run_checked(&["rev-parse", "--show-toplevel"]).await?;
        Ok(PathBuf::from(out))
    }

    /// Root of the main repository, even when `cwd` is a linked worktree:
    /// the first entry of `worktree list --porcelain`.
    pub async fn main_repo_root(&self) -> Result<PathBuf, GitError> {
        let worktrees = self.list_worktrees().await?;
        worktrees
            .first()
            .map(|w| w.path.clone())
            .ok_or_else(|| GitError::NotAGitRepo(self.cwd.clone()))
    }

    pub async fn head_commit(&self) -> Result<String, GitError> {
        self.run_checked(&["rev-parse", "HEAD"]).await
    }

    pub async fn branch_exists(&self, name: &str, remote: bool) -> Result<bool, GitError> {
        let refspec = if remote {
            format!("refs/remotes/origin/{name}")
        } else {
            format!("refs/heads/{name}")
        };
        let result = self.run(&["rev-parse", "--verify", "--quiet", &refspec]).await?;
        Ok(result.success)
    }

    pub async fn has_remote(&self, name: &str) -> bool {
        match self.run(&["remote"]).await {
            Ok(r) if r.success => r.stdout.lines().any(|l| l.trim() == name),
            _ => false,
        }
    }

    /// Paths with uncommitted changes (`status --porcelain`).
    pub async fn changed_files(&self) -> Result<Vec<String>, GitError> {
        let out = self.run_checked(&["status", "--porcelain"]).await?;
        Ok(out
            .lines()
            .filter_map(|l| l.get(3..).map(|p| p.to_string()))
            .collect())
    }

    /// `diff --stat` of the last commit; uses the empty tree as the base
    /// for a root commit.
    pub async fn last_operation_stats(&self) -> Result<String, GitError> {
        let has_parent = self
            .run(&["rev-parse", "--verify", "--quiet", "HEAD^1"])
            .await?
            .success;
        let base = if has_parent { "HEAD^1" } else { EMPTY_TREE };
        self.run_checked(&["diff", "--stat", base, "HEAD"]).await
    }

    // ------------------------------------------------------------------
    // Worktrees
    // ------------------------------------------------------------------

    /// Create (or reuse) a worktree at `dir` checked out to `branch`.
    ///
    /// Serialised across processes by the `worktree` lock for the whole
    /// operation. If the branch already exists locally the worktree points
    /// at it; otherwise the branch is created from `base_branch`. Spurious
    /// failures are retried up to 3 times with 500-1500 ms jitter.
    pub async fn create_worktree(
        &self,
        locks: &LockManager,
        dir: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Result<PathBuf, GitError> {
        let _guard = locks
            .acquire("worktree", Duration::from_secs(120))
            .await
            .map_err(|e| GitError::Io {
                path: locks.locks_dir().to_path_buf(),
                source: std::io::Error::other(e.to_string()),
            })?;

        if let Some(parent) = dir.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GitError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let base_ref = if base_branch.starts_with("refs/") {
            base_branch.to_string()
        } else {
            format!("refs/heads/{base_branch}")
        };

        let mut last_err = None;
        for attempt in 0..3u32 {
            if attempt > 0 {
                let jitter = {
                    use rand::Rng;
                    rand::rng().random_range(500..1500)
                };
                tokio::time::sleep(Duration::from_millis(jitter)).await;
            }

            let dir_str = dir.to_string_lossy();
            let result = if self.branch_exists(branch, false).await? {
                self.run(&["worktree", "add", &dir_str, branch]).await?
            } else {
                self.run(&["worktree", "add", "-b", branch, &dir_str, &base_ref])
                    .await?
            };

            if result.success {
                return Ok(dir.to_path_buf());
            }

            tracing::warn!(
                branch = branch,
                attempt = attempt + 1,
                stderr = %result.stderr.trim(),
                "worktree add failed, retrying"
            );
            // Clean partial state before the next attempt.
            let _ = self.cleanup_invalid_worktree_dir(dir);
            let _ = self.run(&["worktree", "prune"]).await;
            last_err = Some(GitError::Exit {
                command: "worktree add".to_string(),
                code: result.exit_code,
                stderr: result.stderr,
            });
        }

        Err(last_err.unwrap_or_else(|| GitError::Exit {
            command: "worktree add".to_string(),
            code: -1,
            stderr: "exhausted retries".to_string(),
        }))
    }

    pub async fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, GitError> {
        let out = self
            .run_checked(&["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_porcelain(&out))
    }

    /// A worktree is valid iff the path exists and `<path>/.git` is a
    /// *file* whose contents begin with `gitdir:` and point to an existing
    /// directory.
    pub fn is_valid_worktree(path: &Path) -> bool {
        if !path.exists() {
            return false;
        }
        let git_file = path.join(".git");
        let Ok(meta) = std::fs::symlink_metadata(&git_file) else {
            return false;
        };
        if !meta.is_file() {
            return false;
        }
        let Ok(content) = std::fs::read_to_string(&git_file) else {
            return false;
        };
        let Some(gitdir) = content.trim().strip_prefix("gitdir:") else {
            return false;
        };
        let gitdir = gitdir.trim();
        let gitdir_path = if Path::new(gitdir).is_absolute() {
            PathBuf::from(gitdir)
        } else {
            path.join(gitdir)
        };
        gitdir_path.is_dir()
    }

    /// Remove a directory that is *not* a valid worktree. Refuses to touch
    /// a valid one.
    pub fn cleanup_invalid_worktree_dir(&self, path: &Path) -> Result<(), GitError> {
        if Self::is_valid_worktree(path) {
            return Err(GitError::WorktreeStillValid(path.to_path_buf()));
        }
        if path.exists() {
            std::fs::remove_dir_all(path).map_err(|e| GitError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Branches, commits, pushes
    // ------------------------------------------------------------------

    pub async fn checkout(&self, branch: &str) -> Result<(), GitError> {
        self.run_checked(&["checkout", branch]).await.map(|_| ())
    }

    /// `checkout -B`: create or reset the branch at HEAD.
    pub async fn checkout_new(&self, branch: &str) -> Result<(), GitError> {
        self.run_checked(&["checkout", "-B", branch]).await.map(|_| ())
    }

    pub async fn delete_branch(&self, branch: &str, remote: bool) -> Result<(), GitError> {
        let result = if remote {
            self.run(&["push", "origin", "--delete", branch]).await?
        } else {
            self.run(&["branch", "-D", branch]).await?
        };
        // Branch not found is fine for idempotency.
        if !result.success
            && !result.stderr.contains("not found")
            && !result.stderr.contains("remote ref does not exist")
        {
            return Err(GitError::Exit {
                command: if remote { "push --delete" } else { "branch -D" }.to_string(),
                code: result.exit_code,
                stderr: result.stderr,
            });
        }
        Ok(())
    }

    /// Commit staged (or all, with `add_all`) changes. Returns `false` when
    /// there was nothing to commit.
    pub async fn commit(&self, message: &str, add_all: bool) -> Result<bool, GitError> {
        if add_all {
            self.run_checked(&["add", "-A"]).await?;
        }
        let status = self.run_checked(&["status", "--porcelain"]).await?;
        if status.is_empty() {
            return Ok(false);
        }
        self.run_checked(&["commit", "-m", message]).await?;
        Ok(true)
    }

    /// Push a branch. Silently skipped (returns `false`) when the repo has
    /// no `origin` remote.
    pub async fn push(
        &self,
        branch: &str,
        set_upstream: bool,
        force: bool,
    ) -> Result<bool, GitError> {
        if !self.has_remote("origin").await {
            tracing::debug!(branch = branch, "no origin remote, skipping push");
            return Ok(false);
        }
        let mut args = vec!["push"];
        if set_upstream {
            args.push("--set-upstream");
        }
        if force {
            args.push("--force");
        }
        args.push("origin");
        args.push(branch);
        self.run_checked(&args).await?;
        Ok(true)
    }

    /// Push, renaming the local branch to `<branch>-merged-<unixMs>` and
    /// retrying when the push is rejected as non-fast-forward.
    pub async fn push_with_fallback_branch_name(
        &self,
        branch: &str,
        max_retries: u32,
    ) -> Result<PushReport, GitError> {
        if !self.has_remote("origin").await {
            return Ok(PushReport {
                success: true,
                final_branch_name: branch.to_string(),
                renamed: false,
            });
        }

        let mut current = branch.to_string();
        let mut renamed = false;

        for _attempt in 0..max_retries.max(1) {
            let result = self
                .run(&["push", "--set-upstream", "origin", &current])
                .await?;
            if result.success {
                return Ok(PushReport {
                    success: true,
                    final_branch_name: current,
                    renamed,
                });
            }

            if !is_non_fast_forward(&result.stderr) {
                return Err(GitError::Exit {
                    command: "push".to_string(),
                    code: result.exit_code,
                    stderr: result.stderr,
                });
            }

            let fallback = format!("{branch}-merged-{}", chrono::Utc::now().timestamp_millis());
            tracing::warn!(
                branch = %current,
                fallback = %fallback,
                "push rejected as non-fast-forward, renaming branch"
            );
            self.run_checked(&["branch", "-m", &current, &fallback]).await?;
            current = fallback;
            renamed = true;
        }

        Ok(PushReport {
            success: false,
            final_branch_name: current,
            renamed,
        })
    }

    // ------------------------------------------------------------------
    // Merging
    // ------------------------------------------------------------------

    /// Simulate merging `branch` into HEAD without touching the index,
    /// via `merge-tree <base> HEAD <branch>`.
    pub async fn check_merge_conflict(
        &self,
        base: &str,
        branch: &str,
    ) -> Result<ConflictCheck, GitError> {
        let merge_base = self
            .run_checked(&["merge-base", base, branch])
            .await
            .unwrap_or_else(|_| base.to_string());
        let result = self.run(&["merge-tree", &merge_base, "HEAD", branch]).await?;
        Ok(parse_merge_tree_output(&result.stdout))
    }

    /// Execute a merge; on conflict, optionally abort and report the
    /// conflicting paths.
    pub async fn safe_merge(&self, branch: &str, opts: &MergeOptions) -> Result<MergeReport, GitError> {
        let mut args: Vec<String> = vec!["merge".to_string()];
        if opts.no_ff {
            args.push("--no-ff".to_string());
        }
        if let Some(strategy) = &opts.strategy {
            args.push("--strategy".to_string());
            args.push(strategy.clone());
        }
        if let Some(message) = &opts.message {
            args.push("-m".to_string());
            args.push(message.clone());
        }
        args.push(branch.to_string());

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let result = self.run(&arg_refs).await?;

        if result.success {
            return Ok(MergeReport {
                success: true,
                conflict: false,
                conflicting_files: vec![],
                aborted: false,
                error: None,
            });
        }

        let combined = format!("{}\n{}", result.stdout, result.stderr);
        let conflict = combined.contains("CONFLICT") || combined.contains("Automatic merge failed");

        if !conflict {
            return Ok(MergeReport {
                success: false,
                conflict: false,
                conflicting_files: vec![],
                aborted: false,
                error: Some(result.stderr.trim().to_string()),
            });
        }

        // Collect unmerged paths before a possible abort.
        let conflicting_files = self
            .run(&["diff", "--name-only", "--diff-filter=U"])
            .await
            .ok()
            .filter(|r| r.success)
            .map(|r| r.stdout.lines().map(|l| l.to_string()).collect())
            .unwrap_or_default();

        let mut aborted = false;
        if opts.abort_on_conflict {
            aborted = self
                .run(&["merge", "--abort"])
                .await
                .map(|r| r.success)
                .unwrap_or(false);
        }

        Ok(MergeReport {
            success: false,
            conflict: true,
            conflicting_files,
            aborted,
            error: None,
        })
    }

    pub async fn merge_abort(&self) -> Result<(), GitError> {
        self.run_checked(&["merge", "--abort"]).await.map(|_| ())
    }

    /// Fetch and fast-forward a branch to its remote counterpart. Fails on
    /// divergence.
    pub async fn sync_branch_with_remote(&self, branch: &str) -> Result<(), GitError> {
        if !self.has_remote("origin").await {
            return Ok(());
        }
        self.run_checked(&["fetch", "origin", branch]).await?;
        let result = self
            .run(&["merge", "--ff-only", &format!("origin/{branch}")])
            .await?;
        if !result.success {
            return Err(GitError::Diverged {
                branch: branch.to_string(),
            });
        }
        Ok(())
    }

    /// Convert a shallow clone into a full one.
    pub async fn ensure_unshallow(&self) -> Result<(), GitError> {
        let shallow = self
            .run_checked(&["rev-parse", "--is-shallow-repository"])
            .await?;
        if shallow != "true" {
            return Ok(());
        }
        let result = self.run(&["fetch", "--unshallow"]).await?;
        if result.success {
            return Ok(());
        }
        self.run_checked(&["fetch", "--depth=2147483647"]).await?;
        Ok(())
    }

    /// Stash any uncommitted changes. Returns `true` if something was
    /// stashed.
    pub async fn stash_push(&self, message: &str) -> Result<bool, GitError> {
        let out = self
            .run_checked(&["stash", "push", "--include-untracked", "-m", message])
            .await?;
        Ok(!out.contains("No local changes"))
    }
}

/// Strip forge chatter (`remote: Create a pull request...`) from stderr.
fn filter_remote_noise(stderr: &str) -> String {
    stderr
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            trimmed != "remote:" && !trimmed.starts_with("remote: Create a pull request")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whether a push rejection is the non-fast-forward kind.
fn is_non_fast_forward(stderr: &str) -> bool {
    stderr.contains("non-fast-forward")
        || stderr.contains("fetch first")
        || stderr.contains("[rejected]")
}

/// Parse `worktree list --porcelain` output. Blocks are separated by blank
/// lines: `worktree <path>` / `HEAD <sha>` / `branch refs/heads/<name>`
/// (or `detached`, `bare`).
fn parse_worktree_porcelain(output: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut head: Option<String> = None;
    let mut branch: Option<String> = None;

    let mut flush = |path: &mut Option<PathBuf>, head: &mut Option<String>, branch: &mut Option<String>, out: &mut Vec<WorktreeInfo>| {
        if let (Some(p), Some(h)) = (path.take(), head.take()) {
            out.push(WorktreeInfo {
                path: p,
                branch: branch.take(),
                head_commit: h,
            });
        } else {
            *branch = None;
        }
    };

    for line in output.lines() {
        if line.is_empty() {
            flush(&mut path, &mut head, &mut branch, &mut worktrees);
            continue;
        }
        if let Some(rest) = line.strip_prefix("worktree ") {
            path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            head = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            branch = Some(rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string());
        }
    }
    flush(&mut path, &mut head, &mut branch, &mut worktrees);
    worktrees
}

/// Parse classic three-argument `merge-tree` output: conflict markers mean
/// the merge will conflict; `changed in both` stanzas name the paths.
fn parse_merge_tree_output(output: &str) -> ConflictCheck {
    let mut conflicting_files = Vec::new();
    let mut in_changed_block = false;

    for line in output.lines() {
        if line.trim() == "changed in both" {
            in_changed_block = true;
            continue;
        }
        if in_changed_block {
            let trimmed = line.trim_start();
            if let Some(rest) = trimmed.strip_prefix("our ") {
                // "our <mode> <sha> <path>"
                if let Some(file) = rest.split_whitespace().nth(2) {
                    let file = file.to_string();
                    if !conflicting_files.contains(&file) {
                        conflicting_files.push(file);
                    }
                }
                in_changed_block = false;
            } else if !trimmed.starts_with("base ") && !trimmed.starts_with("their ") {
                in_changed_block = false;
            }
        }
    }

    ConflictCheck {
        will_conflict: output.contains("<<<<<<<"),
        conflicting_files,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use laneflow_test_utils::GitRepoFixture;

    #[test]
    fn filters_pull_request_chatter() {
        let noisy = "remote: Create a pull request for 'x' on GitHub\nerror: failed\n";
        let filtered = filter_remote_noise(noisy);
        assert!(!filtered.contains("pull request"));
        assert!(filtered.contains("error: failed"));
    }

    #[test]
    fn detects_non_fast_forward() {
        assert!(is_non_fast_forward("! [rejected] x -> x (non-fast-forward)"));
        assert!(is_non_fast_forward("hint: Updates were rejected... fetch first"));
        assert!(!is_non_fast_forward("error: could not resolve host"));
    }

    #[test]
    fn parses_worktree_porcelain() {
        let input = "worktree /home/u/project\nHEAD abc123\nbranch refs/heads/main\n\nworktree /home/u/wt/x\nHEAD def456\ndetached\n";
        let list = parse_worktree_porcelain(input);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].branch.as_deref(), Some("main"));
        assert_eq!(list[1].branch, None);
        assert_eq!(list[1].head_commit, "def456");
    }

    #[test]
    fn parses_merge_tree_conflicts() {
        let input = "\
changed in both
  base   100644 1111111 README.md
  our    100644 2222222 README.md
  their  100644 3333333 README.md
@@ -1 +1,5 @@
<<<<<<< .our
ours
=======
theirs
>>>>>>> .their
";
        let check = parse_merge_tree_output(input);
        assert!(check.will_conflict);
        assert_eq!(check.conflicting_files, vec!["README.md".to_string()]);
    }

    #[test]
    fn merge_tree_clean_output_has_no_conflict() {
        let check = parse_merge_tree_output("added in remote\n  their  100644 abc file.txt\n");
        assert!(!check.will_conflict);
        assert!(check.conflicting_files.is_empty());
    }

    #[tokio::test]
    async fn current_branch_and_head() {
        let fixture = GitRepoFixture::new();
        let git = Git::new(fixture.repo_path());
        assert!(git.is_git_repo().await);
        let branch = git.current_branch().await.unwrap();
        assert!(!branch.is_empty());
        let head = git.head_commit().await.unwrap();
        assert_eq!(head.len(), 40);
    }

    #[tokio::test]
    async fn branch_exists_only_after_creation() {
        let fixture = GitRepoFixture::new();
        let git = Git::new(fixture.repo_path());
        assert!(!git.branch_exists("feature-x", false).await.unwrap());
        git.checkout_new("feature-x").await.unwrap();
        assert!(git.branch_exists("feature-x", false).await.unwrap());
    }

    #[tokio::test]
    async fn commit_reports_nothing_to_commit() {
        let fixture = GitRepoFixture::new();
        let git = Git::new(fixture.repo_path());
        assert!(!git.commit("empty", true).await.unwrap());
        std::fs::write(fixture.repo_path().join("new.txt"), "content\n").unwrap();
        assert!(git.commit("add new.txt", true).await.unwrap());
    }

    #[tokio::test]
    async fn push_skipped_without_origin() {
        let fixture = GitRepoFixture::new();
        let git = Git::new(fixture.repo_path());
        let pushed = git.push("main", true, false).await.unwrap();
        assert!(!pushed);
    }

    #[tokio::test]
    async fn create_worktree_and_validate() {
        let fixture = GitRepoFixture::new();
        let git = Git::new(fixture.repo_path());
        let locks = LockManager::new(fixture.repo_path().join(".laneflow/locks"));
        let base = git.current_branch().await.unwrap();

        let wt_dir = fixture.scratch_path().join("wt-lane-a");
        git.create_worktree(&locks, &wt_dir, "lane/abc-x1y2z", &base)
            .await
            .unwrap();

        assert!(wt_dir.exists());
        assert!(Git::is_valid_worktree(&wt_dir));
        assert!(!Git::is_valid_worktree(fixture.scratch_path()));

        // A valid worktree is protected from cleanup.
        assert!(matches!(
            git.cleanup_invalid_worktree_dir(&wt_dir),
            Err(GitError::WorktreeStillValid(_))
        ));

        let listed = git.list_worktrees().await.unwrap();
        assert!(listed.iter().any(|w| w.branch.as_deref() == Some("lane/abc-x1y2z")));
    }

    #[tokio::test]
    async fn create_worktree_reuses_existing_branch() {
        let fixture = GitRepoFixture::new();
        let git = Git::new(fixture.repo_path());
        let locks = LockManager::new(fixture.repo_path().join(".laneflow/locks"));
        let base = git.current_branch().await.unwrap();

        git.checkout_new("lane/reuse-me").await.unwrap();
        git.checkout(&base).await.unwrap();

        let wt_dir = fixture.scratch_path().join("wt-reuse");
        git.create_worktree(&locks, &wt_dir, "lane/reuse-me", &base)
            .await
            .unwrap();
        let wt_git = Git::new(&wt_dir);
        assert_eq!(wt_git.current_branch().await.unwrap(), "lane/reuse-me");
    }

    #[tokio::test]
    async fn safe_merge_conflict_aborts_and_reports_files() {
        let fixture = GitRepoFixture::new();
        let git = Git::new(fixture.repo_path());
        let base = git.current_branch().await.unwrap();

        // Branch that edits README one way.
        git.checkout_new("side").await.unwrap();
        std::fs::write(fixture.repo_path().join("README.md"), "# side\n").unwrap();
        git.commit("side edit", true).await.unwrap();

        // Base edits README the other way.
        git.checkout(&base).await.unwrap();
        std::fs::write(fixture.repo_path().join("README.md"), "# base\n").unwrap();
        git.commit("base edit", true).await.unwrap();

        let report = git
            .safe_merge(
                "side",
                &MergeOptions {
                    no_ff: true,
                    abort_on_conflict: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(!report.success);
        assert!(report.conflict);
        assert!(report.aborted);
        assert_eq!(report.conflicting_files, vec!["README.md".to_string()]);

        // Merge was aborted: working tree is clean.
        assert!(git.changed_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn safe_merge_success() {
        let fixture = GitRepoFixture::new();
        let git = Git::new(fixture.repo_path());
        let base = git.current_branch().await.unwrap();

        git.checkout_new("feature").await.unwrap();
        std::fs::write(fixture.repo_path().join("feature.txt"), "f\n").unwrap();
        git.commit("add feature", true).await.unwrap();
        git.checkout(&base).await.unwrap();

        let report = git
            .safe_merge(
                "feature",
                &MergeOptions {
                    no_ff: true,
                    message: Some("merge feature".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(report.success);
        assert!(fixture.repo_path().join("feature.txt").exists());
    }

    #[tokio::test]
    async fn main_repo_root_resolves_from_worktree() {
        let fixture = GitRepoFixture::new();
        let git = Git::new(fixture.repo_path());
        let locks = LockManager::new(fixture.repo_path().join(".laneflow/locks"));
        let base = git.current_branch().await.unwrap();

        let wt_dir = fixture.scratch_path().join("wt-root");
        git.create_worktree(&locks, &wt_dir, "lane/root-check", &base)
            .await
            .unwrap();

        let wt_git = Git::new(&wt_dir);
        let main_root = wt_git.main_repo_root().await.unwrap();
        assert_eq!(
            main_root.canonicalize().unwrap(),
            fixture.repo_path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn last_operation_stats_handles_root_commit() {
        let fixture = GitRepoFixture::new();
        let git = Git::new(fixture.repo_path());

        // Only the root commit exists: diff runs against the empty tree.
        let stats = git.last_operation_stats().await.unwrap();
        assert!(stats.contains("README.md"));

        std::fs::write(fixture.repo_path().join("next.txt"), "x\n").unwrap();
        git.commit("add next", true).await.unwrap();
        let stats = git.last_operation_stats().await.unwrap();
        assert!(stats.contains("next.txt"));
        assert!(!stats.contains("README.md"));
    }

    #[tokio::test]
    async fn ensure_unshallow_is_a_noop_on_full_clone() {
        let fixture = GitRepoFixture::new();
        let git = Git::new(fixture.repo_path());
        git.ensure_unshallow().await.unwrap();
    }

    #[tokio::test]
    async fn sync_branch_fast_forwards_and_rejects_divergence() {
        let fixture = GitRepoFixture::with_remote();
        let git = Git::new(fixture.repo_path());

        // Advance main in a second clone and push.
        let clone = fixture.clone_remote("syncer");
        let clone_git = Git::new(&clone);
        std::fs::write(clone.join("upstream.txt"), "u\n").unwrap();
        clone_git.commit("upstream change", true).await.unwrap();
        clone_git.push("main", false, false).await.unwrap();

        git.sync_branch_with_remote("main").await.unwrap();
        assert!(fixture.repo_path().join("upstream.txt").exists());

        // Diverge locally; the sync must refuse.
        std::fs::write(clone.join("upstream2.txt"), "u2\n").unwrap();
        clone_git.commit("second upstream change", true).await.unwrap();
        clone_git.push("main", false, false).await.unwrap();
        std::fs::write(fixture.repo_path().join("local.txt"), "l\n").unwrap();
        git.commit("local change", true).await.unwrap();

        assert!(matches!(
            git.sync_branch_with_remote("main").await,
            Err(GitError::Diverged { .. })
        ));
    }

    #[tokio::test]
    async fn merge_conflict_precheck_predicts_conflict() {
        let fixture = GitRepoFixture::new();
        let git = Git::new(fixture.repo_path());
        let base = git.current_branch().await.unwrap();

        git.checkout_new("side").await.unwrap();
        std::fs::write(fixture.repo_path().join("README.md"), "# side\n").unwrap();
        git.commit("side edit", true).await.unwrap();
        git.checkout(&base).await.unwrap();
        std::fs::write(fixture.repo_path().join("README.md"), "# base\n").unwrap();
        git.commit("base edit", true).await.unwrap();

        let check = git.check_merge_conflict(&base, "side").await.unwrap();
        assert!(check.will_conflict);
        assert!(check.conflicting_files.contains(&"README.md".to_string()));

        // The simulation must not touch the working tree.
        assert!(git.changed_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn push_with_fallback_renames_on_non_fast_forward() {
        let fixture = GitRepoFixture::with_remote();
        let git = Git::new(fixture.repo_path());
        let base = git.current_branch().await.unwrap();

        // Push a branch, then rewrite its remote history from a second
        // clone so our next push is non-fast-forward.
        git.checkout_new("contested").await.unwrap();
        std::fs::write(fixture.repo_path().join("a.txt"), "a\n").unwrap();
        git.commit("a", true).await.unwrap();
        git.push("contested", true, false).await.unwrap();

        let clone = fixture.clone_remote("second");
        let clone_git = Git::new(&clone);
        clone_git.run_checked(&["checkout", "contested"]).await.unwrap();
        std::fs::write(clone.join("b.txt"), "b\n").unwrap();
        clone_git.commit("b", true).await.unwrap();
        clone_git.push("contested", false, false).await.unwrap();

        // Local divergent commit.
        std::fs::write(fixture.repo_path().join("c.txt"), "c\n").unwrap();
        git.commit("c", true).await.unwrap();

        let report = git
            .push_with_fallback_branch_name("contested", 3)
            .await
            .unwrap();
        assert!(report.success);
        assert!(report.renamed);
        assert!(report.final_branch_name.starts_with("contested-merged-"));

        git.checkout(&base).await.unwrap();
    }
}
