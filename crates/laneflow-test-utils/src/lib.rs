//! Shared test utilities for laneflow integration tests.
//!
//! Provides temp Git repositories (optionally with a bare `origin` remote),
//! executable stub agent scripts that speak the agent wire format, and
//! lane-spec writers.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

/// A temp Git repository with an initial commit, plus a scratch directory
/// for worktrees and other side artifacts.
pub struct GitRepoFixture {
    root: TempDir,
}

impl GitRepoFixture {
    /// Create a repository with one commit (a `README.md`).
    pub fn new() -> Self {
        let root = TempDir::new().expect("failed to create temp dir");
        let repo = root.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();

        git(&repo, &["init", "--initial-branch=main"]);
        git(&repo, &["config", "user.email", "test@laneflow.dev"]);
        git(&repo, &["config", "user.name", "Laneflow Test"]);
        std::fs::write(repo.join("README.md"), "# Test repo\n").unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-m", "Initial commit"]);

        Self { root }
    }

    /// Like [`GitRepoFixture::new`] but with a bare `origin` remote wired
    /// up and the initial branch pushed.
    pub fn with_remote() -> Self {
        let fixture = Self::new();
        let remote = fixture.remote_path();
        git_anywhere(&["init", "--bare", "--initial-branch=main", remote.to_str().unwrap()]);
        git(
            &fixture.repo_path(),
            &["remote", "add", "origin", remote.to_str().unwrap()],
        );
        git(&fixture.repo_path(), &["push", "-u", "origin", "main"]);
        fixture
    }

    pub fn repo_path(&self) -> PathBuf {
        self.root.path().join("repo")
    }

    /// Directory for worktrees and other artifacts outside the repo.
    pub fn scratch_path(&self) -> &Path {
        self.root.path()
    }

    pub fn remote_path(&self) -> PathBuf {
        self.root.path().join("origin.git")
    }

    /// Clone the bare remote into the scratch dir and return the clone path.
    pub fn clone_remote(&self, name: &str) -> PathBuf {
        let dest = self.root.path().join(name);
        git_anywhere(&[
            "clone",
            self.remote_path().to_str().unwrap(),
            dest.to_str().unwrap(),
        ]);
        git(&dest, &["config", "user.email", "test@laneflow.dev"]);
        git(&dest, &["config", "user.name", "Laneflow Clone"]);
        dest
    }

    /// Run an arbitrary git command in the repo, panicking on failure.
    pub fn git(&self, args: &[&str]) -> String {
        git(&self.repo_path(), args)
    }
}

impl Default for GitRepoFixture {
    fn default() -> Self {
        Self::new()
    }
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("git {} failed to run: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn git_anywhere(args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("git {} failed to run: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Write an executable shell script at `path` and return the path.
pub fn write_script(path: &Path, body: &str) -> PathBuf {
    std::fs::write(path, body).expect("failed to write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to chmod script");
    }
    path.to_path_buf()
}

/// A stub agent binary that handles `create-chat` and otherwise writes a
/// file into the workspace, commits it, and prints a final result line.
///
/// The file name and contents are derived from the chat id so lanes get
/// distinct files.
pub fn stub_agent_committing(dir: &Path) -> PathBuf {
    write_script(
        &dir.join("stub-agent.sh"),
        r#"#!/bin/sh
# Stub coding agent. First positional mode: create-chat prints a chat id.
if [ "$1" = "create-chat" ]; then
    echo "chat-$$"
    exit 0
fi

# Parse --workspace and --resume out of the argument list.
workspace=""
chat=""
while [ $# -gt 0 ]; do
    case "$1" in
        --workspace) workspace="$2"; shift 2 ;;
        --resume) chat="$2"; shift 2 ;;
        *) shift ;;
    esac
done

cd "$workspace" || exit 1
file="agent-${chat}.txt"
echo "work for ${chat}" >> "$file"
git add -A >/dev/null 2>&1
git commit -m "agent work" >/dev/null 2>&1
git push origin HEAD >/dev/null 2>&1
echo '{"type":"result","is_error":false,"session_id":"'"$chat"'","result":"done"}'
"#,
    )
}

/// A stub agent that edits a fixed file (for conflict scenarios); the
/// content written is the chat id, so two lanes conflict on the same line.
pub fn stub_agent_conflicting(dir: &Path, target_file: &str) -> PathBuf {
    write_script(
        &dir.join("stub-agent-conflict.sh"),
        &format!(
            r#"#!/bin/sh
if [ "$1" = "create-chat" ]; then
    echo "chat-$$"
    exit 0
fi
workspace=""
chat=""
while [ $# -gt 0 ]; do
    case "$1" in
        --workspace) workspace="$2"; shift 2 ;;
        --resume) chat="$2"; shift 2 ;;
        *) shift ;;
    esac
done
cd "$workspace" || exit 1
echo "edited by $chat" > "{target_file}"
git add -A >/dev/null 2>&1
git commit -m "edit {target_file}" >/dev/null 2>&1
git push origin HEAD >/dev/null 2>&1
echo '{{"type":"result","is_error":false,"session_id":"'"$chat"'","result":"done"}}'
"#
        ),
    )
}

/// A stub agent that emits the dependency-change marker in its result text
/// and makes no commits.
pub fn stub_agent_blocked(dir: &Path) -> PathBuf {
    write_script(
        &dir.join("stub-agent-blocked.sh"),
        r#"#!/bin/sh
if [ "$1" = "create-chat" ]; then
    echo "chat-$$"
    exit 0
fi
echo '{"type":"result","is_error":false,"session_id":"s","result":"DEPENDENCY_CHANGE_REQUIRED {\"reason\":\"need x\",\"commands\":[\"add x\"]}"}'
"#,
    )
}

/// A stub agent that sleeps silently forever (stall scenarios). The
/// `create-chat` mode still answers so preflight passes.
pub fn stub_agent_silent(dir: &Path) -> PathBuf {
    write_script(
        &dir.join("stub-agent-silent.sh"),
        r#"#!/bin/sh
if [ "$1" = "create-chat" ]; then
    echo "chat-$$"
    exit 0
fi
sleep 3600
"#,
    )
}

/// Write a lane spec JSON file into `tasks_dir`.
pub fn write_lane_spec(tasks_dir: &Path, name: &str, spec: &serde_json::Value) -> PathBuf {
    std::fs::create_dir_all(tasks_dir).unwrap();
    let path = tasks_dir.join(format!("{name}.json"));
    std::fs::write(&path, serde_json::to_string_pretty(spec).unwrap()).unwrap();
    path
}
