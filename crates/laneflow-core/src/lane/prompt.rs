//! Prompt wrapping and dependency-policy enforcement.
//!
//! Every task prompt is wrapped with a preamble describing the isolated
//! worktree convention, a dependency-policy block, and a completion block
//! that tells the agent how to hand its work back (commit, push, optional
//! state pass-through). The raw user prompt goes to the conversation log;
//! the wrapped form goes to the agent.

use std::path::Path;

use crate::config::INTERNAL_DIR;
use crate::model::DependencyPolicy;
use crate::spec::TaskSpec;

/// Lockfiles made read-only when the policy says so.
const LOCKFILES: &[&str] = &[
    "package-lock.json",
    "npm-shrinkwrap.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "bun.lockb",
    "Cargo.lock",
    "poetry.lock",
    "Pipfile.lock",
    "Gemfile.lock",
    "composer.lock",
    "go.sum",
];

/// Manifests protected when dependency changes are disallowed.
const MANIFESTS: &[&str] = &["package.json"];

/// Build the full prompt handed to the agent for one task.
pub fn build_wrapped_prompt(
    task: &TaskSpec,
    worktree_dir: &Path,
    pipeline_branch: &str,
    policy: &DependencyPolicy,
) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "You are working inside an isolated Git worktree at {dir}. Your branch is \
         checked out for you; do not switch branches or leave the worktree. All of \
         your changes will be merged into the pipeline branch {pipeline} once the \
         task is done.\n\n",
        dir = worktree_dir.display(),
        pipeline = pipeline_branch,
    ));

    out.push_str(&policy_block(policy));
    out.push('\n');

    out.push_str("## Task\n\n");
    out.push_str(&task.prompt);
    out.push_str("\n\n");

    out.push_str(&format!(
        "## When you are done\n\n\
         Stage and commit everything, then push:\n\n\
             git add -A\n\
             git commit -m \"{task}: <short description>\"\n\
             git push origin HEAD\n\n\
         If you need to pass state to the next task in this lane, write it to \
         {internal}/lane-state.json inside the worktree; it is carried forward \
         verbatim.\n",
        task = task.name,
        internal = INTERNAL_DIR,
    ));

    out
}

fn policy_block(policy: &DependencyPolicy) -> String {
    let mut out = String::from("## Dependency policy\n\n");
    if policy.allow_dependency_change {
        out.push_str("You may modify package manifests if the task requires it.\n");
    } else {
        out.push_str(&format!(
            "Do NOT add, remove, or upgrade external dependencies. Package manifests \
             are write-protected. If the task cannot be completed without a dependency \
             change, do not work around it: write {INTERNAL_DIR}/dependency-request.json \
             containing {{\"reason\", \"commands\", \"changes\", \"notes\"}} or print a \
             line `DEPENDENCY_CHANGE_REQUIRED` followed by that JSON object, then stop.\n",
        ));
    }
    if policy.lockfile_read_only {
        out.push_str("Lockfiles are read-only and must not be regenerated.\n");
    }
    out
}

/// Clear write permission bits on protected files, per the policy.
///
/// Best-effort: missing files are ignored, permission errors are logged.
pub fn apply_dependency_policy(worktree_dir: &Path, policy: &DependencyPolicy) {
    let mut targets: Vec<&str> = Vec::new();
    if !policy.allow_dependency_change {
        targets.extend_from_slice(MANIFESTS);
    }
    if policy.lockfile_read_only {
        targets.extend_from_slice(LOCKFILES);
    }

    for name in targets {
        let path = worktree_dir.join(name);
        let Ok(metadata) = std::fs::metadata(&path) else {
            continue;
        };
        let mut perms = metadata.permissions();
        perms.set_readonly(true);
        if let Err(e) = std::fs::set_permissions(&path, perms) {
            tracing::warn!(path = %path.display(), error = %e, "failed to write-protect file");
        }
    }
}

/// Restore write permission on protected files (used before merging so Git
/// can update them).
pub fn release_dependency_policy(worktree_dir: &Path) {
    for name in MANIFESTS.iter().chain(LOCKFILES.iter()) {
        let path = worktree_dir.join(name);
        let Ok(metadata) = std::fs::metadata(&path) else {
            continue;
        };
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = metadata.permissions();
            perms.set_mode(perms.mode() | 0o200);
            let _ = std::fs::set_permissions(&path, perms);
        }
        #[cfg(not(unix))]
        {
            let mut perms = metadata.permissions();
            #[allow(clippy::permissions_set_readonly_false)]
            perms.set_readonly(false);
            let _ = std::fs::set_permissions(&path, perms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn task(name: &str, prompt: &str) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            prompt: prompt.to_string(),
            model: None,
            timeout: None,
            depends_on: vec![],
        }
    }

    #[test]
    fn wrapped_prompt_contains_all_blocks() {
        let t = task("init", "Create src/lib.rs with a hello function.");
        let wrapped = build_wrapped_prompt(
            &t,
            Path::new("/wt/lane-a"),
            "lane/abc12-x1y2z",
            &DependencyPolicy::default(),
        );

        assert!(wrapped.contains("/wt/lane-a"));
        assert!(wrapped.contains("lane/abc12-x1y2z"));
        assert!(wrapped.contains("Create src/lib.rs"));
        assert!(wrapped.contains("git push origin HEAD"));
        assert!(wrapped.contains("DEPENDENCY_CHANGE_REQUIRED"));
        assert!(wrapped.contains("lane-state.json"));
    }

    #[test]
    fn permissive_policy_omits_request_protocol() {
        let t = task("init", "p");
        let wrapped = build_wrapped_prompt(
            &t,
            Path::new("/wt"),
            "lane/x",
            &DependencyPolicy {
                allow_dependency_change: true,
                lockfile_read_only: false,
            },
        );
        assert!(!wrapped.contains("DEPENDENCY_CHANGE_REQUIRED"));
        assert!(wrapped.contains("may modify package manifests"));
    }

    #[test]
    fn policy_write_protects_existing_files_only() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        std::fs::write(dir.path().join("yarn.lock"), "").unwrap();

        apply_dependency_policy(dir.path(), &DependencyPolicy::default());

        assert!(std::fs::metadata(dir.path().join("package.json"))
            .unwrap()
            .permissions()
            .readonly());
        assert!(std::fs::metadata(dir.path().join("yarn.lock"))
            .unwrap()
            .permissions()
            .readonly());

        release_dependency_policy(dir.path());
        assert!(!std::fs::metadata(dir.path().join("package.json"))
            .unwrap()
            .permissions()
            .readonly());
    }

    #[test]
    fn permissive_policy_leaves_manifest_writable() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        apply_dependency_policy(
            dir.path(),
            &DependencyPolicy {
                allow_dependency_change: true,
                lockfile_read_only: false,
            },
        );
        assert!(!std::fs::metadata(dir.path().join("package.json"))
            .unwrap()
            .permissions()
            .readonly());
    }
}
