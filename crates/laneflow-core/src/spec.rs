//! Lane specification parsing and validation.
//!
//! Reads every `*.json` file in the tasks directory as one lane and
//! validates:
//! - Lane and task names match `[A-Za-z0-9_-]+` and task names are unique
//!   within a lane.
//! - Task prompts are non-empty.
//! - `dependsOn` references point to existing lanes; task-level
//!   `lane:task` references point to existing tasks in other lanes.
//! - The lane dependency graph is acyclic (Kahn's algorithm).

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::config::is_valid_name;
use crate::model::DependencyPolicy;

/// Errors that can occur during lane-spec parsing and validation.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("failed to read tasks directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read lane spec {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in lane spec {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no lane specs found in {0}")]
    NoLanes(PathBuf),

    #[error("invalid lane name {0:?} (allowed: alphanumeric, '-', '_')")]
    InvalidLaneName(String),

    #[error("duplicate lane name: {0:?}")]
    DuplicateLaneName(String),

    #[error("invalid task name {task:?} in lane {lane:?}")]
    InvalidTaskName { lane: String, task: String },

    #[error("duplicate task name {task:?} in lane {lane:?}")]
    DuplicateTaskName { lane: String, task: String },

    #[error("empty prompt for task {task:?} in lane {lane:?}")]
    EmptyPrompt { lane: String, task: String },

    #[error("lane {lane:?} depends on unknown lane {dependency:?}")]
    UnknownDependency { lane: String, dependency: String },

    #[error("task {task:?} in lane {lane:?} has malformed dependency {dependency:?} (expected \"lane:task\")")]
    MalformedTaskDependency {
        lane: String,
        task: String,
        dependency: String,
    },

    #[error("task {task:?} in lane {lane:?} depends on unknown target {dependency:?}")]
    UnknownTaskDependency {
        lane: String,
        task: String,
        dependency: String,
    },

    #[error("task {task:?} in lane {lane:?} may not depend on its own lane")]
    SelfLaneTaskDependency { lane: String, task: String },

    #[error("dependency cycle detected involving lanes: {0}")]
    CycleDetected(String),
}

impl SpecError {
    /// The lanes participating in a detected cycle, if this is a cycle error.
    pub fn cycle_lanes(&self) -> Option<Vec<String>> {
        match self {
            SpecError::CycleDetected(list) => {
                Some(list.split(", ").map(|s| s.to_string()).collect())
            }
            _ => None,
        }
    }
}

/// Raw lane spec file contents.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LaneSpecFile {
    #[serde(default)]
    name: Option<String>,
    tasks: Vec<TaskSpec>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    base_branch: Option<String>,
    #[serde(default)]
    branch_prefix: Option<String>,
    #[serde(default)]
    pipeline_branch: Option<String>,
    #[serde(default)]
    worktree_root: Option<PathBuf>,
    #[serde(default)]
    dependency_policy: Option<DependencyPolicy>,
    #[serde(default)]
    timeout: Option<u64>,
}

/// One task inside a lane.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Wall-time limit in milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Cross-lane dependencies, `lane:task` form.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl TaskSpec {
    /// Branch name for this task: `<pipeline>--<NN>-<name>`, `NN` 1-based.
    pub fn branch_name(&self, pipeline_branch: &str, index: usize) -> String {
        format!("{pipeline_branch}--{:02}-{}", index + 1, self.name)
    }
}

/// A validated lane, ready for scheduling.
#[derive(Debug, Clone)]
pub struct Lane {
    pub name: String,
    pub tasks: Vec<TaskSpec>,
    pub depends_on: Vec<String>,
    pub base_branch: Option<String>,
    pub branch_prefix: Option<String>,
    pub pipeline_branch: Option<String>,
    pub worktree_root: Option<PathBuf>,
    pub dependency_policy: DependencyPolicy,
    /// Per-lane wall-time limit in milliseconds, if set.
    pub timeout: Option<u64>,
    /// The spec file this lane came from.
    pub spec_path: PathBuf,
}

/// Load and validate every lane spec in a directory.
pub fn load_lanes(tasks_dir: &Path) -> Result<Vec<Lane>, SpecError> {
    let entries = std::fs::read_dir(tasks_dir).map_err(|e| SpecError::ReadDir {
        path: tasks_dir.to_path_buf(),
        source: e,
    })?;

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    paths.sort();

    if paths.is_empty() {
        return Err(SpecError::NoLanes(tasks_dir.to_path_buf()));
    }

    let mut lanes = Vec::with_capacity(paths.len());
    for path in paths {
        let content = std::fs::read_to_string(&path).map_err(|e| SpecError::ReadFile {
            path: path.clone(),
            source: e,
        })?;
        let file: LaneSpecFile =
            serde_json::from_str(&content).map_err(|e| SpecError::Json {
                path: path.clone(),
                source: e,
            })?;

        let name = file.name.unwrap_or_else(|| {
            path.file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("lane")
                .to_string()
        });

        lanes.push(Lane {
            name,
            tasks: file.tasks,
            depends_on: file.depends_on,
            base_branch: file.base_branch,
            branch_prefix: file.branch_prefix,
            pipeline_branch: file.pipeline_branch,
            worktree_root: file.worktree_root,
            dependency_policy: file.dependency_policy.unwrap_or_default(),
            timeout: file.timeout,
            spec_path: path,
        });
    }

    validate(&lanes)?;
    Ok(lanes)
}

/// Validate an already-parsed set of lanes.
pub fn validate(lanes: &[Lane]) -> Result<(), SpecError> {
    let mut lane_names = HashSet::new();
    for lane in lanes {
        if !is_valid_name(&lane.name) {
            return Err(SpecError::InvalidLaneName(lane.name.clone()));
        }
        if !lane_names.insert(lane.name.as_str()) {
            return Err(SpecError::DuplicateLaneName(lane.name.clone()));
        }
    }

    // Task names per lane, for cross-lane reference checks.
    let tasks_by_lane: HashMap<&str, HashSet<&str>> = lanes
        .iter()
        .map(|l| {
            (
                l.name.as_str(),
                l.tasks.iter().map(|t| t.name.as_str()).collect(),
            )
        })
        .collect();

    for lane in lanes {
        let mut seen = HashSet::new();
        for task in &lane.tasks {
            if !is_valid_name(&task.name) {
                return Err(SpecError::InvalidTaskName {
                    lane: lane.name.clone(),
                    task: task.name.clone(),
                });
            }
            if !seen.insert(task.name.as_str()) {
                return Err(SpecError::DuplicateTaskName {
                    lane: lane.name.clone(),
                    task: task.name.clone(),
                });
            }
            if task.prompt.trim().is_empty() {
                return Err(SpecError::EmptyPrompt {
                    lane: lane.name.clone(),
                    task: task.name.clone(),
                });
            }

            for dep in &task.depends_on {
                let Some((dep_lane, dep_task)) = parse_task_dependency(dep) else {
                    return Err(SpecError::MalformedTaskDependency {
                        lane: lane.name.clone(),
                        task: task.name.clone(),
                        dependency: dep.clone(),
                    });
                };
                if dep_lane == lane.name {
                    return Err(SpecError::SelfLaneTaskDependency {
                        lane: lane.name.clone(),
                        task: task.name.clone(),
                    });
                }
                let known = tasks_by_lane
                    .get(dep_lane)
                    .map(|tasks| dep_task.is_empty() || tasks.contains(dep_task))
                    .unwrap_or(false);
                if !known {
                    return Err(SpecError::UnknownTaskDependency {
                        lane: lane.name.clone(),
                        task: task.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        for dep in &lane.depends_on {
            if !lane_names.contains(dep.as_str()) {
                return Err(SpecError::UnknownDependency {
                    lane: lane.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    check_for_cycles(lanes)
}

/// Split a `lane:task` dependency. A bare `lane` maps to an empty task.
pub fn parse_task_dependency(dep: &str) -> Option<(&str, &str)> {
    match dep.split_once(':') {
        Some((lane, task)) if !lane.is_empty() && !task.is_empty() => Some((lane, task)),
        Some(_) => None,
        None if !dep.is_empty() => Some((dep, "")),
        None => None,
    }
}

/// Detect cycles in the lane dependency graph using Kahn's algorithm.
fn check_for_cycles(lanes: &[Lane]) -> Result<(), SpecError> {
    let lane_names: Vec<&str> = lanes.iter().map(|l| l.name.as_str()).collect();
    let name_to_idx: HashMap<&str, usize> = lane_names
        .iter()
        .enumerate()
        .map(|(i, name)| (*name, i))
        .collect();

    let n = lane_names.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for lane in lanes {
        let lane_idx = name_to_idx[lane.name.as_str()];
        for dep in &lane.depends_on {
            let dep_idx = name_to_idx[dep.as_str()];
            // Edge: dep -> lane (dep must complete before lane).
            adj[dep_idx].push(lane_idx);
            in_degree[lane_idx] += 1;
        }
    }

    let mut queue: VecDeque<usize> = VecDeque::new();
    for (i, deg) in in_degree.iter().enumerate() {
        if *deg == 0 {
            queue.push_back(i);
        }
    }

    let mut sorted_count = 0usize;
    while let Some(node) = queue.pop_front() {
        sorted_count += 1;
        for &neighbor in &adj[node] {
            in_degree[neighbor] -= 1;
            if in_degree[neighbor] == 0 {
                queue.push_back(neighbor);
            }
        }
    }

    if sorted_count != n {
        let cycle_lanes: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| lane_names[i])
            .collect();
        return Err(SpecError::CycleDetected(cycle_lanes.join(", ")));
    }

    Ok(())
}

/// Lanes in a stable topological order (dependencies first; ties broken by
/// name). Used by the flow integrator.
pub fn topological_order(lanes: &[Lane]) -> Vec<String> {
    let name_to_idx: HashMap<&str, usize> = lanes
        .iter()
        .enumerate()
        .map(|(i, l)| (l.name.as_str(), i))
        .collect();

    let n = lanes.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];
    for (i, lane) in lanes.iter().enumerate() {
        for dep in &lane.depends_on {
            if let Some(&dep_idx) = name_to_idx.get(dep.as_str()) {
                adj[dep_idx].push(i);
                in_degree[i] += 1;
            }
        }
    }

    let mut ready: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut out = Vec::with_capacity(n);
    while !ready.is_empty() {
        ready.sort_by(|&a, &b| lanes[a].name.cmp(&lanes[b].name));
        let node = ready.remove(0);
        out.push(lanes[node].name.clone());
        for &next in &adj[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(next);
            }
        }
    }
    out
}
