//! Parsing of the agent CLI's output.
//!
//! The agent prints line-delimited JSON; the only line the engine depends
//! on is the final object with `type = "result"`. Everything else is
//! captured for the terminal log and the stall detector but never
//! interpreted.
//!
//! The dependency-request contract has two forms: a JSON file dropped in
//! the worktree's internal directory, and a `DEPENDENCY_CHANGE_REQUIRED`
//! text marker followed by a JSON block. The file wins when both appear.

use std::path::Path;

use crate::config::INTERNAL_DIR;
use crate::model::DependencyRequest;

/// The final structured result line of one agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalResult {
    pub is_error: bool,
    pub session_id: Option<String>,
    pub result_text: String,
}

/// Scan captured stdout from the end for a line that is a JSON object with
/// `type = "result"`.
pub fn parse_final_result(stdout: &str) -> Option<FinalResult> {
    for line in stdout.lines().rev() {
        let trimmed = line.trim();
        if !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
            continue;
        };
        if value.get("type").and_then(|t| t.as_str()) != Some("result") {
            continue;
        }
        return Some(FinalResult {
            is_error: value.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false),
            session_id: value
                .get("session_id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            result_text: value
                .get("result")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        });
    }
    None
}

/// Marker the agent prints when it wants an external dependency change.
pub const DEPENDENCY_MARKER: &str = "DEPENDENCY_CHANGE_REQUIRED";

/// Extract a dependency request from result text: the marker followed
/// (possibly across lines) by the first balanced `{...}` JSON block.
pub fn parse_marker_request(text: &str) -> Option<DependencyRequest> {
    let marker_pos = text.find(DEPENDENCY_MARKER)?;
    let after = &text[marker_pos + DEPENDENCY_MARKER.len()..];
    let open = after.find('{')?;
    let block = balanced_json_block(&after[open..])?;
    serde_json::from_str(block).ok()
}

/// The shortest prefix of `s` (which starts with `{`) that is a balanced
/// JSON object, tracking strings and escapes.
fn balanced_json_block(s: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Read (without consuming) the dependency-request file from a worktree.
pub fn read_request_file(worktree_dir: &Path) -> Option<DependencyRequest> {
    let path = worktree_dir.join(INTERNAL_DIR).join("dependency-request.json");
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Delete a stale dependency-request file, best-effort.
pub fn clear_request_file(worktree_dir: &Path) {
    let path = worktree_dir.join(INTERNAL_DIR).join("dependency-request.json");
    let _ = std::fs::remove_file(path);
}

/// The file-based request wins over the text marker when both are present.
pub fn extract_dependency_request(
    worktree_dir: &Path,
    result_text: &str,
) -> Option<DependencyRequest> {
    read_request_file(worktree_dir).or_else(|| parse_marker_request(result_text))
}

/// Classify stderr/result text as a transient failure worth retrying.
pub fn is_transient_error(text: &str) -> bool {
    const MARKERS: &[&str] = &[
        "timed out",
        "timeout",
        "rate limit",
        "429",
        "network",
        "econnreset",
        "econnrefused",
        "etimedout",
        "temporarily unavailable",
        "socket hang up",
        "503",
    ];
    let lower = text.to_lowercase();
    MARKERS.iter().any(|m| lower.contains(m))
}

/// Classify stderr/result text as an authentication failure (never
/// retried).
pub fn is_auth_error(text: &str) -> bool {
    const MARKERS: &[&str] = &[
        "unauthorized",
        "authentication",
        "not logged in",
        "login required",
        "invalid api key",
        "401",
        "403",
    ];
    let lower = text.to_lowercase();
    MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn final_result_found_from_end() {
        let stdout = "\
{\"type\":\"assistant\",\"message\":\"working\"}
plain progress line
{\"type\":\"result\",\"is_error\":false,\"session_id\":\"abc\",\"result\":\"all done\"}
";
        let result = parse_final_result(stdout).unwrap();
        assert!(!result.is_error);
        assert_eq!(result.session_id.as_deref(), Some("abc"));
        assert_eq!(result.result_text, "all done");
    }

    #[test]
    fn final_result_prefers_last_result_line() {
        let stdout = "\
{\"type\":\"result\",\"is_error\":true,\"result\":\"first\"}
{\"type\":\"result\",\"is_error\":false,\"result\":\"second\"}
";
        let result = parse_final_result(stdout).unwrap();
        assert_eq!(result.result_text, "second");
        assert!(!result.is_error);
    }

    #[test]
    fn no_result_line_is_none() {
        assert!(parse_final_result("hello\nworld\n").is_none());
        assert!(parse_final_result("{\"type\":\"assistant\"}\n").is_none());
        assert!(parse_final_result("{broken json}\n").is_none());
    }

    #[test]
    fn marker_request_parses_inline_block() {
        let text = "I cannot proceed.\nDEPENDENCY_CHANGE_REQUIRED {\"reason\":\"need x\",\"commands\":[\"add x\"]}";
        let req = parse_marker_request(text).unwrap();
        assert_eq!(req.reason, "need x");
        assert_eq!(req.commands, vec!["add x".to_string()]);
    }

    #[test]
    fn marker_request_spans_lines_and_nested_braces() {
        let text = "DEPENDENCY_CHANGE_REQUIRED\nsome prose\n{\n  \"reason\": \"{braces} in string\",\n  \"commands\": [\"npm i x\"],\n  \"notes\": \"because\"\n}\ntrailing";
        let req = parse_marker_request(text).unwrap();
        assert_eq!(req.reason, "{braces} in string");
        assert_eq!(req.notes.as_deref(), Some("because"));
    }

    #[test]
    fn marker_without_json_is_none() {
        assert!(parse_marker_request("DEPENDENCY_CHANGE_REQUIRED but no block").is_none());
        assert!(parse_marker_request("no marker at all {\"reason\":\"x\",\"commands\":[]}").is_none());
    }

    #[test]
    fn file_takes_priority_over_marker() {
        let dir = TempDir::new().unwrap();
        let internal = dir.path().join(INTERNAL_DIR);
        std::fs::create_dir_all(&internal).unwrap();
        std::fs::write(
            internal.join("dependency-request.json"),
            r#"{"reason":"from file","commands":["file-cmd"]}"#,
        )
        .unwrap();

        let text = "DEPENDENCY_CHANGE_REQUIRED {\"reason\":\"from marker\",\"commands\":[]}";
        let req = extract_dependency_request(dir.path(), text).unwrap();
        assert_eq!(req.reason, "from file");

        clear_request_file(dir.path());
        let req = extract_dependency_request(dir.path(), text).unwrap();
        assert_eq!(req.reason, "from marker");
    }

    #[test]
    fn transient_and_auth_classification() {
        assert!(is_transient_error("Error: request timed out"));
        assert!(is_transient_error("HTTP 429 rate limit exceeded"));
        assert!(!is_transient_error("syntax error in prompt"));

        assert!(is_auth_error("401 Unauthorized"));
        assert!(is_auth_error("you are not logged in"));
        assert!(!is_auth_error("network unreachable"));
    }
}
