//! Container health evaluation on top of the Docker client.

use std::collections::BTreeMap;

use futures::StreamExt;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::docker::DockerClient;

const INSPECT_CONCURRENCY: usize = 8;

/// Which containers to watch and how to compare restart counts.
#[derive(Debug, Clone, Default)]
pub struct ContainerHealthConfig {
    pub include_name_patterns: Vec<String>,
    pub exclude_name_patterns: Vec<String>,
    pub monitor_all: bool,
}

/// One container judged unhealthy, plus why.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerIssue {
    pub name: String,
    pub container_id: String,
    pub running: Option<bool>,
    pub status: Option<String>,
    pub restart_count: Option<i64>,
    pub restart_increase: Option<i64>,
    pub oom_killed: Option<bool>,
    pub health_status: Option<String>,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
}

fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter(|p| !p.trim().is_empty())
        .map(|p| {
            // Invalid regex falls back to a literal substring match.
            Regex::new(p).unwrap_or_else(|_| Regex::new(&regex::escape(p)).unwrap())
        })
        .collect()
}

fn matches_any(name: &str, patterns: &[Regex]) -> bool {
    patterns.iter().any(|p| p.is_match(name))
}

struct Inspection {
    issue: Option<ContainerIssue>,
    restart_count: Option<(String, i64)>,
}

fn judge_inspection(
    name: &str,
    container_id: &str,
    status: Option<&str>,
    data: &serde_json::Value,
    previous_restart_counts: &BTreeMap<String, i64>,
) -> Inspection {
    let state = data.get("State").cloned().unwrap_or_default();
    let running = state.get("Running").and_then(serde_json::Value::as_bool);
    let oom_killed = state.get("OOMKilled").and_then(serde_json::Value::as_bool);
    let exit_code = state.get("ExitCode").and_then(serde_json::Value::as_i64);
    let health_status = state
        .pointer("/Health/Status")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned);

    let restart_count = data.get("RestartCount").and_then(serde_json::Value::as_i64);
    let restart_entry = restart_count.map(|c| (container_id.to_owned(), c));

    let restart_increase = match (restart_count, previous_restart_counts.get(container_id)) {
        (Some(cur), Some(prev)) if cur != *prev => Some(cur - prev),
        _ => None,
    };

    let healthy_now = running == Some(true)
        && health_status.as_deref().is_none_or(|h| h == "healthy");

    let mut bad = false;
    if running == Some(false) {
        bad = true;
    }
    if let Some(h) = health_status.as_deref() {
        if h != "healthy" {
            bad = true;
        }
    }
    // Docker never clears OOMKilled once set; a container that is running
    // and healthy again is not flagged for the sticky bit.
    if oom_killed == Some(true) && !healthy_now {
        bad = true;
    }
    if restart_increase.is_some_and(|d| d > 0) {
        bad = true;
    }
    if running == Some(false) && exit_code.is_some_and(|c| c != 0) {
        bad = true;
    }

    let issue = bad.then(|| ContainerIssue {
        name: name.to_owned(),
        container_id: container_id.chars().take(12).collect(),
        running,
        status: status.map(str::to_owned),
        restart_count,
        restart_increase,
        oom_killed,
        health_status,
        exit_code,
        error: None,
    });

    Inspection {
        issue,
        restart_count: restart_entry,
    }
}

/// List and inspect the configured containers. Returns the issues plus the
/// current restart counts keyed by container id (stored for the next
/// cycle's comparison).
pub async fn check_container_health(
    docker: &DockerClient,
    config: &ContainerHealthConfig,
    previous_restart_counts: &BTreeMap<String, i64>,
) -> (Vec<ContainerIssue>, BTreeMap<String, i64>) {
    let include = compile_patterns(&config.include_name_patterns);
    let exclude = compile_patterns(&config.exclude_name_patterns);

    let listing = match docker.list_containers().await {
        Ok(resp) if resp.ok() && resp.data.is_array() => resp.data,
        Ok(resp) => {
            return (
                vec![ContainerIssue {
                    name: "docker".to_owned(),
                    container_id: String::new(),
                    running: None,
                    status: None,
                    restart_count: None,
                    restart_increase: None,
                    oom_killed: None,
                    health_status: None,
                    exit_code: None,
                    error: Some(format!("docker_list_failed: http_{}", resp.status)),
                }],
                BTreeMap::new(),
            );
        }
        Err(e) => {
            return (
                vec![ContainerIssue {
                    name: "docker".to_owned(),
                    container_id: String::new(),
                    running: None,
                    status: None,
                    restart_count: None,
                    restart_increase: None,
                    oom_killed: None,
                    health_status: None,
                    exit_code: None,
                    error: Some(format!("docker_list_failed: {e}")),
                }],
                BTreeMap::new(),
            );
        }
    };

    let mut targets = Vec::new();
    for entry in listing.as_array().into_iter().flatten() {
        let Some(id) = entry
            .get("Id")
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            continue;
        };
        let name = entry
            .pointer("/Names/0")
            .and_then(serde_json::Value::as_str)
            .map(|n| n.trim_start_matches('/').to_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| id.chars().take(12).collect());
        let status = entry
            .get("Status")
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned);

        if matches_any(&name, &exclude) {
            continue;
        }
        if !config.monitor_all && !matches_any(&name, &include) {
            continue;
        }
        targets.push((id.to_owned(), name, status));
    }

    let inspections: Vec<Inspection> = futures::stream::iter(targets)
        .map(|(id, name, status)| async move {
            match docker.inspect_container(&id).await {
                Ok(resp) if resp.ok() && resp.data.is_object() => judge_inspection(
                    &name,
                    &id,
                    status.as_deref(),
                    &resp.data,
                    previous_restart_counts,
                ),
                Ok(resp) => Inspection {
                    issue: Some(ContainerIssue {
                        name,
                        container_id: id.chars().take(12).collect(),
                        running: None,
                        status,
                        restart_count: None,
                        restart_increase: None,
                        oom_killed: None,
                        health_status: None,
                        exit_code: None,
                        error: Some(format!("docker_inspect_failed: http_{}", resp.status)),
                    }),
                    restart_count: None,
                },
                Err(e) => {
                    debug!(container = %name, error = %e, "inspect failed");
                    Inspection {
                        issue: Some(ContainerIssue {
                            name,
                            container_id: id.chars().take(12).collect(),
                            running: None,
                            status,
                            restart_count: None,
                            restart_increase: None,
                            oom_killed: None,
                            health_status: None,
                            exit_code: None,
                            error: Some(format!("docker_inspect_failed: {e}")),
                        }),
                        restart_count: None,
                    }
                }
            }
        })
        .buffer_unordered(INSPECT_CONCURRENCY)
        .collect()
        .await;

    let mut issues = Vec::new();
    let mut current_restart_counts = BTreeMap::new();
    for inspection in inspections {
        if let Some(issue) = inspection.issue {
            issues.push(issue);
        }
        if let Some((id, count)) = inspection.restart_count {
            current_restart_counts.insert(id, count);
        }
    }
    issues.sort_by(|a, b| a.name.cmp(&b.name));
    (issues, current_restart_counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_state() -> serde_json::Value {
        json!({
            "State": {"Running": true, "OOMKilled": false, "ExitCode": 0},
            "RestartCount": 0,
        })
    }

    #[test]
    fn healthy_running_container_is_clean() {
        let insp = judge_inspection("web", "abc123", None, &base_state(), &BTreeMap::new());
        assert!(insp.issue.is_none());
        assert_eq!(insp.restart_count, Some(("abc123".to_owned(), 0)));
    }

    #[test]
    fn stopped_container_is_flagged() {
        let data = json!({"State": {"Running": false, "ExitCode": 137}, "RestartCount": 1});
        let insp = judge_inspection("web", "abc", None, &data, &BTreeMap::new());
        let issue = insp.issue.unwrap();
        assert_eq!(issue.running, Some(false));
        assert_eq!(issue.exit_code, Some(137));
    }

    #[test]
    fn unhealthy_probe_is_flagged() {
        let data = json!({
            "State": {"Running": true, "Health": {"Status": "unhealthy"}},
            "RestartCount": 0,
        });
        let insp = judge_inspection("web", "abc", None, &data, &BTreeMap::new());
        assert_eq!(insp.issue.unwrap().health_status.as_deref(), Some("unhealthy"));
    }

    #[test]
    fn sticky_oom_on_recovered_container_is_ignored() {
        let data = json!({
            "State": {"Running": true, "OOMKilled": true, "Health": {"Status": "healthy"}},
            "RestartCount": 2,
        });
        let prev: BTreeMap<String, i64> = [("abc".to_owned(), 2)].into();
        let insp = judge_inspection("web", "abc", None, &data, &prev);
        assert!(insp.issue.is_none());
    }

    #[test]
    fn oom_on_stopped_container_is_flagged() {
        let data = json!({
            "State": {"Running": false, "OOMKilled": true, "ExitCode": 0},
            "RestartCount": 0,
        });
        let insp = judge_inspection("web", "abc", None, &data, &BTreeMap::new());
        assert_eq!(insp.issue.unwrap().oom_killed, Some(true));
    }

    #[test]
    fn restart_increase_is_flagged() {
        let data = json!({"State": {"Running": true}, "RestartCount": 3});
        let prev: BTreeMap<String, i64> = [("abc".to_owned(), 1)].into();
        let insp = judge_inspection("web", "abc", None, &data, &prev);
        assert_eq!(insp.issue.unwrap().restart_increase, Some(2));
    }

    #[test]
    fn invalid_include_pattern_falls_back_to_literal() {
        let patterns = compile_patterns(&["web(".to_owned()]);
        assert!(matches_any("my-web(-1", &patterns));
        assert!(!matches_any("db-1", &patterns));
    }
}
