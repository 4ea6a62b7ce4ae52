//! Client for the remote investigation dispatcher.
//!
//! The dispatcher queues a read-only diagnostic job, exposes a run status,
//! and streams the agent's execution log. This client enqueues a job, polls
//! until a terminal queue state, tails the log, and extracts the agent's
//! final conclusion so it can be attached to an alert thread.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Header carrying the dispatcher bearer token.
pub const DISPATCH_TOKEN_HEADER: &str = "X-PitchAI-Dispatch-Token";

const LOG_TAIL_CAP_BYTES: u64 = 5_000_000;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected dispatch response: {0:?}")]
    UnexpectedResponse(String),

    #[error("timed out waiting for dispatcher run to finish (bundle={bundle})")]
    Timeout { bundle: String },
}

/// Connection settings plus polling limits.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub base_url: String,
    pub token: String,
    pub model: Option<String>,
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub log_tail_bytes: u64,
}

impl DispatchConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            model: None,
            poll_interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(30 * 60),
            log_tail_bytes: 250_000,
        }
    }
}

/// A queued job: the dispatcher-side bundle id plus the runner note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub bundle: String,
    pub runner: String,
}

/// Status document returned by `/runs/{bundle}/status`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunStatus {
    #[serde(default)]
    pub queue_state: Option<String>,
    #[serde(default)]
    pub runner_status: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub live_status: Option<String>,
    #[serde(default)]
    pub record: serde_json::Value,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.queue_state.as_deref(),
            Some("processed" | "failed" | "runner_error")
        )
    }
}

#[derive(Debug, Default, Deserialize)]
struct LogChunk {
    #[serde(default)]
    exists: bool,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    content: String,
}

/// Parse the plain-text enqueue response.
///
/// The wire shape is `queued:<bundle>:runner:<rest>` where `<rest>` may
/// itself contain further `:`-delimited detail (`error:oops:details`).
pub fn parse_dispatch_response(text: &str) -> Result<QueuedJob, DispatchError> {
    let s = text.trim();
    let rest = s
        .strip_prefix("queued:")
        .ok_or_else(|| DispatchError::UnexpectedResponse(s.to_owned()))?;
    let (bundle, runner) = rest
        .split_once(":runner:")
        .ok_or_else(|| DispatchError::UnexpectedResponse(s.to_owned()))?;
    let bundle = bundle.trim();
    if bundle.is_empty() {
        return Err(DispatchError::UnexpectedResponse(s.to_owned()));
    }
    Ok(QueuedJob {
        bundle: bundle.to_owned(),
        runner: runner.trim().to_owned(),
    })
}

/// Walk the execution log backwards and return the text of the last
/// completed or updated `agent_message` item.
#[must_use]
pub fn extract_last_agent_message(log_text: &str) -> Option<String> {
    for line in log_text.lines().rev() {
        let s = line.trim();
        if !s.starts_with('{') {
            continue;
        }
        let Ok(obj) = serde_json::from_str::<serde_json::Value>(s) else {
            continue;
        };
        if !matches!(
            obj.get("type").and_then(serde_json::Value::as_str),
            Some("item.completed" | "item.updated")
        ) {
            continue;
        }
        let Some(item) = obj.get("item") else { continue };
        if item.get("type").and_then(serde_json::Value::as_str) != Some("agent_message") {
            continue;
        }
        if let Some(text) = item.get("text").and_then(serde_json::Value::as_str) {
            if !text.trim().is_empty() {
                return Some(text.to_owned());
            }
        }
    }
    None
}

/// Symmetric helper: the last terminal error string in the log tail.
///
/// Accepts top-level `{"type": "error", "message": ...}` events and
/// `turn.failed` events carrying `error.message`.
#[must_use]
pub fn extract_last_error_message(log_text: &str) -> Option<String> {
    for line in log_text.lines().rev() {
        let s = line.trim();
        if !s.starts_with('{') {
            continue;
        }
        let Ok(obj) = serde_json::from_str::<serde_json::Value>(s) else {
            continue;
        };
        let msg = match obj.get("type").and_then(serde_json::Value::as_str) {
            Some("error") => obj.get("message").and_then(serde_json::Value::as_str),
            Some("turn.failed") => obj
                .pointer("/error/message")
                .and_then(serde_json::Value::as_str),
            _ => None,
        };
        if let Some(msg) = msg {
            if !msg.trim().is_empty() {
                return Some(msg.to_owned());
            }
        }
    }
    None
}

/// Stable link to the dispatcher UI page for a bundle.
#[must_use]
pub fn run_ui_url(base_url: &str, bundle: &str) -> String {
    format!("{}/ui/runs/{bundle}", base_url.trim_end_matches('/'))
}

/// Dispatcher HTTP client. Safe to call from the monitor cycle task; every
/// operation is bounded by the configured timeouts.
#[derive(Debug, Clone)]
pub struct DispatchClient {
    http: reqwest::Client,
    config: DispatchConfig,
}

impl DispatchClient {
    #[must_use]
    pub fn new(http: reqwest::Client, config: DispatchConfig) -> Self {
        Self { http, config }
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    /// Enqueue an investigation job.
    pub async fn dispatch(
        &self,
        prompt: &str,
        config_toml: &str,
        state_key: Option<&str>,
        pre_commands: Option<&[String]>,
    ) -> Result<QueuedJob, DispatchError> {
        let mut payload = serde_json::json!({
            "prompt": prompt,
            "config_toml": config_toml,
        });
        if let Some(model) = &self.config.model {
            payload["model"] = serde_json::Value::String(model.clone());
        }
        if let Some(key) = state_key {
            payload["state_key"] = serde_json::Value::String(key.to_owned());
        }
        if let Some(cmds) = pre_commands {
            payload["pre_commands"] = serde_json::json!(cmds);
        }

        let text = self
            .http
            .post(self.url("/dispatch"))
            .header(DISPATCH_TOKEN_HEADER, &self.config.token)
            .json(&payload)
            .timeout(Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_dispatch_response(&text)
    }

    async fn run_status(&self, bundle: &str) -> Result<reqwest::Response, DispatchError> {
        Ok(self
            .http
            .get(self.url(&format!("/runs/{bundle}/status")))
            .header(DISPATCH_TOKEN_HEADER, &self.config.token)
            .timeout(Duration::from_secs(20))
            .send()
            .await?)
    }

    async fn run_record(&self, bundle: &str) -> Result<RunStatus, DispatchError> {
        let record: serde_json::Value = self
            .http
            .get(self.url(&format!("/runs/{bundle}/record")))
            .header(DISPATCH_TOKEN_HEADER, &self.config.token)
            .timeout(Duration::from_secs(20))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(RunStatus {
            queue_state: record
                .get("status")
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned),
            record,
            ..RunStatus::default()
        })
    }

    /// Poll the run until it reaches a terminal queue state
    /// (`processed | failed | runner_error`) or `max_wait` elapses.
    ///
    /// Transient 5xx responses are tolerated; a 404 falls back to the
    /// `/record` endpoint for older dispatcher versions.
    pub async fn wait_for_terminal_status(&self, bundle: &str) -> Result<RunStatus, DispatchError> {
        let deadline = Instant::now() + self.config.max_wait.max(Duration::from_secs(1));

        loop {
            let status = match self.run_status(bundle).await {
                Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                    Some(self.run_record(bundle).await?)
                }
                Ok(resp) if resp.status().is_server_error() => {
                    debug!(bundle, status = %resp.status(), "transient dispatcher status error");
                    None
                }
                Ok(resp) => Some(resp.error_for_status()?.json::<RunStatus>().await?),
                Err(e) => return Err(e),
            };

            if let Some(status) = status {
                if status.is_terminal() {
                    return Ok(status);
                }
            }
            if Instant::now() >= deadline {
                return Err(DispatchError::Timeout {
                    bundle: bundle.to_owned(),
                });
            }
            tokio::time::sleep(self.config.poll_interval.max(Duration::from_millis(500))).await;
        }
    }

    async fn log_chunk(&self, bundle: &str, offset: u64, max_bytes: u64) -> Result<LogChunk, DispatchError> {
        Ok(self
            .http
            .get(self.url(&format!("/runs/{bundle}/log")))
            .header(DISPATCH_TOKEN_HEADER, &self.config.token)
            .query(&[("offset", offset), ("max_bytes", max_bytes)])
            .timeout(Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    /// Fetch the last `max_bytes` of the execution log: a one-byte probe
    /// discovers the size, then a single ranged read fetches the tail.
    /// Empty or missing logs yield an empty string.
    pub async fn log_tail(&self, bundle: &str, max_bytes: u64) -> Result<String, DispatchError> {
        let head = self.log_chunk(bundle, 0, 1).await?;
        if !head.exists {
            return Ok(String::new());
        }
        let max_bytes = max_bytes.clamp(1, LOG_TAIL_CAP_BYTES);
        let offset = head.size.saturating_sub(max_bytes);
        let tail = self.log_chunk(bundle, offset, max_bytes).await?;
        Ok(tail.content)
    }

    /// Convenience: tail the log and extract the agent's last message.
    pub async fn last_agent_message(&self, bundle: &str) -> Result<Option<String>, DispatchError> {
        let tail = self.log_tail(bundle, self.config.log_tail_bytes).await?;
        Ok(extract_last_agent_message(&tail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn parses_plain_runner_note() {
        let job = parse_dispatch_response("queued:20250101_abcdef:runner:already_running\n").unwrap();
        assert_eq!(job.bundle, "20250101_abcdef");
        assert_eq!(job.runner, "already_running");
    }

    #[test]
    fn runner_note_keeps_colon_suffixes() {
        let job = parse_dispatch_response("queued:b1:runner:error:oops:details").unwrap();
        assert_eq!(job.bundle, "b1");
        assert_eq!(job.runner, "error:oops:details");
    }

    #[test]
    fn rejects_foreign_prefixes() {
        assert!(parse_dispatch_response("ready:b1:runner:r").is_err());
        assert!(parse_dispatch_response("queued:b1").is_err());
        assert!(parse_dispatch_response("queued::runner:r").is_err());
    }

    #[test]
    fn extracts_last_agent_message() {
        let log = [
            r#"{"type":"item.completed","item":{"type":"agent_message","text":"first"}}"#,
            r#"{"type":"item.completed","item":{"type":"command","text":"ls"}}"#,
            r#"{"type":"item.updated","item":{"type":"agent_message","text":"final verdict"}}"#,
            "not json",
        ]
        .join("\n");
        assert_eq!(extract_last_agent_message(&log).as_deref(), Some("final verdict"));
    }

    #[test]
    fn agent_message_stable_under_non_agent_appends() {
        let base = r#"{"type":"item.completed","item":{"type":"agent_message","text":"verdict"}}"#;
        let extended = format!(
            "{base}\n{}\n{}",
            r#"{"type":"item.completed","item":{"type":"command","text":"ls"}}"#,
            r#"{"type":"heartbeat"}"#
        );
        assert_eq!(
            extract_last_agent_message(base),
            extract_last_agent_message(&extended)
        );
    }

    #[test]
    fn extracts_error_messages() {
        let log = [
            r#"{"type":"item.completed","item":{"type":"agent_message","text":"hi"}}"#,
            r#"{"type":"turn.failed","error":{"message":"sandbox denied"}}"#,
        ]
        .join("\n");
        assert_eq!(extract_last_error_message(&log).as_deref(), Some("sandbox denied"));
        assert_eq!(extract_last_error_message("{}"), None);
    }

    #[test]
    fn ui_url_shape() {
        assert_eq!(
            run_ui_url("https://dispatch.example/", "b1"),
            "https://dispatch.example/ui/runs/b1"
        );
    }

    #[tokio::test]
    async fn dispatch_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/dispatch"))
            .respond_with(ResponseTemplate::new(200).set_body_string("queued:b42:runner:fresh"))
            .mount(&server)
            .await;

        let client = DispatchClient::new(
            reqwest::Client::new(),
            DispatchConfig::new(server.uri(), "tok"),
        );
        let job = client
            .dispatch("investigate", "approval_policy = \"never\"", Some("key"), None)
            .await
            .unwrap();
        assert_eq!(job.bundle, "b42");
    }

    #[tokio::test]
    async fn polling_falls_back_to_record_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/runs/b1/status"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/runs/b1/record"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "processed",
            })))
            .mount(&server)
            .await;

        let client = DispatchClient::new(
            reqwest::Client::new(),
            DispatchConfig::new(server.uri(), "tok"),
        );
        let status = client.wait_for_terminal_status("b1").await.unwrap();
        assert_eq!(status.queue_state.as_deref(), Some("processed"));
    }

    #[tokio::test]
    async fn log_tail_fetches_ranged_suffix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/runs/b1/log"))
            .and(query_param("offset", "0"))
            .and(query_param("max_bytes", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "exists": true, "size": 1000, "content": "x",
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/runs/b1/log"))
            .and(query_param("offset", "900"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "exists": true, "size": 1000, "content": "tail-bytes",
            })))
            .mount(&server)
            .await;

        let client = DispatchClient::new(
            reqwest::Client::new(),
            DispatchConfig::new(server.uri(), "tok"),
        );
        let tail = client.log_tail("b1", 100).await.unwrap();
        assert_eq!(tail, "tail-bytes");
    }

    #[tokio::test]
    async fn empty_log_is_empty_string() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/runs/b1/log"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "exists": false,
            })))
            .mount(&server)
            .await;

        let client = DispatchClient::new(
            reqwest::Client::new(),
            DispatchConfig::new(server.uri(), "tok"),
        );
        assert_eq!(client.log_tail("b1", 100).await.unwrap(), "");
    }
}
