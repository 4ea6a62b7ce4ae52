//! HTTP client for the registry's runner protocol.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("registry request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// One leased run, as returned by `POST /api/v1/runner/claim`.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub run_id: String,
    pub test_id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub test_name: String,
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: i64,
    #[serde(default = "default_kind")]
    pub test_kind: String,
    #[serde(default)]
    pub definition: serde_json::Value,
    #[serde(default)]
    pub source_relpath: Option<String>,
}

fn default_timeout() -> i64 {
    45
}

fn default_kind() -> String {
    "stepflow".to_owned()
}

/// Final outcome posted back on completion.
#[derive(Debug, Clone, Serialize)]
pub struct RunPayload {
    pub status: String,
    pub elapsed_ms: Option<f64>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub final_url: Option<String>,
    pub title: Option<String>,
    pub artifacts: serde_json::Value,
    pub started_at_ts: f64,
    pub finished_at_ts: f64,
}

#[derive(Debug, Deserialize)]
struct ClaimResponse {
    #[serde(default)]
    jobs: Vec<Job>,
}

#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl RegistryClient {
    #[must_use]
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    /// Lease up to `max_runs` due runs.
    pub async fn claim(&self, max_runs: i64) -> Result<Vec<Job>, ClientError> {
        let response: ClaimResponse = self
            .http
            .post(self.url("/api/v1/runner/claim"))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "max_runs": max_runs }))
            .timeout(std::time::Duration::from_secs(20))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.jobs)
    }

    /// Report a run's final outcome. Always called, even for infra
    /// degradation, so the lease is released.
    pub async fn complete(&self, run_id: &str, payload: &RunPayload) -> Result<(), ClientError> {
        self.http
            .post(self.url(&format!("/api/v1/runner/runs/{run_id}/complete")))
            .bearer_auth(&self.token)
            .json(payload)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn claim_parses_jobs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/runner/claim"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true,
                "jobs": [{
                    "run_id": "r1",
                    "test_id": "t1",
                    "tenant_id": "ten1",
                    "test_name": "login",
                    "base_url": "https://app.internal.dev",
                    "timeout_seconds": 30,
                    "test_kind": "stepflow",
                    "definition": {"name": "login", "steps": []},
                }],
            })))
            .mount(&server)
            .await;

        let client = RegistryClient::new(reqwest::Client::new(), server.uri(), "tok");
        let jobs = client.claim(2).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].run_id, "r1");
        assert_eq!(jobs[0].timeout_seconds, 30);
    }

    #[tokio::test]
    async fn complete_posts_the_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/runner/runs/r1/complete"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = RegistryClient::new(reqwest::Client::new(), server.uri(), "tok");
        let payload = RunPayload {
            status: "pass".to_owned(),
            elapsed_ms: Some(120.0),
            error_kind: None,
            error_message: None,
            final_url: None,
            title: None,
            artifacts: serde_json::json!({}),
            started_at_ts: 1.0,
            finished_at_ts: 2.0,
        };
        client.complete("r1", &payload).await.unwrap();
    }
}
