use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::json;
use tower::ServiceExt;

use vigil_registry::{AppState, Settings, Store, router};

// -- Helpers --------------------------------------------------------------

struct TestApp {
    _dir: tempfile::TempDir,
    state: AppState,
}

impl TestApp {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::from_env();
        settings.db_path = dir.path().join("registry.db").to_str().unwrap().to_owned();
        settings.artifacts_dir = dir.path().join("artifacts").to_str().unwrap().to_owned();
        settings.tests_dir = dir.path().join("tests").to_str().unwrap().to_owned();
        settings.admin_token = "admin-token".to_owned();
        settings.monitor_token = "monitor-token".to_owned();
        settings.runner_token = "runner-token".to_owned();
        settings.alerts_enabled = false;
        settings.dispatch_enabled = false;
        settings.strict_base_url_policy = false;
        settings.public_base_url = String::new();

        let store = Store::connect(&settings.db_path).await.unwrap();
        let state = AppState::new(store, settings);
        Self { _dir: dir, state }
    }

    fn app(&self) -> axum::Router {
        router(self.state.clone())
    }

    async fn request(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.app().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    /// Create a tenant plus an API key, returning (tenant_id, raw token).
    async fn tenant_with_key(&self, name: &str) -> (String, String) {
        let (status, tenant) = self
            .request(
                "POST",
                "/api/v1/admin/tenants",
                Some("admin-token"),
                Some(json!({"name": name})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let tenant_id = tenant["tenant"]["id"].as_str().unwrap().to_owned();

        let (status, key) = self
            .request(
                "POST",
                "/api/v1/admin/api_keys",
                Some("admin-token"),
                Some(json!({"tenant_id": tenant_id, "name": "ci"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        (tenant_id, key["token"].as_str().unwrap().to_owned())
    }

    async fn create_stepflow_test(&self, token: &str, extra: serde_json::Value) -> String {
        let mut body = json!({
            "name": "login smoke",
            "base_url": "https://app.internal.dev",
            "definition": {
                "name": "login",
                "steps": [
                    {"type": "goto", "url": "/login"},
                    {"type": "expect_title_contains", "text": "Login"},
                ],
            },
            "jitter_seconds": 0,
        });
        if let (Some(base), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        let (status, created) = self
            .request("POST", "/api/v1/tests", Some(token), Some(body))
            .await;
        assert_eq!(status, StatusCode::OK, "{created}");
        created["test"]["id"].as_str().unwrap().to_owned()
    }
}

// -- Auth & tenancy --------------------------------------------------------

#[tokio::test]
async fn health_is_public() {
    let app = TestApp::new().await;
    let (status, body) = app.request("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));
}

#[tokio::test]
async fn admin_endpoints_reject_bad_tokens() {
    let app = TestApp::new().await;
    let (status, _) = app
        .request(
            "POST",
            "/api/v1/admin/tenants",
            Some("wrong"),
            Some(json!({"name": "x"})),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .request("POST", "/api/v1/admin/tenants", None, Some(json!({"name": "x"})))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn cross_tenant_reads_are_404() {
    let app = TestApp::new().await;
    let (_tenant_a, token_a) = app.tenant_with_key("alpha").await;
    let (_tenant_b, token_b) = app.tenant_with_key("beta").await;

    let test_id = app.create_stepflow_test(&token_a, json!({})).await;

    let (status, _) = app
        .request("GET", &format!("/api/v1/tests/{test_id}"), Some(&token_a), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app
        .request("GET", &format!("/api/v1/tests/{test_id}"), Some(&token_b), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Runs of a foreign test are invisible too.
    let (status, body) = app
        .request(
            "GET",
            &format!("/api/v1/tests/{test_id}/runs"),
            Some(&token_b),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["runs"], json!([]));
}

// -- Step-flow validation ---------------------------------------------------

#[tokio::test]
async fn create_rejects_long_fill_without_placeholder() {
    let app = TestApp::new().await;
    let (_tenant, token) = app.tenant_with_key("alpha").await;

    let (status, body) = app
        .request(
            "POST",
            "/api/v1/tests",
            Some(&token),
            Some(json!({
                "name": "bad",
                "base_url": "https://app.internal.dev",
                "definition": {
                    "name": "bad",
                    "steps": [{"type": "fill", "selector": "#a", "text": "x".repeat(600)}],
                },
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], json!("fill_text_must_use_secret_placeholder[0]"));
}

#[tokio::test]
async fn create_rejects_unknown_step_types() {
    let app = TestApp::new().await;
    let (_tenant, token) = app.tenant_with_key("alpha").await;

    let (status, body) = app
        .request(
            "POST",
            "/api/v1/tests",
            Some(&token),
            Some(json!({
                "name": "bad",
                "base_url": "https://app.internal.dev",
                "definition": {"name": "bad", "steps": [{"type": "teleport"}]},
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], json!("unknown_step_type[0]: teleport"));
}

// -- Runner protocol --------------------------------------------------------

#[tokio::test]
async fn claim_then_complete_flows_through_debounce() {
    let app = TestApp::new().await;
    let (_tenant, token) = app.tenant_with_key("alpha").await;
    let test_id = app
        .create_stepflow_test(&token, json!({"down_after_failures": 1, "up_after_successes": 2}))
        .await;

    let (status, claimed) = app
        .request(
            "POST",
            "/api/v1/runner/claim",
            Some("runner-token"),
            Some(json!({"max_runs": 5})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(claimed["jobs"].as_array().unwrap().len(), 1);
    let run_id = claimed["jobs"][0]["run_id"].as_str().unwrap().to_owned();
    assert_eq!(claimed["jobs"][0]["test_id"], json!(test_id));

    let (status, completed) = app
        .request(
            "POST",
            &format!("/api/v1/runner/runs/{run_id}/complete"),
            Some("runner-token"),
            Some(json!({
                "status": "fail",
                "elapsed_ms": 800.0,
                "error_kind": "assertion_failed",
                "error_message": "title_missing_substring",
                "artifacts": {},
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(completed["outcome"]["alerted_down"], json!(true));
    assert_eq!(completed["outcome"]["effective_ok"], json!(false));

    // An infra-degraded follow-up must not flip the test back up.
    let (_, _) = app
        .request(
            "POST",
            &format!("/api/v1/tests/{test_id}/run"),
            Some(&token),
            None,
        )
        .await;
    let (_, claimed) = app
        .request(
            "POST",
            "/api/v1/runner/claim",
            Some("runner-token"),
            Some(json!({"max_runs": 1})),
        )
        .await;
    let run_id2 = claimed["jobs"][0]["run_id"].as_str().unwrap().to_owned();
    let (status, completed) = app
        .request(
            "POST",
            &format!("/api/v1/runner/runs/{run_id2}/complete"),
            Some("runner-token"),
            Some(json!({"status": "infra_degraded", "error_kind": "timeout"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(completed["outcome"]["recovered_up"], json!(false));
    assert_eq!(completed["outcome"]["effective_ok"], json!(false));
}

#[tokio::test]
async fn runner_complete_rejects_unknown_status() {
    let app = TestApp::new().await;
    let (status, body) = app
        .request(
            "POST",
            "/api/v1/runner/runs/some-run/complete",
            Some("runner-token"),
            Some(json!({"status": "exploded"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], json!("invalid_status"));
}

#[tokio::test]
async fn runner_endpoints_require_runner_token() {
    let app = TestApp::new().await;
    let (status, _) = app
        .request(
            "POST",
            "/api/v1/runner/claim",
            Some("admin-token"),
            Some(json!({"max_runs": 1})),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

// -- Status summary ----------------------------------------------------------

#[tokio::test]
async fn status_summary_scopes_by_token() {
    let app = TestApp::new().await;
    let (tenant_a, token_a) = app.tenant_with_key("alpha").await;
    let (_tenant_b, token_b) = app.tenant_with_key("beta").await;
    app.create_stepflow_test(&token_a, json!({})).await;

    // Monitor token sees everything.
    let (status, body) = app
        .request("GET", "/api/v1/status/summary", Some("monitor-token"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_tests"], json!(1));

    // Tenant B sees its own (empty) subset.
    let (status, body) = app
        .request("GET", "/api/v1/status/summary", Some(&token_b), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_tests"], json!(0));

    // Tenant A sees exactly its test.
    let (_, body) = app
        .request("GET", "/api/v1/status/summary", Some(&token_a), None)
        .await;
    assert_eq!(body["tests"][0]["tenant_id"], json!(tenant_a));

    let (status, _) = app
        .request("GET", "/api/v1/status/summary", Some("nonsense"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// -- Artifacts ----------------------------------------------------------------

#[tokio::test]
async fn artifact_download_is_confined_to_the_run_subtree() {
    let app = TestApp::new().await;
    let (tenant_id, token) = app.tenant_with_key("alpha").await;
    let test_id = app.create_stepflow_test(&token, json!({})).await;

    let (_, claimed) = app
        .request(
            "POST",
            "/api/v1/runner/claim",
            Some("runner-token"),
            Some(json!({"max_runs": 1})),
        )
        .await;
    let run_id = claimed["jobs"][0]["run_id"].as_str().unwrap().to_owned();

    // Place one legitimate artifact plus a secret outside the run tree.
    let run_dir = std::path::Path::new(&app.state.settings.artifacts_dir)
        .join(&tenant_id)
        .join(&test_id)
        .join(&run_id);
    std::fs::create_dir_all(&run_dir).unwrap();
    std::fs::write(run_dir.join("failure.png"), b"png-bytes").unwrap();
    std::fs::write(
        std::path::Path::new(&app.state.settings.artifacts_dir).join("secret.txt"),
        b"top secret",
    )
    .unwrap();

    let (status, _) = app
        .request(
            "GET",
            &format!("/api/v1/runs/{run_id}/artifacts/failure.png"),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    for escape in ["..%2F..%2F..%2Fsecret.txt", "..", "a%2Fb"] {
        let (status, _) = app
            .request(
                "GET",
                &format!("/api/v1/runs/{run_id}/artifacts/{escape}"),
                Some(&token),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "escape {escape}");
    }

    let (status, _) = app
        .request(
            "GET",
            &format!("/api/v1/runs/{run_id}/artifacts/absent.png"),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// -- Disable semantics --------------------------------------------------------

#[tokio::test]
async fn disable_until_future_skips_scheduling_only() {
    let app = TestApp::new().await;
    let (_tenant, token) = app.tenant_with_key("alpha").await;
    let test_id = app.create_stepflow_test(&token, json!({})).await;

    let until = vigil_core::time::now_ts() + 3_600.0;
    let (status, _) = app
        .request(
            "POST",
            &format!("/api/v1/tests/{test_id}/disable"),
            Some(&token),
            Some(json!({"reason": "maintenance", "until": until})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = app
        .request("GET", &format!("/api/v1/tests/{test_id}"), Some(&token), None)
        .await;
    assert_eq!(body["test"]["enabled"], json!(true));

    let (_, claimed) = app
        .request(
            "POST",
            "/api/v1/runner/claim",
            Some("runner-token"),
            Some(json!({"max_runs": 5})),
        )
        .await;
    assert_eq!(claimed["jobs"], json!([]));

    let (status, _) = app
        .request(
            "POST",
            &format!("/api/v1/tests/{test_id}/enable"),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (_, claimed) = app
        .request(
            "POST",
            "/api/v1/runner/claim",
            Some("runner-token"),
            Some(json!({"max_runs": 5})),
        )
        .await;
    assert_eq!(claimed["jobs"].as_array().unwrap().len(), 1);
}

// -- Patch ---------------------------------------------------------------------

#[tokio::test]
async fn patch_validates_definition_and_base_url() {
    let app = TestApp::new().await;
    let (_tenant, token) = app.tenant_with_key("alpha").await;
    let test_id = app.create_stepflow_test(&token, json!({})).await;

    let (status, body) = app
        .request(
            "PATCH",
            &format!("/api/v1/tests/{test_id}"),
            Some(&token),
            Some(json!({"interval_seconds": 120})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["test"]["interval_seconds"], json!(120));

    let (status, body) = app
        .request(
            "PATCH",
            &format!("/api/v1/tests/{test_id}"),
            Some(&token),
            Some(json!({"definition": {"name": "x", "steps": [{"type": "warp"}]}})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], json!("unknown_step_type[0]: warp"));

    let (status, _) = app
        .request(
            "PATCH",
            &format!("/api/v1/tests/{test_id}"),
            Some(&token),
            Some(json!({"base_url": "ftp://nope"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
