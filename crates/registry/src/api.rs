//! REST handlers.

use axum::Json;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;

use vigil_core::time::parse_until_ts;

use crate::alerts;
use crate::auth;
use crate::error::RegistryError;
use crate::stepflow;
use crate::store::{NewTest, RunCompletion, TestPatch};
use crate::AppState;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "ts": vigil_core::time::now_ts() }))
}

// ---- admin ----------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateTenantRequest {
    pub name: String,
}

pub async fn create_tenant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateTenantRequest>,
) -> Result<Json<serde_json::Value>, RegistryError> {
    auth::require_admin(&state.settings, &headers)?;
    if body.name.trim().is_empty() {
        return Err(RegistryError::BadRequest("missing_name".to_owned()));
    }
    let tenant = state.store.create_tenant(&body.name).await?;
    Ok(Json(json!({ "ok": true, "tenant": tenant })))
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub tenant_id: String,
    pub name: String,
}

pub async fn create_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateApiKeyRequest>,
) -> Result<Json<serde_json::Value>, RegistryError> {
    auth::require_admin(&state.settings, &headers)?;

    // The raw token is returned exactly once; only its hash is stored.
    let mut raw = [0_u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    let token = hex::encode(raw);
    let record = state
        .store
        .create_api_key(&body.tenant_id, &body.name, &auth::hash_token(&token))
        .await?;
    Ok(Json(json!({ "ok": true, "api_key": record, "token": token })))
}

// ---- tenant tests ----------------------------------------------------------

fn default_interval() -> i64 {
    300
}

fn default_timeout() -> i64 {
    45
}

fn default_jitter() -> i64 {
    30
}

fn default_streak() -> i64 {
    2
}

#[derive(Debug, Deserialize)]
pub struct CreateTestRequest {
    pub name: String,
    pub base_url: String,
    pub definition: serde_json::Value,
    #[serde(default = "default_interval")]
    pub interval_seconds: i64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: i64,
    #[serde(default = "default_jitter")]
    pub jitter_seconds: i64,
    #[serde(default = "default_streak")]
    pub down_after_failures: i64,
    #[serde(default = "default_streak")]
    pub up_after_successes: i64,
    #[serde(default)]
    pub notify_on_recovery: bool,
    #[serde(default)]
    pub dispatch_on_failure: bool,
}

pub async fn create_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateTestRequest>,
) -> Result<Json<serde_json::Value>, RegistryError> {
    let tenant = auth::require_tenant(&state.store, &headers).await?;
    let base_url = stepflow::validate_base_url(&body.base_url)?;
    let flow = stepflow::validate_flow(&body.definition)?;

    let mut new = NewTest::stepflow(
        &tenant.tenant_id,
        &body.name,
        &base_url,
        serde_json::to_value(&flow).unwrap_or_default(),
    );
    new.interval_seconds = body.interval_seconds;
    new.timeout_seconds = body.timeout_seconds;
    new.jitter_seconds = body.jitter_seconds;
    new.down_after_failures = body.down_after_failures;
    new.up_after_successes = body.up_after_successes;
    new.notify_on_recovery = body.notify_on_recovery;
    new.dispatch_on_failure = body.dispatch_on_failure;

    let test = state.store.insert_test(&new).await?;
    Ok(Json(json!({ "ok": true, "test": test })))
}

const ALLOWED_UPLOAD_KINDS: [&str; 3] = ["stepflow", "playwright_python", "puppeteer_js"];

/// Multipart upload of a test: a step-flow definition (JSON/YAML) or a
/// code-based test stored on disk and executed in a sandboxed child.
pub async fn upload_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, RegistryError> {
    let tenant = auth::require_tenant(&state.store, &headers).await?;

    let mut name = String::new();
    let mut base_url = String::new();
    let mut test_kind = "stepflow".to_owned();
    let mut interval_seconds = default_interval();
    let mut file_bytes: Vec<u8> = Vec::new();
    let mut file_name = String::new();
    let mut file_content_type: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RegistryError::BadRequest(format!("invalid_multipart: {e}")))?
    {
        let field_name = field.name().unwrap_or_default().to_owned();
        match field_name.as_str() {
            "name" => name = field.text().await.unwrap_or_default().trim().to_owned(),
            "base_url" => base_url = field.text().await.unwrap_or_default().trim().to_owned(),
            "test_kind" => {
                test_kind = field
                    .text()
                    .await
                    .unwrap_or_default()
                    .trim()
                    .to_lowercase();
            }
            "interval_seconds" => {
                interval_seconds = field
                    .text()
                    .await
                    .unwrap_or_default()
                    .trim()
                    .parse()
                    .unwrap_or(default_interval());
            }
            "file" => {
                file_name = field.file_name().unwrap_or_default().to_owned();
                file_content_type = field.content_type().map(str::to_owned);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| RegistryError::BadRequest(format!("upload_read_failed: {e}")))?;
                if bytes.len() as u64 > state.settings.max_upload_bytes {
                    return Err(RegistryError::BadRequest("upload_too_large".to_owned()));
                }
                file_bytes = bytes.to_vec();
            }
            _ => {}
        }
    }

    if file_bytes.is_empty() {
        return Err(RegistryError::BadRequest("missing_file".to_owned()));
    }
    if !ALLOWED_UPLOAD_KINDS.contains(&test_kind.as_str()) {
        return Err(RegistryError::BadRequest(format!("invalid_test_kind: {test_kind}")));
    }
    let base_url = stepflow::validate_base_url(&base_url)?;
    stepflow::enforce_base_url_policy(&state.settings, &state.monitored_domains, &base_url)?;

    if test_kind == "stepflow" {
        let raw = stepflow::parse_definition_bytes(&file_bytes, file_content_type.as_deref())?;
        let flow = stepflow::validate_flow(&raw)?;
        let display_name = if name.is_empty() { flow.name.clone() } else { name };
        let new = NewTest {
            interval_seconds,
            ..NewTest::stepflow(
                &tenant.tenant_id,
                &display_name,
                &base_url,
                serde_json::to_value(&flow).unwrap_or_default(),
            )
        };
        let test = state.store.insert_test(&new).await?;
        return Ok(Json(json!({ "ok": true, "test": test })));
    }

    // Code-based test: persist the source under the tenant's tree.
    let display_name = if name.is_empty() { file_name.clone() } else { name };
    if display_name.is_empty() {
        return Err(RegistryError::BadRequest("missing_name".to_owned()));
    }
    let sha256 = stepflow::sha256_hex(&file_bytes);
    let extension = if test_kind == "playwright_python" { "py" } else { "js" };

    let mut new = NewTest::stepflow(&tenant.tenant_id, &display_name, &base_url, json!({}));
    new.test_kind = test_kind.clone();
    new.interval_seconds = interval_seconds;
    let test = state.store.insert_test(&new).await?;
    let test_id = test["id"].as_str().unwrap_or_default().to_owned();

    let relpath = format!("{}/{}/source.{extension}", tenant.tenant_id, test_id);
    let full_path = std::path::Path::new(&state.settings.tests_dir).join(&relpath);
    if let Some(parent) = full_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&full_path, &file_bytes).await?;
    state
        .store
        .update_test_source(&tenant.tenant_id, &test_id, &relpath, &file_name, Some(&sha256))
        .await?;

    Ok(Json(json!({
        "ok": true,
        "test": test,
        "source": { "relpath": relpath, "sha256": sha256 },
    })))
}

pub async fn list_tests(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, RegistryError> {
    let tenant = auth::require_tenant(&state.store, &headers).await?;
    let tests = state.store.list_tests(&tenant.tenant_id).await?;
    Ok(Json(json!({ "ok": true, "tests": tests })))
}

pub async fn get_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(test_id): Path<String>,
) -> Result<Json<serde_json::Value>, RegistryError> {
    let tenant = auth::require_tenant(&state.store, &headers).await?;
    let test = state
        .store
        .get_test(&tenant.tenant_id, &test_id)
        .await?
        .ok_or_else(|| RegistryError::NotFound("not_found".to_owned()))?;
    Ok(Json(json!({ "ok": true, "test": test })))
}

pub async fn patch_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(test_id): Path<String>,
    Json(mut patch): Json<TestPatch>,
) -> Result<Json<serde_json::Value>, RegistryError> {
    let tenant = auth::require_tenant(&state.store, &headers).await?;
    if let Some(base_url) = &patch.base_url {
        patch.base_url = Some(stepflow::validate_base_url(base_url)?);
    }
    if let Some(definition) = &patch.definition {
        let flow = stepflow::validate_flow(definition)?;
        patch.definition = Some(serde_json::to_value(&flow).unwrap_or_default());
    }
    let updated = state.store.patch_test(&tenant.tenant_id, &test_id, &patch).await?;
    if !updated {
        return Err(RegistryError::NotFound("not_found".to_owned()));
    }
    let test = state.store.get_test(&tenant.tenant_id, &test_id).await?;
    Ok(Json(json!({ "ok": true, "test": test })))
}

#[derive(Debug, Deserialize)]
pub struct DisableTestRequest {
    pub reason: Option<String>,
    #[serde(default)]
    pub until: serde_json::Value,
}

pub async fn disable_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(test_id): Path<String>,
    Json(body): Json<DisableTestRequest>,
) -> Result<Json<serde_json::Value>, RegistryError> {
    let tenant = auth::require_tenant(&state.store, &headers).await?;
    let until_ts = parse_until_ts(&body.until).map_err(RegistryError::BadRequest)?;
    let updated = state
        .store
        .set_test_disabled(&tenant.tenant_id, &test_id, true, body.reason.as_deref(), until_ts)
        .await?;
    if !updated {
        return Err(RegistryError::NotFound("not_found".to_owned()));
    }
    Ok(Json(json!({ "ok": true })))
}

pub async fn enable_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(test_id): Path<String>,
) -> Result<Json<serde_json::Value>, RegistryError> {
    let tenant = auth::require_tenant(&state.store, &headers).await?;
    let updated = state
        .store
        .set_test_disabled(&tenant.tenant_id, &test_id, false, None, None)
        .await?;
    if !updated {
        return Err(RegistryError::NotFound("not_found".to_owned()));
    }
    Ok(Json(json!({ "ok": true })))
}

pub async fn run_now(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(test_id): Path<String>,
) -> Result<Json<serde_json::Value>, RegistryError> {
    let tenant = auth::require_tenant(&state.store, &headers).await?;
    let updated = state.store.trigger_run_now(&tenant.tenant_id, &test_id).await?;
    if !updated {
        return Err(RegistryError::NotFound("not_found".to_owned()));
    }
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    #[serde(default = "default_runs_limit")]
    pub limit: i64,
}

fn default_runs_limit() -> i64 {
    50
}

pub async fn list_runs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(test_id): Path<String>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<serde_json::Value>, RegistryError> {
    let tenant = auth::require_tenant(&state.store, &headers).await?;
    let runs = state
        .store
        .list_runs(&tenant.tenant_id, &test_id, query.limit)
        .await?;
    Ok(Json(json!({ "ok": true, "runs": runs })))
}

pub async fn get_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, RegistryError> {
    let tenant = auth::require_tenant(&state.store, &headers).await?;
    let run = state
        .store
        .get_run(&tenant.tenant_id, &run_id)
        .await?
        .ok_or_else(|| RegistryError::NotFound("not_found".to_owned()))?;
    Ok(Json(json!({ "ok": true, "run": run })))
}

/// Artifact download confined to `{artifacts_dir}/{tenant}/{test}/{run}`.
pub async fn download_artifact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((run_id, name)): Path<(String, String)>,
) -> Result<Response, RegistryError> {
    let tenant = auth::require_tenant(&state.store, &headers).await?;
    let run = state
        .store
        .get_run(&tenant.tenant_id, &run_id)
        .await?
        .ok_or_else(|| RegistryError::NotFound("run_not_found".to_owned()))?;
    let test_id = run["test_id"].as_str().unwrap_or_default().to_owned();

    // The artifact name must be a plain file name inside the run subtree.
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(RegistryError::BadRequest("invalid_artifact_path".to_owned()));
    }
    let base = std::path::Path::new(&state.settings.artifacts_dir);
    let run_dir = base.join(&tenant.tenant_id).join(&test_id).join(&run_id);
    let candidate = run_dir.join(&name);

    let resolved = match candidate.canonicalize() {
        Ok(path) => path,
        Err(_) => return Err(RegistryError::NotFound("artifact_not_found".to_owned())),
    };
    match run_dir.canonicalize() {
        Ok(run_dir) if resolved.starts_with(&run_dir) => {}
        _ => return Err(RegistryError::BadRequest("invalid_artifact_path".to_owned())),
    }

    let bytes = tokio::fs::read(&resolved).await?;
    let content_type = match resolved.extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("zip") => "application/zip",
        Some("json" | "log") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

// ---- status ----------------------------------------------------------------

/// Admin/monitor tokens see all tenants; a tenant key sees its own subset.
pub async fn status_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, RegistryError> {
    if auth::is_admin_or_monitor(&state.settings, &headers) {
        return Ok(Json(state.store.status_summary().await?));
    }

    let tenant = auth::require_tenant(&state.store, &headers)
        .await
        .map_err(|_| RegistryError::Unauthorized("unauthorized".to_owned()))?;
    let summary = state.store.status_summary().await?;
    let tests: Vec<serde_json::Value> = summary["tests"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter(|t| t["tenant_id"].as_str() == Some(tenant.tenant_id.as_str()))
        .collect();
    let failing = tests
        .iter()
        .filter(|t| t["effective_ok"] == json!(false))
        .count();
    Ok(Json(json!({
        "ok": true,
        "total_tests": tests.len(),
        "failing_tests": failing,
        "tests": tests,
    })))
}

// ---- runner protocol --------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RunnerClaimRequest {
    #[serde(default = "default_max_runs")]
    pub max_runs: i64,
}

fn default_max_runs() -> i64 {
    1
}

pub async fn runner_claim(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RunnerClaimRequest>,
) -> Result<Json<serde_json::Value>, RegistryError> {
    auth::require_runner(&state.settings, &headers)?;
    let claimed = state
        .store
        .claim_due_runs(body.max_runs, state.settings.runner_lock_timeout_seconds)
        .await?;
    Ok(Json(json!({ "ok": true, "jobs": claimed })))
}

pub async fn runner_complete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
    Json(completion): Json<RunCompletion>,
) -> Result<Json<serde_json::Value>, RegistryError> {
    auth::require_runner(&state.settings, &headers)?;
    let status = completion.status.trim().to_lowercase();
    if !matches!(status.as_str(), "pass" | "fail" | "infra_degraded") {
        return Err(RegistryError::BadRequest("invalid_status".to_owned()));
    }

    let outcome = state.store.complete_run(&run_id, &completion).await?;

    // Alerts run post-commit so a Telegram hiccup can never roll back the
    // completion.
    if outcome.updated {
        if let (true, Some(test_id)) = (outcome.alerted_down, outcome.test_id.as_deref()) {
            let config = state.store.get_test_internal(test_id).await?.unwrap_or_default();
            let down_after = config["down_after_failures"].as_i64().unwrap_or(2);
            let message = alerts::failure_message(&state.settings, &outcome, &completion, down_after);
            alerts::maybe_send_alert(&state.settings, &state.http, &message).await;

            if config["dispatch_on_failure"] == json!(true) {
                alerts::spawn_dispatch_escalation(
                    (*state.settings).clone(),
                    state.http.clone(),
                    state.store.clone(),
                    outcome.clone(),
                    config["base_url"].as_str().unwrap_or_default().to_owned(),
                    completion.clone(),
                );
            }
        }
        if let (true, Some(test_id)) = (outcome.recovered_up, outcome.test_id.as_deref()) {
            let config = state.store.get_test_internal(test_id).await?.unwrap_or_default();
            if config["notify_on_recovery"] == json!(true) {
                let message = alerts::recovery_message(&state.settings, &outcome);
                alerts::maybe_send_alert(&state.settings, &state.http, &message).await;
            }
        }
    }

    Ok(Json(json!({ "ok": true, "outcome": outcome })))
}
