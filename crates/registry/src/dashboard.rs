//! Read-only monitor dashboard.
//!
//! Renders the most recent monitor state file (mounted read-only into
//! this container) plus the registry summary and dispatch history. Auth
//! is a separate cookie holding the hash of the monitor (or admin) token.

use axum::Json;
use axum::extract::{Form, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse, Redirect, Response};
use minijinja::context;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::AppState;
use crate::auth::{
    COOKIE_DASHBOARD_HASH, dashboard_authorized, hash_token, session_cookie, token_matches,
};
use crate::error::RegistryError;

/// Load the monitor state file; a missing or malformed file renders as an
/// empty state rather than an error page.
fn load_monitor_state(path: &str) -> serde_json::Value {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_else(|| json!({}))
}

fn map_entries(value: &serde_json::Value, key: &str) -> serde_json::Map<String, serde_json::Value> {
    value
        .get(key)
        .and_then(serde_json::Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// Down-sample a sample series to at most `max_points` by stride.
fn downsample(samples: &[serde_json::Value], max_points: usize) -> Vec<serde_json::Value> {
    if max_points == 0 || samples.len() <= max_points {
        return samples.to_vec();
    }
    let stride = samples.len().div_ceil(max_points);
    samples.iter().step_by(stride).cloned().collect()
}

/// Assemble the dashboard document: domains, signals, host snapshot,
/// events, dispatch history, down-sampled timeseries, registry summary.
pub async fn build_dashboard_state(state: &AppState) -> serde_json::Value {
    let monitor = load_monitor_state(&state.settings.monitor_state_path);

    let last_ok = map_entries(&monitor, "last_ok");
    let fail = map_entries(&monitor, "fail_streak");
    let success = map_entries(&monitor, "success_streak");
    let domains: Vec<serde_json::Value> = last_ok
        .iter()
        .map(|(domain, ok)| {
            json!({
                "domain": domain,
                "ok": ok.as_bool().unwrap_or(true),
                "fail_streak": fail.get(domain).cloned().unwrap_or(json!(0)),
                "success_streak": success.get(domain).cloned().unwrap_or(json!(0)),
            })
        })
        .collect();

    let signals: Vec<serde_json::Value> = map_entries(&monitor, "signals")
        .iter()
        .map(|(kind, s)| {
            json!({
                "kind": kind,
                "last_ok": s.get("last_ok").and_then(serde_json::Value::as_bool).unwrap_or(true),
                "fail_streak": s.get("fail_streak").cloned().unwrap_or(json!(0)),
                "success_streak": s.get("success_streak").cloned().unwrap_or(json!(0)),
                "last_run_ts": s.get("last_run_ts").cloned().unwrap_or(serde_json::Value::Null),
            })
        })
        .collect();

    let timeseries: serde_json::Map<String, serde_json::Value> = map_entries(&monitor, "history")
        .iter()
        .map(|(domain, samples)| {
            let samples = samples.as_array().cloned().unwrap_or_default();
            (
                domain.clone(),
                serde_json::Value::Array(downsample(&samples, state.settings.dashboard_max_points)),
            )
        })
        .collect();

    let registry = match state.store.status_summary().await {
        Ok(summary) => summary,
        Err(e) => {
            warn!(error = %e, "registry summary failed");
            json!({ "ok": false, "total_tests": 0, "failing_tests": 0, "tests": [] })
        }
    };
    let dispatch_db = state.store.list_dispatch_runs(80).await.unwrap_or_default();

    json!({
        "generated_at": vigil_core::time::now_ts(),
        "domains": domains,
        "signals": signals,
        "host_snapshot": monitor.get("host_snapshot").cloned().unwrap_or(serde_json::Value::Null),
        "events": monitor.get("events").cloned().unwrap_or(json!([])),
        "dispatch_history": monitor.get("dispatch_history").cloned().unwrap_or(json!([])),
        "dispatch_runs": dispatch_db,
        "timeseries": timeseries,
        "registry": registry,
    })
}

pub async fn page(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, RegistryError> {
    if !dashboard_authorized(&state.settings, &headers) {
        return Ok(Redirect::to("/dashboard/login").into_response());
    }
    let doc = build_dashboard_state(&state).await;

    let truncate = |v: &serde_json::Value| -> String {
        let s = v.as_str().unwrap_or_default();
        s.chars().take(200).collect()
    };
    let dispatch_history: Vec<serde_json::Value> = doc["dispatch_history"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .iter()
        .map(|d| {
            let conclusion = if d["agent_message"].is_string() {
                truncate(&d["agent_message"])
            } else {
                truncate(&d["error_message"])
            };
            json!({
                "ts": d["ts"],
                "state_key": d["state_key"],
                "queue_state": d["queue_state"],
                "conclusion": conclusion,
            })
        })
        .collect();

    let rendered = state
        .templates
        .get_template("dashboard.html")
        .and_then(|t| {
            t.render(context! {
                generated_at => doc["generated_at"].clone(),
                domains => doc["domains"].clone(),
                signals => doc["signals"].clone(),
                registry => doc["registry"].clone(),
                events => doc["events"].clone(),
                dispatch_history => dispatch_history,
            })
        });
    match rendered {
        Ok(html) => Ok(Html(html).into_response()),
        Err(e) => {
            warn!(error = %e, "dashboard render failed");
            Ok((StatusCode::INTERNAL_SERVER_ERROR, "template error").into_response())
        }
    }
}

pub async fn login_page(State(state): State<AppState>) -> Response {
    render_login(&state, None)
}

fn render_login(state: &AppState, error: Option<&str>) -> Response {
    match state
        .templates
        .get_template("dashboard_login.html")
        .and_then(|t| t.render(context! { error => error }))
    {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            warn!(error = %e, "dashboard login render failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "template error").into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DashboardLoginForm {
    #[serde(default)]
    pub token: String,
}

pub async fn login_submit(
    State(state): State<AppState>,
    Form(form): Form<DashboardLoginForm>,
) -> Response {
    let token = form.token.trim();
    let valid = [&state.settings.monitor_token, &state.settings.admin_token]
        .iter()
        .filter(|t| !t.trim().is_empty())
        .any(|t| token_matches(token, t));
    if !valid {
        return render_login(&state, Some("Invalid token"));
    }
    (
        StatusCode::SEE_OTHER,
        [
            (
                header::SET_COOKIE,
                session_cookie(COOKIE_DASHBOARD_HASH, &hash_token(token)),
            ),
            (header::LOCATION, "/dashboard".to_owned()),
        ],
    )
        .into_response()
}

/// JSON variant for programmatic consumers and the dashboard's refresh.
pub async fn state_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, RegistryError> {
    if !dashboard_authorized(&state.settings, &headers) {
        return Err(RegistryError::Unauthorized("dashboard_not_authenticated".to_owned()));
    }
    Ok(Json(build_dashboard_state(&state).await))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downsample_respects_max_points() {
        let samples: Vec<serde_json::Value> = (0..100).map(|i| json!([i, true])).collect();
        let out = downsample(&samples, 10);
        assert!(out.len() <= 10);
        assert_eq!(out[0], json!([0, true]));

        let small = downsample(&samples[..5], 10);
        assert_eq!(small.len(), 5);
    }

    #[test]
    fn malformed_state_file_is_empty_object() {
        assert_eq!(load_monitor_state("/definitely/missing.json"), json!({}));
    }
}
