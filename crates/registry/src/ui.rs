//! Server-rendered tenant UI.
//!
//! Auth is a session cookie holding the SHA-256 of the API key; the raw
//! key never touches the cookie jar. Pages are minijinja templates
//! compiled into the binary.

use axum::extract::{Form, Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse, Redirect, Response};
use minijinja::{Environment, context};
use serde::Deserialize;
use tracing::warn;

use crate::AppState;
use crate::auth::{
    COOKIE_TOKEN_HASH, clear_cookie, hash_token, session_cookie, tenant_from_cookie,
};
use crate::error::RegistryError;
use crate::stepflow;
use crate::store::{AuthedTenant, NewTest};

/// Build the template environment once at startup.
#[must_use]
pub fn build_templates() -> Environment<'static> {
    let mut env = Environment::new();
    for (name, source) in [
        ("login.html", include_str!("../templates/login.html")),
        ("tests.html", include_str!("../templates/tests.html")),
        ("test_detail.html", include_str!("../templates/test_detail.html")),
        ("run_detail.html", include_str!("../templates/run_detail.html")),
        ("upload.html", include_str!("../templates/upload.html")),
        ("dashboard_login.html", include_str!("../templates/dashboard_login.html")),
        ("dashboard.html", include_str!("../templates/dashboard.html")),
    ] {
        if let Err(e) = env.add_template(name, source) {
            warn!(template = name, error = %e, "template failed to compile");
        }
    }
    env
}

fn render(state: &AppState, name: &str, ctx: minijinja::Value) -> Response {
    match state.templates.get_template(name).and_then(|t| t.render(ctx)) {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            warn!(template = name, error = %e, "template render failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "template error").into_response()
        }
    }
}

fn redirect_to_login() -> Response {
    Redirect::to("/ui/login").into_response()
}

async fn ui_auth(state: &AppState, headers: &HeaderMap) -> Result<Option<AuthedTenant>, RegistryError> {
    tenant_from_cookie(&state.store, headers).await
}

// ---- session ---------------------------------------------------------------

pub async fn login_page(State(state): State<AppState>) -> Response {
    render(&state, "login.html", context! { error => minijinja::Value::UNDEFINED })
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub api_key: String,
}

pub async fn login_submit(
    State(state): State<AppState>,
    Form(form): Form<LoginForm>,
) -> Result<Response, RegistryError> {
    let token = form.api_key.trim();
    if token.is_empty() {
        return Ok(render(&state, "login.html", context! { error => "Missing API key" }));
    }
    let token_hash = hash_token(token);
    if state.store.tenant_by_token_hash(&token_hash).await?.is_none() {
        return Ok(render(&state, "login.html", context! { error => "Invalid API key" }));
    }
    Ok((
        StatusCode::SEE_OTHER,
        [
            (header::SET_COOKIE, session_cookie(COOKIE_TOKEN_HASH, &token_hash)),
            (header::LOCATION, "/ui/tests".to_owned()),
        ],
    )
        .into_response())
}

pub async fn logout() -> Response {
    (
        StatusCode::SEE_OTHER,
        [
            (header::SET_COOKIE, clear_cookie(COOKIE_TOKEN_HASH)),
            (header::LOCATION, "/ui/login".to_owned()),
        ],
    )
        .into_response()
}

// ---- pages -----------------------------------------------------------------

pub async fn tests_page(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, RegistryError> {
    let Some(tenant) = ui_auth(&state, &headers).await? else {
        return Ok(redirect_to_login());
    };
    let tests = state.store.list_tests(&tenant.tenant_id).await?;
    Ok(render(
        &state,
        "tests.html",
        context! { tenant_id => tenant.tenant_id, tests => tests },
    ))
}

#[derive(Debug, Deserialize)]
pub struct MsgQuery {
    #[serde(default)]
    pub msg: Option<String>,
}

pub async fn test_detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(test_id): Path<String>,
    Query(query): Query<MsgQuery>,
) -> Result<Response, RegistryError> {
    let Some(tenant) = ui_auth(&state, &headers).await? else {
        return Ok(redirect_to_login());
    };
    let test = state
        .store
        .get_test(&tenant.tenant_id, &test_id)
        .await?
        .ok_or_else(|| RegistryError::NotFound("test_not_found".to_owned()))?;
    let runs = state.store.list_runs(&tenant.tenant_id, &test_id, 50).await?;
    let definition = serde_json::to_string_pretty(&test["definition"]).unwrap_or_default();
    Ok(render(
        &state,
        "test_detail.html",
        context! { test => test, runs => runs, definition_json => definition, msg => query.msg },
    ))
}

fn back_to_test(test_id: &str, msg: &str) -> Response {
    let encoded: String = percent_encoding::utf8_percent_encode(
        msg,
        percent_encoding::NON_ALPHANUMERIC,
    )
    .to_string();
    Redirect::to(&format!("/ui/tests/{test_id}?msg={encoded}")).into_response()
}

pub async fn run_now(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(test_id): Path<String>,
) -> Result<Response, RegistryError> {
    let Some(tenant) = ui_auth(&state, &headers).await? else {
        return Ok(redirect_to_login());
    };
    let ok = state.store.trigger_run_now(&tenant.tenant_id, &test_id).await?;
    Ok(back_to_test(&test_id, if ok { "Run triggered" } else { "Failed to trigger run" }))
}

#[derive(Debug, Deserialize)]
pub struct DisableForm {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub until: String,
}

pub async fn disable_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(test_id): Path<String>,
    Form(form): Form<DisableForm>,
) -> Result<Response, RegistryError> {
    let Some(tenant) = ui_auth(&state, &headers).await? else {
        return Ok(redirect_to_login());
    };
    let until_value = serde_json::Value::String(form.until.clone());
    let Ok(until_ts) = vigil_core::time::parse_until_ts(&until_value) else {
        return Ok(back_to_test(&test_id, "Invalid until value"));
    };
    let reason = if form.reason.trim().is_empty() {
        "temporary disable"
    } else {
        form.reason.trim()
    };
    let ok = state
        .store
        .set_test_disabled(&tenant.tenant_id, &test_id, true, Some(reason), until_ts)
        .await?;
    Ok(back_to_test(&test_id, if ok { "Disabled" } else { "Disable failed" }))
}

pub async fn enable_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(test_id): Path<String>,
) -> Result<Response, RegistryError> {
    let Some(tenant) = ui_auth(&state, &headers).await? else {
        return Ok(redirect_to_login());
    };
    let ok = state
        .store
        .set_test_disabled(&tenant.tenant_id, &test_id, false, None, None)
        .await?;
    Ok(back_to_test(&test_id, if ok { "Enabled" } else { "Enable failed" }))
}

pub async fn run_detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<Response, RegistryError> {
    let Some(tenant) = ui_auth(&state, &headers).await? else {
        return Ok(redirect_to_login());
    };
    let run = state
        .store
        .get_run(&tenant.tenant_id, &run_id)
        .await?
        .ok_or_else(|| RegistryError::NotFound("run_not_found".to_owned()))?;
    let artifacts = run["artifacts"].clone();
    Ok(render(
        &state,
        "run_detail.html",
        context! { run => run, artifacts => artifacts },
    ))
}

// ---- upload ----------------------------------------------------------------

pub async fn upload_page(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, RegistryError> {
    if ui_auth(&state, &headers).await?.is_none() {
        return Ok(redirect_to_login());
    }
    Ok(render(
        &state,
        "upload.html",
        context! { error => minijinja::Value::UNDEFINED, msg => minijinja::Value::UNDEFINED },
    ))
}

pub async fn upload_submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, RegistryError> {
    let Some(tenant) = ui_auth(&state, &headers).await? else {
        return Ok(redirect_to_login());
    };

    let mut name = String::new();
    let mut base_url = String::new();
    let mut interval_seconds: i64 = 300;
    let mut file_bytes: Vec<u8> = Vec::new();
    let mut content_type: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RegistryError::BadRequest(format!("invalid_multipart: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "name" => name = field.text().await.unwrap_or_default().trim().to_owned(),
            "base_url" => base_url = field.text().await.unwrap_or_default().trim().to_owned(),
            "interval_seconds" => {
                interval_seconds = field
                    .text()
                    .await
                    .unwrap_or_default()
                    .trim()
                    .parse()
                    .unwrap_or(300);
            }
            "file" => {
                content_type = field.content_type().map(str::to_owned);
                file_bytes = field
                    .bytes()
                    .await
                    .map_err(|e| RegistryError::BadRequest(format!("upload_read_failed: {e}")))?
                    .to_vec();
            }
            _ => {}
        }
    }

    let upload_error = |state: &AppState, error: String| {
        render(
            state,
            "upload.html",
            context! { error => error, msg => minijinja::Value::UNDEFINED },
        )
    };

    if file_bytes.len() as u64 > state.settings.max_upload_bytes {
        return Ok(upload_error(&state, "upload_too_large".to_owned()));
    }

    let parsed = stepflow::parse_definition_bytes(&file_bytes, content_type.as_deref())
        .and_then(|raw| stepflow::validate_flow(&raw))
        .and_then(|flow| stepflow::validate_base_url(&base_url).map(|base| (flow, base)));
    let (flow, base) = match parsed {
        Ok(parts) => parts,
        Err(RegistryError::BadRequest(detail)) => return Ok(upload_error(&state, detail)),
        Err(e) => return Err(e),
    };

    let display_name = if name.is_empty() { flow.name.clone() } else { name };
    let mut new = NewTest::stepflow(
        &tenant.tenant_id,
        &display_name,
        &base,
        serde_json::to_value(&flow).unwrap_or_default(),
    );
    new.interval_seconds = interval_seconds;
    let created = state.store.insert_test(&new).await?;

    Ok(render(
        &state,
        "upload.html",
        context! {
            error => minijinja::Value::UNDEFINED,
            msg => format!("Created test {}", created["id"].as_str().unwrap_or("?")),
        },
    ))
}

