//! API contract checks: status, content type, JSON shape and latency.

use std::time::{Duration, Instant};

use serde::Serialize;

use vigil_core::check::ApiContractCheck;

/// Result of one contract check.
#[derive(Debug, Clone, Serialize)]
pub struct ApiContractOutcome {
    pub domain: String,
    pub name: String,
    pub ok: bool,
    pub url: String,
    pub status_code: Option<u16>,
    pub elapsed_ms: Option<f64>,
    pub error: Option<String>,
    pub details: serde_json::Value,
}

/// Traverse a dot-path (`a.b.0.c`); numeric segments index arrays.
/// Returns `(exists, value)`.
#[must_use]
pub fn get_json_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        let segment = segment.trim();
        if segment.is_empty() {
            return None;
        }
        current = match current {
            serde_json::Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            serde_json::Value::Object(map) => map.get(segment)?,
            _ => return None,
        };
    }
    Some(current)
}

fn resolve_url(base_url: &str, check: &ApiContractCheck) -> String {
    if let Some(url) = check.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        return url.to_owned();
    }
    let path = check.path.as_deref().unwrap_or("").trim();
    let path = if path.is_empty() || path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    };
    format!("{}{path}", base_url.trim_end_matches('/'))
}

/// Run one contract check against its endpoint.
#[allow(clippy::too_many_lines)]
pub async fn run_api_contract_check(
    http: &reqwest::Client,
    domain: &str,
    base_url: &str,
    check: &ApiContractCheck,
    timeout_seconds: f64,
) -> ApiContractOutcome {
    let domain = domain.trim().to_lowercase();
    let name: String = check.display_name().trim().chars().take(80).collect();
    let url = resolve_url(base_url, check);

    let method = reqwest::Method::from_bytes(check.method.trim().to_uppercase().as_bytes())
        .unwrap_or(reqwest::Method::GET);

    let mut request = http
        .request(method, &url)
        .timeout(Duration::from_secs_f64(timeout_seconds.max(1.0)));
    for (key, value) in &check.headers {
        request = request.header(key, value);
    }
    if let Some(body) = &check.body_json {
        request = request.json(body);
    }

    let started = Instant::now();
    let mut details = serde_json::Map::new();

    let response = match request.send().await {
        Ok(resp) => resp,
        Err(e) => {
            return ApiContractOutcome {
                domain,
                name,
                ok: false,
                url,
                status_code: None,
                elapsed_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
                error: Some(format!("http_error: {e}")),
                details: serde_json::Value::Object(details),
            };
        }
    };

    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_lowercase();
    details.insert("content_type".to_owned(), content_type.clone().into());
    details.insert("final_url".to_owned(), response.url().to_string().into());

    let body = response.text().await.unwrap_or_default();
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    let mut error: Option<String> = None;

    if !check.expected_status_codes.contains(&status) {
        error = Some(format!(
            "unexpected_status: {status} not in {:?}",
            check.expected_status_codes
        ));
    }

    if error.is_none() {
        if let Some(expected_ct) = check
            .expected_content_type_contains
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            if !content_type.contains(&expected_ct.to_lowercase()) {
                error = Some(format!(
                    "unexpected_content_type: {content_type:?} missing {expected_ct:?}"
                ));
            }
        }
    }

    let needs_json = !check.json_paths_required.is_empty() || !check.json_paths_equal.is_empty();
    let mut data = serde_json::Value::Null;
    if error.is_none() && needs_json {
        match serde_json::from_str(&body) {
            Ok(parsed) => data = parsed,
            Err(e) => error = Some(format!("json_parse_error: {e}")),
        }
    }

    if error.is_none() && !check.json_paths_required.is_empty() {
        let missing: Vec<&String> = check
            .json_paths_required
            .iter()
            .take(50)
            .filter(|p| get_json_path(&data, p).is_none())
            .collect();
        if !missing.is_empty() {
            details.insert(
                "missing_json_paths".to_owned(),
                serde_json::json!(missing.iter().take(25).collect::<Vec<_>>()),
            );
            error = Some("missing_json_paths".to_owned());
        }
    }

    if error.is_none() && !check.json_paths_equal.is_empty() {
        let mut mismatches = Vec::new();
        for (path, expected) in check.json_paths_equal.iter().take(50) {
            match get_json_path(&data, path) {
                None => mismatches.push(format!("{path}: missing")),
                Some(got) if got != expected => {
                    mismatches.push(format!("{path}: got={got} expected={expected}"));
                }
                Some(_) => {}
            }
        }
        if !mismatches.is_empty() {
            mismatches.truncate(25);
            details.insert("json_mismatches".to_owned(), serde_json::json!(mismatches));
            error = Some("json_value_mismatch".to_owned());
        }
    }

    if error.is_none() {
        if let Some(max) = check.max_elapsed_ms {
            if elapsed_ms > max {
                error = Some(format!("slow_api: elapsed_ms={elapsed_ms:.1} > {max:.1}"));
            }
        }
    }

    ApiContractOutcome {
        domain,
        name,
        ok: error.is_none(),
        url,
        status_code: Some(status),
        elapsed_ms: Some(elapsed_ms),
        error,
        details: serde_json::Value::Object(details),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn check() -> ApiContractCheck {
        serde_json::from_value(json!({"path": "/api/health"})).unwrap()
    }

    #[test]
    fn json_path_traversal() {
        let doc = json!({"items": [{"id": 7}], "meta": {"ok": true}});
        assert_eq!(get_json_path(&doc, "items.0.id"), Some(&json!(7)));
        assert_eq!(get_json_path(&doc, "meta.ok"), Some(&json!(true)));
        assert_eq!(get_json_path(&doc, "items.1.id"), None);
        assert_eq!(get_json_path(&doc, "meta.missing"), None);
        assert_eq!(get_json_path(&doc, "meta.ok.deeper"), None);
    }

    #[test]
    fn url_resolution_joins_paths() {
        let mut c = check();
        assert_eq!(resolve_url("https://x.example/", &c), "https://x.example/api/health");
        c.path = Some("api/health".to_owned());
        assert_eq!(resolve_url("https://x.example", &c), "https://x.example/api/health");
        c.url = Some("https://other.example/z".to_owned());
        assert_eq!(resolve_url("https://x.example", &c), "https://other.example/z");
    }

    #[tokio::test]
    async fn passing_contract() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ok",
                "items": [1, 2],
            })))
            .mount(&server)
            .await;

        let mut c = check();
        c.json_paths_required = vec!["status".to_owned(), "items.1".to_owned()];
        c.json_paths_equal = [("status".to_owned(), json!("ok"))].into();

        let outcome =
            run_api_contract_check(&reqwest::Client::new(), "d", &server.uri(), &c, 5.0).await;
        assert!(outcome.ok, "{:?}", outcome.error);
    }

    #[tokio::test]
    async fn missing_path_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
            .mount(&server)
            .await;

        let mut c = check();
        c.json_paths_required = vec!["data.items".to_owned()];
        let outcome =
            run_api_contract_check(&reqwest::Client::new(), "d", &server.uri(), &c, 5.0).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.error.as_deref(), Some("missing_json_paths"));
    }

    #[tokio::test]
    async fn wrong_value_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "degraded"})))
            .mount(&server)
            .await;

        let mut c = check();
        c.json_paths_equal = [("status".to_owned(), json!("ok"))].into();
        let outcome =
            run_api_contract_check(&reqwest::Client::new(), "d", &server.uri(), &c, 5.0).await;
        assert_eq!(outcome.error.as_deref(), Some("json_value_mismatch"));
    }

    #[tokio::test]
    async fn wrong_content_type_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;

        let outcome =
            run_api_contract_check(&reqwest::Client::new(), "d", &server.uri(), &check(), 5.0)
                .await;
        assert!(!outcome.ok);
        assert!(outcome.error.as_deref().unwrap().starts_with("unexpected_content_type"));
    }

    #[tokio::test]
    async fn unexpected_status_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let outcome =
            run_api_contract_check(&reqwest::Client::new(), "d", &server.uri(), &check(), 5.0)
                .await;
        assert!(outcome.error.as_deref().unwrap().starts_with("unexpected_status"));
    }
}
