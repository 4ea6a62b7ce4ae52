//! Raw HTTP availability check.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};

use vigil_core::check::{CheckSpec, normalize_text};

/// User agent sent by every monitor HTTP request.
pub const USER_AGENT: &str = "Vigil Service Monitoring Bot";

/// Inline script and style bodies are excised before the forbidden-text
/// scan so a substring inside a JS string literal cannot trip the check.
static SCRIPT_STYLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script>|<style\b[^>]*>.*?</style>").unwrap()
});

/// Build the shared HTTP client: fixed user agent, bounded redirects.
/// Per-request timeouts come from each check spec.
#[must_use]
pub fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .unwrap_or_default()
}

/// Result of one HTTP GET check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCheckOutcome {
    pub ok: bool,
    pub status_code: Option<u16>,
    pub final_url: Option<String>,
    pub final_host: Option<String>,
    pub forbidden_hits: Vec<String>,
    /// Response headers, lower-cased names. Consumed by the proxy
    /// upstream-expectation signal.
    pub captured_headers: BTreeMap<String, String>,
    pub elapsed_ms: f64,
    pub error: Option<String>,
}

/// Visible page text with `<script>`/`<style>` contents removed, then
/// whitespace-normalized and lowercased.
#[must_use]
pub fn scannable_body_text(html: &str) -> String {
    normalize_text(&SCRIPT_STYLE_RE.replace_all(html, " "))
}

/// GET the spec's URL following redirects and judge the response: status
/// must be allowed, the body must not contain a forbidden phrase, and the
/// final host must match the expected suffix when configured.
pub async fn http_get_check(http: &reqwest::Client, spec: &CheckSpec) -> HttpCheckOutcome {
    let started = Instant::now();
    let elapsed_ms = |s: Instant| s.elapsed().as_secs_f64() * 1000.0;

    let resp = match http
        .get(&spec.url)
        .timeout(Duration::from_secs_f64(spec.http_timeout_seconds.max(1.0)))
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            return HttpCheckOutcome {
                ok: false,
                status_code: None,
                final_url: None,
                final_host: None,
                forbidden_hits: Vec::new(),
                captured_headers: BTreeMap::new(),
                elapsed_ms: elapsed_ms(started),
                error: Some(format!("http_error: {e}")),
            };
        }
    };

    let status = resp.status().as_u16();
    let final_url = resp.url().to_string();
    let final_host = resp.url().host_str().map(str::to_owned);
    let captured_headers: BTreeMap<String, String> = resp
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_lowercase(),
                value.to_str().unwrap_or_default().to_owned(),
            )
        })
        .collect();

    let body = resp.text().await.unwrap_or_default();
    let elapsed = elapsed_ms(started);

    let forbidden_hits = spec.forbidden_hits(&scannable_body_text(&body));

    let status_ok = spec.status_allowed(status);
    let host_ok = final_host
        .as_deref()
        .is_none_or(|h| spec.final_host_allowed(h));

    let error = if !status_ok {
        Some(format!("http_error: status {status} not allowed"))
    } else if !forbidden_hits.is_empty() {
        Some(format!("forbidden_text: {}", forbidden_hits.join(", ")))
    } else if !host_ok {
        Some(format!(
            "final_host_mismatch: {}",
            final_host.as_deref().unwrap_or("")
        ))
    } else {
        None
    };

    HttpCheckOutcome {
        ok: error.is_none(),
        status_code: Some(status),
        final_url: Some(final_url),
        final_host,
        forbidden_hits,
        captured_headers,
        elapsed_ms: elapsed,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::check::CheckSpec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn script_text_is_not_scanned() {
        let html = r#"<html><head><script>var s = "under maintenance";</script>
            <style>.x { content: "service unavailable"; }</style></head>
            <body>All good here</body></html>"#;
        let spec = CheckSpec::new("d", "https://d");
        assert!(spec.forbidden_hits(&scannable_body_text(html)).is_empty());
    }

    #[test]
    fn visible_maintenance_text_is_a_hit() {
        let html = "<body>We are down for maintenance</body>";
        let spec = CheckSpec::new("d", "https://d");
        assert_eq!(spec.forbidden_hits(&scannable_body_text(html)), vec!["maintenance"]);
    }

    #[tokio::test]
    async fn healthy_page_passes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-aipc-upstream", "primary-1")
                    .set_body_string("<body>Welcome</body>"),
            )
            .mount(&server)
            .await;

        let spec = CheckSpec::new("d", format!("{}/", server.uri()));
        let outcome = http_get_check(&build_http_client(), &spec).await;
        assert!(outcome.ok);
        assert_eq!(outcome.status_code, Some(200));
        assert_eq!(
            outcome.captured_headers.get("x-aipc-upstream").map(String::as_str),
            Some("primary-1")
        );
        assert!(outcome.elapsed_ms >= 0.0);
    }

    #[tokio::test]
    async fn disallowed_status_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("oops"))
            .mount(&server)
            .await;

        let spec = CheckSpec::new("d", server.uri());
        let outcome = http_get_check(&build_http_client(), &spec).await;
        assert!(!outcome.ok);
        assert!(outcome.error.as_deref().unwrap().starts_with("http_error"));
    }

    #[tokio::test]
    async fn pinned_status_list_overrides_default() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("auth wall"))
            .mount(&server)
            .await;

        let mut spec = CheckSpec::new("d", server.uri());
        spec.allowed_status_codes = Some(vec![401]);
        let outcome = http_get_check(&build_http_client(), &spec).await;
        assert!(outcome.ok);
    }

    #[tokio::test]
    async fn forbidden_body_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<h1>Bad Gateway</h1>"))
            .mount(&server)
            .await;

        let spec = CheckSpec::new("d", server.uri());
        let outcome = http_get_check(&build_http_client(), &spec).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.forbidden_hits, vec!["bad gateway"]);
    }

    #[tokio::test]
    async fn connection_error_is_http_error() {
        // Nothing listens on this port.
        let spec = CheckSpec::new("d", "http://127.0.0.1:1/");
        let outcome = http_get_check(&build_http_client(), &spec).await;
        assert!(!outcome.ok);
        assert!(outcome.error.as_deref().unwrap().starts_with("http_error"));
        assert_eq!(outcome.status_code, None);
    }
}
