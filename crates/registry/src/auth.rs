//! Authentication: bearer tokens for the API, a hashed-token cookie for
//! the UI.
//!
//! API-key tokens are returned once at creation; only `sha256(token)` is
//! stored and compared. Static tokens (admin/monitor/runner) are compared
//! in constant time.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::RegistryError;
use crate::settings::Settings;
use crate::store::{AuthedTenant, Store};

/// UI session cookie: holds the SHA-256 of the API key, never the key.
pub const COOKIE_TOKEN_HASH: &str = "e2e_token_hash";
/// Dashboard session cookie: SHA-256 of the monitor (or admin) token.
pub const COOKIE_DASHBOARD_HASH: &str = "monitor_token_hash";

/// Lowercase hex SHA-256 of a raw token.
#[must_use]
pub fn hash_token(token: &str) -> String {
    let token = token.trim();
    if token.is_empty() {
        return String::new();
    }
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Extract the token from an `Authorization: Bearer <token>` header.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, rest) = raw.split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = rest.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_owned())
    }
}

/// Constant-time comparison of a provided token against a configured one.
#[must_use]
pub fn token_matches(provided: &str, configured: &str) -> bool {
    let provided = provided.trim().as_bytes();
    let configured = configured.trim().as_bytes();
    provided.len() == configured.len() && provided.ct_eq(configured).into()
}

/// Read a cookie value from the `Cookie` header.
#[must_use]
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let (key, value) = pair.split_once('=')?;
        if key.trim() == name {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_owned());
            }
        }
    }
    None
}

/// `Set-Cookie` value for a UI session cookie.
#[must_use]
pub fn session_cookie(name: &str, value: &str) -> String {
    format!("{name}={value}; HttpOnly; SameSite=Lax; Path=/")
}

/// `Set-Cookie` value that clears a cookie.
#[must_use]
pub fn clear_cookie(name: &str) -> String {
    format!("{name}=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0")
}

/// Tenant scope: look the bearer token's hash up in the key table.
pub async fn require_tenant(
    store: &Store,
    headers: &HeaderMap,
) -> Result<AuthedTenant, RegistryError> {
    let token = bearer_token(headers)
        .ok_or_else(|| RegistryError::Unauthorized("missing_bearer_token".to_owned()))?;
    store
        .tenant_by_token_hash(&hash_token(&token))
        .await?
        .ok_or_else(|| RegistryError::Forbidden("invalid_token".to_owned()))
}

/// Tenant scope for UI routes, resolved from the session cookie.
pub async fn tenant_from_cookie(
    store: &Store,
    headers: &HeaderMap,
) -> Result<Option<AuthedTenant>, RegistryError> {
    let Some(hash) = cookie_value(headers, COOKIE_TOKEN_HASH) else {
        return Ok(None);
    };
    store.tenant_by_token_hash(&hash).await.map_err(Into::into)
}

fn require_static_token(
    headers: &HeaderMap,
    configured: &str,
    missing_detail: &str,
    invalid_detail: &str,
) -> Result<(), RegistryError> {
    let token = bearer_token(headers)
        .ok_or_else(|| RegistryError::Unauthorized("missing_bearer_token".to_owned()))?;
    if configured.trim().is_empty() {
        return Err(RegistryError::NotConfigured(missing_detail.to_owned()));
    }
    if token_matches(&token, configured) {
        Ok(())
    } else {
        Err(RegistryError::Forbidden(invalid_detail.to_owned()))
    }
}

/// Admin scope: tenant/API-key management.
pub fn require_admin(settings: &Settings, headers: &HeaderMap) -> Result<(), RegistryError> {
    require_static_token(
        headers,
        &settings.admin_token,
        "admin_token_not_configured",
        "invalid_admin_token",
    )
}

/// Runner scope: claim/complete.
pub fn require_runner(settings: &Settings, headers: &HeaderMap) -> Result<(), RegistryError> {
    require_static_token(
        headers,
        &settings.runner_token,
        "runner_token_not_configured",
        "invalid_runner_token",
    )
}

/// Whether the bearer token grants the global status view.
#[must_use]
pub fn is_admin_or_monitor(settings: &Settings, headers: &HeaderMap) -> bool {
    let Some(token) = bearer_token(headers) else {
        return false;
    };
    (!settings.admin_token.trim().is_empty() && token_matches(&token, &settings.admin_token))
        || (!settings.monitor_token.trim().is_empty()
            && token_matches(&token, &settings.monitor_token))
}

/// Whether a dashboard cookie or bearer token authorizes the dashboard.
#[must_use]
pub fn dashboard_authorized(settings: &Settings, headers: &HeaderMap) -> bool {
    if !settings.dashboard_require_auth {
        return true;
    }
    if is_admin_or_monitor(settings, headers) {
        return true;
    }
    let Some(cookie_hash) = cookie_value(headers, COOKIE_DASHBOARD_HASH) else {
        return false;
    };
    [&settings.monitor_token, &settings.admin_token]
        .iter()
        .filter(|t| !t.trim().is_empty())
        .any(|t| token_matches(&cookie_hash, &hash_token(t)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(name: axum::http::HeaderName, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn bearer_extraction() {
        let headers = headers_with(axum::http::header::AUTHORIZATION, "Bearer abc123");
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc123"));

        let headers = headers_with(axum::http::header::AUTHORIZATION, "Basic abc123");
        assert_eq!(bearer_token(&headers), None);

        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn token_hashing_is_stable_hex() {
        let hash = hash_token("hello");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_token("  hello  "));
        assert_eq!(hash_token(""), "");
    }

    #[test]
    fn constant_time_compare_checks_length_and_bytes() {
        assert!(token_matches("secret", "secret"));
        assert!(!token_matches("secret", "secrets"));
        assert!(!token_matches("secret", "secre?"));
    }

    #[test]
    fn cookie_parsing() {
        let headers = headers_with(
            axum::http::header::COOKIE,
            "a=1; e2e_token_hash=deadbeef; b=2",
        );
        assert_eq!(
            cookie_value(&headers, COOKIE_TOKEN_HASH).as_deref(),
            Some("deadbeef")
        );
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn session_cookie_flags() {
        let cookie = session_cookie(COOKIE_TOKEN_HASH, "hash");
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(clear_cookie(COOKIE_TOKEN_HASH).contains("Max-Age=0"));
    }
}
