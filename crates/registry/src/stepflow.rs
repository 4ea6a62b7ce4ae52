//! Definition parsing and base-url policy for submitted tests.

use sha2::{Digest, Sha256};
use url::Url;

use vigil_core::step::{StepFlow, validate_definition};

use crate::error::RegistryError;
use crate::settings::Settings;

/// Hosts that are never acceptable as a test target.
const RESERVED_HOSTS: [&str; 4] = ["example.com", "example.org", "example.net", "localhost"];

/// Parse an uploaded definition (JSON or YAML) into a raw JSON value.
///
/// JSON is preferred when the content type says so; otherwise the YAML
/// parser handles both (YAML is a superset of JSON).
pub fn parse_definition_bytes(
    raw: &[u8],
    content_type: Option<&str>,
) -> Result<serde_json::Value, RegistryError> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        return Err(RegistryError::BadRequest("empty_definition".to_owned()));
    }

    let value: serde_json::Value = if content_type.is_some_and(|ct| ct.to_lowercase().contains("json")) {
        serde_json::from_str(text)
            .map_err(|e| RegistryError::BadRequest(format!("invalid_json: {e}")))?
    } else {
        serde_yaml_ng::from_str(text)
            .map_err(|e| RegistryError::BadRequest(format!("invalid_yaml: {e}")))?
    };

    if !value.is_object() {
        return Err(RegistryError::BadRequest("definition_must_be_object".to_owned()));
    }
    Ok(value)
}

/// Validate a raw definition value into a normalized step flow.
pub fn validate_flow(value: &serde_json::Value) -> Result<StepFlow, RegistryError> {
    validate_definition(value).map_err(|e| RegistryError::BadRequest(e.0))
}

/// Syntactic base-url validation: http(s) scheme plus a host.
pub fn validate_base_url(base_url: &str) -> Result<String, RegistryError> {
    let s = base_url.trim();
    if s.is_empty() {
        return Err(RegistryError::BadRequest("missing_base_url".to_owned()));
    }
    let parsed =
        Url::parse(s).map_err(|_| RegistryError::BadRequest("invalid_base_url_host".to_owned()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(RegistryError::BadRequest("invalid_base_url_scheme".to_owned()));
    }
    if parsed.host_str().is_none() {
        return Err(RegistryError::BadRequest("invalid_base_url_host".to_owned()));
    }
    Ok(s.to_owned())
}

/// Domains listed in the monitor's config file, lower-cased. Used as the
/// strict-mode allowlist when no explicit one is configured.
#[must_use]
pub fn monitored_domains(monitor_config_path: &str) -> Vec<String> {
    let Ok(contents) = std::fs::read_to_string(monitor_config_path) else {
        return Vec::new();
    };
    let Ok(value) = serde_yaml_ng::from_str::<serde_json::Value>(&contents) else {
        return Vec::new();
    };
    value
        .get("domains")
        .and_then(serde_json::Value::as_array)
        .map(|domains| {
            domains
                .iter()
                .filter_map(|entry| match entry {
                    serde_json::Value::String(s) => Some(s.clone()),
                    serde_json::Value::Object(map) => map
                        .get("domain")
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_owned),
                    _ => None,
                })
                .map(|d| d.trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Enforce the upload base-url policy.
///
/// Reserved hosts are always rejected. In strict mode the host must be in
/// the explicit allowlist, or (when enabled) in the monitored-domain set
/// derived from the monitor's config.
pub fn enforce_base_url_policy(
    settings: &Settings,
    monitored: &[String],
    base_url: &str,
) -> Result<(), RegistryError> {
    let host = Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
        .ok_or_else(|| RegistryError::BadRequest("invalid_base_url_host".to_owned()))?;

    if RESERVED_HOSTS.contains(&host.as_str()) {
        return Err(RegistryError::BadRequest("base_url_reserved_host".to_owned()));
    }

    if !settings.strict_base_url_policy {
        return Ok(());
    }

    if !settings.base_url_allowed_hosts.is_empty() {
        if settings.base_url_allowed_hosts.iter().any(|h| h == &host) {
            return Ok(());
        }
        return Err(RegistryError::BadRequest("base_url_not_allowed_host".to_owned()));
    }

    if settings.base_url_allow_monitored_domains {
        if monitored.iter().any(|d| d == &host) {
            return Ok(());
        }
        return Err(RegistryError::BadRequest("base_url_not_monitored_domain".to_owned()));
    }

    Err(RegistryError::BadRequest("base_url_not_allowed_host".to_owned()))
}

/// Lowercase hex SHA-256 of an uploaded source file.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict_settings(allowed: &[&str], allow_monitored: bool) -> Settings {
        let mut settings = Settings::from_env();
        settings.strict_base_url_policy = true;
        settings.base_url_allowed_hosts = allowed.iter().map(|s| (*s).to_owned()).collect();
        settings.base_url_allow_monitored_domains = allow_monitored;
        settings
    }

    #[test]
    fn yaml_and_json_both_parse() {
        let yaml = b"name: t\nsteps:\n  - type: goto\n";
        let json = br#"{"name": "t", "steps": [{"type": "goto"}]}"#;
        assert!(parse_definition_bytes(yaml, None).is_ok());
        assert!(parse_definition_bytes(json, Some("application/json")).is_ok());
        assert!(parse_definition_bytes(b"", None).is_err());
        assert!(parse_definition_bytes(b"- 1\n- 2", None).is_err());
    }

    #[test]
    fn base_url_syntax() {
        assert!(validate_base_url("https://app.example.dev/path").is_ok());
        assert!(validate_base_url("ftp://app.example.dev").is_err());
        assert!(validate_base_url("").is_err());
        assert!(validate_base_url("not a url").is_err());
    }

    #[test]
    fn reserved_hosts_always_rejected() {
        let mut settings = Settings::from_env();
        settings.strict_base_url_policy = false;
        let err = enforce_base_url_policy(&settings, &[], "https://example.com/").unwrap_err();
        assert!(matches!(err, RegistryError::BadRequest(d) if d == "base_url_reserved_host"));
    }

    #[test]
    fn strict_mode_uses_explicit_allowlist_first() {
        let settings = strict_settings(&["app.prod.net"], true);
        assert!(enforce_base_url_policy(&settings, &[], "https://app.prod.net/x").is_ok());
        let err =
            enforce_base_url_policy(&settings, &[], "https://other.prod.net/").unwrap_err();
        assert!(matches!(err, RegistryError::BadRequest(d) if d == "base_url_not_allowed_host"));
    }

    #[test]
    fn strict_mode_falls_back_to_monitored_domains() {
        let settings = strict_settings(&[], true);
        let monitored = vec!["watched.prod.net".to_owned()];
        assert!(enforce_base_url_policy(&settings, &monitored, "https://watched.prod.net/").is_ok());
        let err =
            enforce_base_url_policy(&settings, &monitored, "https://rogue.prod.net/").unwrap_err();
        assert!(
            matches!(err, RegistryError::BadRequest(d) if d == "base_url_not_monitored_domain")
        );
    }

    #[test]
    fn monitored_domains_read_both_entry_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "domains:\n  - plain.prod.net\n  - domain: App.Prod.Net\n    url: https://app.prod.net\n",
        )
        .unwrap();
        let domains = monitored_domains(path.to_str().unwrap());
        assert_eq!(domains, vec!["plain.prod.net", "app.prod.net"]);
        assert!(monitored_domains("/nonexistent.yaml").is_empty());
    }
}
