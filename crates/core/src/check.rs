//! Per-domain check specifications.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::step::Step;

/// Default maintenance-indicator phrases scanned against page text. A hit
/// on any of these fails the check even when the status code looks fine.
pub const DEFAULT_MAINTENANCE_TEXT: [&str; 6] = [
    "maintenance",
    "temporarily unavailable",
    "we'll be back",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
];

/// Collapse whitespace and lowercase, matching how page text is scanned.
#[must_use]
pub fn normalize_text(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// DOM state a selector must reach for the check to pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorState {
    Attached,
    Detached,
    Visible,
    Hidden,
}

impl SelectorState {
    /// `meta`/`script`/`link`/`title` selectors default to `attached`
    /// (those elements are never visible); everything else to `visible`.
    #[must_use]
    pub fn default_for(selector: &str) -> Self {
        let sel = selector.trim_start();
        if ["meta", "script", "link", "title"]
            .iter()
            .any(|p| sel.starts_with(p))
        {
            SelectorState::Attached
        } else {
            SelectorState::Visible
        }
    }
}

/// A selector plus the state it must reach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectorCheck {
    pub selector: String,
    pub state: SelectorState,
}

impl SelectorCheck {
    #[must_use]
    pub fn new(selector: impl Into<String>) -> Self {
        let selector = selector.into();
        let state = SelectorState::default_for(&selector);
        Self { selector, state }
    }

    #[must_use]
    pub fn with_state(mut self, state: SelectorState) -> Self {
        self.state = state;
        self
    }
}

impl<'de> Deserialize<'de> for SelectorCheck {
    /// Config accepts either a bare selector string or
    /// `{selector, state?}`; the state defaults per selector.
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Bare(String),
            Full {
                selector: String,
                #[serde(default)]
                state: Option<SelectorState>,
            },
        }

        Ok(match Wire::deserialize(deserializer)? {
            Wire::Bare(selector) => SelectorCheck::new(selector),
            Wire::Full { selector, state } => {
                let default = SelectorState::default_for(&selector);
                SelectorCheck {
                    selector,
                    state: state.unwrap_or(default),
                }
            }
        })
    }
}

fn default_upstream_header() -> String {
    "x-aipc-upstream".to_owned()
}

fn default_true() -> bool {
    true
}

/// Reverse-proxy upstream-header expectations for one domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyExpectations {
    #[serde(default = "default_upstream_header")]
    pub upstream_header: String,
    #[serde(default)]
    pub primary_upstreams: Vec<String>,
    #[serde(default)]
    pub backup_upstreams: Vec<String>,
    #[serde(default = "default_true")]
    pub alert_on_backup: bool,
    #[serde(default)]
    pub alert_on_missing: bool,
    #[serde(default = "default_true")]
    pub alert_on_unknown: bool,
}

fn default_expected_statuses() -> Vec<u16> {
    vec![200]
}

fn default_content_type() -> Option<String> {
    Some("application/json".to_owned())
}

fn default_method() -> String {
    "GET".to_owned()
}

/// One API contract assertion against `base_url + path` (or an absolute
/// `url`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiContractCheck {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_expected_statuses")]
    pub expected_status_codes: Vec<u16>,
    #[serde(default = "default_content_type")]
    pub expected_content_type_contains: Option<String>,
    #[serde(default)]
    pub json_paths_required: Vec<String>,
    #[serde(default)]
    pub json_paths_equal: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub max_elapsed_ms: Option<f64>,
    #[serde(default)]
    pub body_json: Option<serde_json::Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ApiContractCheck {
    /// Display name falls back to the path, then the URL.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.path.as_deref())
            .or(self.url.as_deref())
            .unwrap_or("api_check")
    }
}

/// A named multi-step browser flow run against a domain each cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticTransaction {
    pub name: String,
    pub steps: Vec<Step>,
}

fn default_http_timeout() -> f64 {
    15.0
}

fn default_browser_timeout() -> f64 {
    25.0
}

fn default_forbidden_text() -> Vec<String> {
    DEFAULT_MAINTENANCE_TEXT.iter().map(|s| (*s).to_owned()).collect()
}

/// Everything the probe layer needs to check one domain. Immutable per
/// cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSpec {
    pub domain: String,
    pub url: String,
    #[serde(default)]
    pub expected_title_contains: Option<String>,
    #[serde(default)]
    pub required_selectors_all: Vec<SelectorCheck>,
    #[serde(default)]
    pub required_selectors_any: Vec<SelectorCheck>,
    #[serde(default)]
    pub required_text_all: Vec<String>,
    #[serde(default = "default_forbidden_text")]
    pub forbidden_text_any: Vec<String>,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: f64,
    #[serde(default = "default_browser_timeout")]
    pub browser_timeout_seconds: f64,
    #[serde(default)]
    pub expected_final_host_suffix: Option<String>,
    #[serde(default)]
    pub allowed_status_codes: Option<Vec<u16>>,
    #[serde(default)]
    pub proxy: Option<ProxyExpectations>,
    #[serde(default)]
    pub api_contract_checks: Vec<ApiContractCheck>,
    #[serde(default)]
    pub synthetic_transactions: Vec<SyntheticTransaction>,
}

impl CheckSpec {
    #[must_use]
    pub fn new(domain: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            url: url.into(),
            expected_title_contains: None,
            required_selectors_all: Vec::new(),
            required_selectors_any: Vec::new(),
            required_text_all: Vec::new(),
            forbidden_text_any: default_forbidden_text(),
            http_timeout_seconds: default_http_timeout(),
            browser_timeout_seconds: default_browser_timeout(),
            expected_final_host_suffix: None,
            allowed_status_codes: None,
            proxy: None,
            api_contract_checks: Vec::new(),
            synthetic_transactions: Vec::new(),
        }
    }

    /// Whether a status code passes: the explicit list when configured,
    /// otherwise any 2xx or 3xx.
    #[must_use]
    pub fn status_allowed(&self, status: u16) -> bool {
        match &self.allowed_status_codes {
            Some(allowed) => allowed.contains(&status),
            None => (200..400).contains(&status),
        }
    }

    /// Whether a final host satisfies `expected_final_host_suffix`.
    #[must_use]
    pub fn final_host_allowed(&self, host: &str) -> bool {
        match &self.expected_final_host_suffix {
            Some(suffix) => {
                let host = host.to_lowercase();
                let suffix = suffix.to_lowercase();
                host == suffix || host.ends_with(&format!(".{suffix}")) || host.ends_with(&suffix)
            }
            None => true,
        }
    }

    /// Forbidden phrases found in already-normalized text.
    #[must_use]
    pub fn forbidden_hits(&self, normalized_text: &str) -> Vec<String> {
        self.forbidden_text_any
            .iter()
            .filter(|kw| !kw.is_empty() && normalized_text.contains(&kw.to_lowercase()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_state_defaults_by_prefix() {
        assert_eq!(SelectorState::default_for("meta[name=viewport]"), SelectorState::Attached);
        assert_eq!(SelectorState::default_for("  title"), SelectorState::Attached);
        assert_eq!(SelectorState::default_for("#app"), SelectorState::Visible);
    }

    #[test]
    fn selector_check_accepts_bare_strings() {
        let checks: Vec<SelectorCheck> =
            serde_json::from_str(r##"["#app", {"selector": "script#data", "state": "detached"}, {"selector": "link[rel=icon]"}]"##)
                .unwrap();
        assert_eq!(checks[0].state, SelectorState::Visible);
        assert_eq!(checks[1].state, SelectorState::Detached);
        assert_eq!(checks[2].state, SelectorState::Attached);
    }

    #[test]
    fn default_statuses_are_2xx_3xx() {
        let spec = CheckSpec::new("d", "https://d");
        assert!(spec.status_allowed(200));
        assert!(spec.status_allowed(301));
        assert!(!spec.status_allowed(404));

        let mut pinned = spec;
        pinned.allowed_status_codes = Some(vec![401]);
        assert!(pinned.status_allowed(401));
        assert!(!pinned.status_allowed(200));
    }

    #[test]
    fn final_host_suffix_matches() {
        let mut spec = CheckSpec::new("d", "https://d");
        spec.expected_final_host_suffix = Some("example.net".to_owned());
        assert!(spec.final_host_allowed("example.net"));
        assert!(spec.final_host_allowed("app.Example.NET"));
        assert!(!spec.final_host_allowed("example.org"));
    }

    #[test]
    fn forbidden_hits_use_normalized_text() {
        let spec = CheckSpec::new("d", "https://d");
        let text = normalize_text("We'll   be\nBACK soon");
        assert_eq!(spec.forbidden_hits(&text), vec!["we'll be back"]);
    }
}
