//! Monitor YAML configuration.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;

use serde::Deserialize;

use vigil_core::analytics::BurnRateRule;
use vigil_core::check::{
    ApiContractCheck, CheckSpec, ProxyExpectations, SelectorCheck, SyntheticTransaction,
};
use vigil_core::debounce::DebounceConfig;

use crate::error::MonitorError;

/// The dispatcher's own domain must never be probed by the monitor; an
/// investigation of a dispatcher outage would be queued on the dispatcher.
pub const FORCE_DISABLED_DOMAINS: [&str; 1] = ["dispatch.pitchai.net"];

fn default_interval_seconds() -> u64 {
    60
}

fn default_retention_days() -> f64 {
    7.0
}

fn default_browser_concurrency() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HistoryConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: f64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PerformanceThresholds {
    #[serde(default)]
    pub http_elapsed_ms_max: Option<f64>,
    #[serde(default)]
    pub browser_elapsed_ms_max: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PerformanceConfig {
    #[serde(flatten)]
    pub thresholds: PerformanceThresholds,
    #[serde(default)]
    pub per_domain_overrides: BTreeMap<String, PerformanceThresholds>,
}

impl PerformanceConfig {
    /// Effective thresholds for one domain.
    #[must_use]
    pub fn for_domain(&self, domain: &str) -> PerformanceThresholds {
        let overrides = self.per_domain_overrides.get(domain);
        PerformanceThresholds {
            http_elapsed_ms_max: overrides
                .and_then(|o| o.http_elapsed_ms_max)
                .or(self.thresholds.http_elapsed_ms_max),
            browser_elapsed_ms_max: overrides
                .and_then(|o| o.browser_elapsed_ms_max)
                .or(self.thresholds.browser_elapsed_ms_max),
        }
    }
}

fn default_slo_target() -> f64 {
    99.9
}

#[derive(Debug, Clone, Deserialize)]
pub struct SloConfig {
    #[serde(default = "default_slo_target")]
    pub target_percent: f64,
    #[serde(default)]
    pub burn_rate_rules: Vec<BurnRateRule>,
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            target_percent: default_slo_target(),
            burn_rate_rules: Vec::new(),
        }
    }
}

fn default_red_window() -> u32 {
    30
}

fn default_red_min_samples() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedConfig {
    #[serde(default = "default_red_window")]
    pub window_minutes: u32,
    #[serde(default = "default_red_min_samples")]
    pub min_samples: usize,
    #[serde(default)]
    pub error_rate_max_percent: Option<f64>,
    #[serde(default)]
    pub http_p95_ms_max: Option<f64>,
    #[serde(default)]
    pub browser_p95_ms_max: Option<f64>,
}

impl Default for RedConfig {
    fn default() -> Self {
        Self {
            window_minutes: default_red_window(),
            min_samples: default_red_min_samples(),
            error_rate_max_percent: None,
            http_p95_ms_max: None,
            browser_p95_ms_max: None,
        }
    }
}

fn default_tls_min_days() -> f64 {
    14.0
}

fn default_tls_timeout() -> f64 {
    10.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_tls_min_days")]
    pub min_days_valid: f64,
    #[serde(default = "default_tls_timeout")]
    pub timeout_seconds: f64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            min_days_valid: default_tls_min_days(),
            timeout_seconds: default_tls_timeout(),
        }
    }
}

fn default_dns_timeout() -> f64 {
    5.0
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    #[serde(default)]
    pub resolvers: Vec<IpAddr>,
    #[serde(default = "default_dns_timeout")]
    pub timeout_seconds: f64,
    #[serde(default = "default_true")]
    pub require_ipv4: bool,
    #[serde(default)]
    pub require_ipv6: bool,
    #[serde(default)]
    pub expected_ips_by_domain: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub alert_on_drift_by_domain: BTreeMap<String, bool>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            resolvers: Vec::new(),
            timeout_seconds: default_dns_timeout(),
            require_ipv4: true,
            require_ipv6: false,
            expected_ips_by_domain: BTreeMap::new(),
            alert_on_drift_by_domain: BTreeMap::new(),
        }
    }
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerMonitoringConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_docker_socket")]
    pub socket_path: String,
    #[serde(default)]
    pub include_name_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_name_patterns: Vec<String>,
    #[serde(default)]
    pub monitor_all: bool,
}

impl Default for ContainerMonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            socket_path: default_docker_socket(),
            include_name_patterns: Vec::new(),
            exclude_name_patterns: Vec::new(),
            monitor_all: false,
        }
    }
}

fn default_disk_paths() -> Vec<String> {
    vec!["/".to_owned()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_disk_paths")]
    pub disk_paths: Vec<String>,
    #[serde(default)]
    pub disk_used_percent_max: Option<f64>,
    /// Per-mount overrides of the disk threshold.
    #[serde(default)]
    pub per_mount_overrides: BTreeMap<String, f64>,
    #[serde(default)]
    pub mem_used_percent_max: Option<f64>,
    #[serde(default)]
    pub swap_used_percent_max: Option<f64>,
    #[serde(default)]
    pub cpu_used_percent_max: Option<f64>,
    #[serde(default)]
    pub load1_per_cpu_max: Option<f64>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            disk_paths: default_disk_paths(),
            disk_used_percent_max: None,
            per_mount_overrides: BTreeMap::new(),
            mem_used_percent_max: None,
            swap_used_percent_max: None,
            cpu_used_percent_max: None,
            load1_per_cpu_max: None,
        }
    }
}

fn default_nginx_window() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct NginxConfig {
    #[serde(default)]
    pub access_log_path: Option<String>,
    #[serde(default)]
    pub error_log_path: Option<String>,
    #[serde(default = "default_nginx_window")]
    pub window_seconds: u64,
    /// When set, more 502/504 responses than this inside the window fail
    /// the proxy signal; unset keeps the log analysis diagnostic-only.
    #[serde(default)]
    pub max_502_504: Option<usize>,
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            access_log_path: None,
            error_log_path: None,
            window_seconds: default_nginx_window(),
            max_502_504: None,
        }
    }
}

fn default_vitals_timeout() -> f64 {
    45.0
}

fn default_vitals_wait_ms() -> u64 {
    4_500
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebVitalsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_vitals_timeout")]
    pub timeout_seconds: f64,
    #[serde(default = "default_vitals_wait_ms")]
    pub post_load_wait_ms: u64,
    #[serde(default)]
    pub lcp_ms_max: Option<f64>,
    #[serde(default)]
    pub cls_max: Option<f64>,
    #[serde(default)]
    pub inp_ms_max: Option<f64>,
    /// Domains to measure; all enabled domains when empty.
    #[serde(default)]
    pub domains: Vec<String>,
}

impl Default for WebVitalsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_seconds: default_vitals_timeout(),
            post_load_wait_ms: default_vitals_wait_ms(),
            lcp_ms_max: None,
            cls_max: None,
            inp_ms_max: None,
            domains: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertingConfig {
    #[serde(flatten)]
    pub debounce: DebounceConfig,
    #[serde(default = "default_true")]
    pub notify_on_recovery: bool,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            debounce: DebounceConfig::default(),
            notify_on_recovery: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DispatchMonitorConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrowserConfig {
    #[serde(default = "default_browser_concurrency")]
    pub concurrency: usize,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            concurrency: default_browser_concurrency(),
        }
    }
}

/// Inline per-domain check overrides (`check:` block in the config).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct InlineCheck {
    #[serde(default)]
    pub expected_title_contains: Option<String>,
    #[serde(default)]
    pub required_selectors_all: Vec<SelectorCheck>,
    #[serde(default)]
    pub required_selectors_any: Vec<SelectorCheck>,
    #[serde(default)]
    pub required_text_all: Vec<String>,
    #[serde(default)]
    pub forbidden_text_any: Option<Vec<String>>,
    #[serde(default)]
    pub http_timeout_seconds: Option<f64>,
    #[serde(default)]
    pub browser_timeout_seconds: Option<f64>,
    #[serde(default)]
    pub expected_final_host_suffix: Option<String>,
    #[serde(default)]
    pub allowed_status_codes: Option<Vec<u16>>,
}

/// A `domains:` list entry: either a bare name or a full object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DomainConfig {
    Name(String),
    Full(Box<DomainConfigFull>),
}

#[derive(Debug, Clone, Deserialize)]
struct DomainConfigFull {
    domain: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    disabled_reason: Option<String>,
    #[serde(default)]
    disabled_until: Option<serde_json::Value>,
    #[serde(default)]
    check: Option<InlineCheck>,
    #[serde(default)]
    proxy: Option<ProxyExpectations>,
    #[serde(default)]
    api_contract_checks: Vec<ApiContractCheck>,
    #[serde(default)]
    synthetic_transactions: Vec<SyntheticTransaction>,
}

/// A resolved domain entry: the immutable check spec plus disablement.
#[derive(Debug, Clone)]
pub struct DomainEntry {
    pub spec: CheckSpec,
    pub disabled: bool,
    pub disabled_reason: Option<String>,
    pub disabled_until_ts: Option<f64>,
}

impl DomainEntry {
    /// Whether this domain should be probed at `now`. Expired
    /// `disabled_until` values auto-clear.
    #[must_use]
    pub fn enabled_at(&self, now_ts: f64) -> bool {
        if self.disabled {
            return false;
        }
        match self.disabled_until_ts {
            Some(until) => until <= now_ts,
            None => true,
        }
    }
}

/// The whole monitor configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub slo: SloConfig,
    #[serde(default)]
    pub red: RedConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub container_monitoring: ContainerMonitoringConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub nginx: NginxConfig,
    #[serde(default)]
    pub web_vitals: WebVitalsConfig,
    #[serde(default)]
    pub alerting: AlertingConfig,
    #[serde(default)]
    pub dispatch: DispatchMonitorConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    domains: Vec<DomainConfig>,
    #[serde(skip)]
    resolved_domains: Vec<DomainEntry>,
}

impl MonitorConfig {
    #[must_use]
    pub fn domains(&self) -> &[DomainEntry] {
        &self.resolved_domains
    }

    /// Domains whose disablement does not apply at `now`.
    #[must_use]
    pub fn enabled_domains(&self, now_ts: f64) -> Vec<&DomainEntry> {
        self.resolved_domains
            .iter()
            .filter(|d| d.enabled_at(now_ts))
            .collect()
    }

    fn resolve(&mut self) -> Result<(), MonitorError> {
        let mut resolved = Vec::with_capacity(self.domains.len());
        for entry in &self.domains {
            resolved.push(resolve_domain(entry)?);
        }
        self.resolved_domains = resolved;
        Ok(())
    }
}

fn resolve_domain(entry: &DomainConfig) -> Result<DomainEntry, MonitorError> {
    let full: DomainConfigFull = match entry {
        DomainConfig::Name(name) => DomainConfigFull {
            domain: name.clone(),
            url: None,
            disabled: false,
            disabled_reason: None,
            disabled_until: None,
            check: None,
            proxy: None,
            api_contract_checks: Vec::new(),
            synthetic_transactions: Vec::new(),
        },
        DomainConfig::Full(full) => (**full).clone(),
    };

    let domain = full.domain.trim().to_lowercase();
    if domain.is_empty() {
        return Err(MonitorError::Config("empty domain name".to_owned()));
    }
    let url = full
        .url
        .clone()
        .unwrap_or_else(|| format!("https://{domain}/"));

    let mut spec = CheckSpec::new(domain.clone(), url);
    if let Some(check) = full.check {
        spec.expected_title_contains = check.expected_title_contains;
        spec.required_selectors_all = check.required_selectors_all;
        spec.required_selectors_any = check.required_selectors_any;
        spec.required_text_all = check.required_text_all;
        if let Some(forbidden) = check.forbidden_text_any {
            spec.forbidden_text_any = forbidden;
        }
        if let Some(t) = check.http_timeout_seconds {
            spec.http_timeout_seconds = t;
        }
        if let Some(t) = check.browser_timeout_seconds {
            spec.browser_timeout_seconds = t;
        }
        spec.expected_final_host_suffix = check.expected_final_host_suffix;
        spec.allowed_status_codes = check.allowed_status_codes;
    }
    spec.proxy = full.proxy;
    spec.api_contract_checks = full.api_contract_checks;
    spec.synthetic_transactions = full.synthetic_transactions;

    let mut disabled = full.disabled;
    let mut disabled_reason = full.disabled_reason;
    if FORCE_DISABLED_DOMAINS.contains(&domain.as_str()) {
        disabled = true;
        disabled_reason = Some("force-disabled by policy".to_owned());
    }

    let disabled_until_ts = match &full.disabled_until {
        Some(value) => vigil_core::time::parse_until_ts(value).map_err(MonitorError::Config)?,
        None => None,
    };

    Ok(DomainEntry {
        spec,
        disabled,
        disabled_reason,
        disabled_until_ts,
    })
}

/// Load and resolve the YAML config file.
pub fn load_config(path: &Path) -> Result<MonitorConfig, MonitorError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse a YAML config document.
pub fn parse_config(contents: &str) -> Result<MonitorConfig, MonitorError> {
    let mut config: MonitorConfig = serde_yaml_ng::from_str(contents)
        .map_err(|e| MonitorError::Config(format!("invalid config: {e}")))?;
    if config.domains.is_empty() {
        return Err(MonitorError::Config("config must contain a non-empty 'domains' list".to_owned()));
    }
    config.resolve()?;
    Ok(config)
}
