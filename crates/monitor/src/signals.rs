//! Fold raw check results into per-signal observations.
//!
//! Each cross-cutting check produces one [`SignalObservation`] per cycle;
//! the scheduler runs every observation through the shared debounce machine
//! and alerts on edges.

use std::collections::BTreeMap;

use serde_json::json;

use vigil_core::analytics::{RedViolation, SloBurnViolation};
use vigil_core::check::ProxyExpectations;
use vigil_core::signal::SignalKind;
use vigil_probe::containers::ContainerIssue;
use vigil_probe::dns::DnsCheckResult;
use vigil_probe::host::HostSnapshot;
use vigil_probe::http::HttpCheckOutcome;
use vigil_probe::synthetic::SyntheticOutcome;
use vigil_probe::tls::TlsCheckResult;
use vigil_probe::web_vitals::WebVitalsOutcome;

use crate::config::{HostConfig, PerformanceConfig, WebVitalsConfig};

/// One signal's verdict for the cycle.
#[derive(Debug, Clone)]
pub struct SignalObservation {
    pub kind: SignalKind,
    pub ok: bool,
    /// Human-readable summary used in alert bodies.
    pub summary: String,
    pub details: serde_json::Value,
}

impl SignalObservation {
    fn ok_for(kind: SignalKind) -> Self {
        Self {
            kind,
            ok: true,
            summary: String::new(),
            details: serde_json::Value::Null,
        }
    }
}

/// TLS: any failing certificate fails the signal.
#[must_use]
pub fn fold_tls(results: &[TlsCheckResult]) -> SignalObservation {
    let failing: Vec<&TlsCheckResult> = results.iter().filter(|r| !r.ok).collect();
    if failing.is_empty() {
        return SignalObservation::ok_for(SignalKind::Tls);
    }
    let lines: Vec<String> = failing
        .iter()
        .map(|r| format!("{}: {}", r.domain, r.error.as_deref().unwrap_or("tls_error")))
        .collect();
    SignalObservation {
        kind: SignalKind::Tls,
        ok: false,
        summary: lines.join("\n"),
        details: json!({ "failing": failing }),
    }
}

/// DNS: resolution failures fail the signal; pure drift is informational.
#[must_use]
pub fn fold_dns(results: &[DnsCheckResult]) -> SignalObservation {
    let failing: Vec<&DnsCheckResult> = results.iter().filter(|r| !r.ok).collect();
    let drifting: Vec<&str> = results
        .iter()
        .filter(|r| r.drift_detected)
        .map(|r| r.domain.as_str())
        .collect();
    if failing.is_empty() {
        let mut obs = SignalObservation::ok_for(SignalKind::Dns);
        if !drifting.is_empty() {
            obs.details = json!({ "drifting": drifting });
        }
        return obs;
    }
    let lines: Vec<String> = failing
        .iter()
        .map(|r| format!("{}: {}", r.domain, r.error.as_deref().unwrap_or("dns_error")))
        .collect();
    SignalObservation {
        kind: SignalKind::Dns,
        ok: false,
        summary: lines.join("\n"),
        details: json!({ "failing": failing, "drifting": drifting }),
    }
}

/// Container health: any flagged container fails the signal.
#[must_use]
pub fn fold_containers(issues: &[ContainerIssue]) -> SignalObservation {
    if issues.is_empty() {
        return SignalObservation::ok_for(SignalKind::ContainerHealth);
    }
    let lines: Vec<String> = issues
        .iter()
        .map(|i| {
            let why = i
                .error
                .clone()
                .or_else(|| i.health_status.clone().map(|h| format!("health={h}")))
                .or_else(|| i.restart_increase.map(|d| format!("restarts+{d}")))
                .or_else(|| i.running.map(|r| format!("running={r}")))
                .unwrap_or_else(|| "unhealthy".to_owned());
            format!("{}: {why}", i.name)
        })
        .collect();
    SignalObservation {
        kind: SignalKind::ContainerHealth,
        ok: false,
        summary: lines.join("\n"),
        details: json!({ "issues": issues }),
    }
}

/// Proxy upstream expectations, classified from captured HTTP headers.
#[must_use]
pub fn fold_proxy(
    specs: &[(String, ProxyExpectations)],
    http_outcomes: &BTreeMap<String, HttpCheckOutcome>,
) -> SignalObservation {
    let mut issues: Vec<serde_json::Value> = Vec::new();
    let mut lines: Vec<String> = Vec::new();

    for (domain, proxy) in specs {
        let Some(outcome) = http_outcomes.get(domain) else {
            continue;
        };
        let header = proxy.upstream_header.trim().to_lowercase();
        let value = outcome.captured_headers.get(&header).map(|v| v.trim().to_owned());

        match value {
            None => {
                if proxy.alert_on_missing {
                    lines.push(format!("{domain}: missing_upstream_header ({header})"));
                    issues.push(json!({
                        "domain": domain, "reason": "missing_upstream_header", "header": header,
                    }));
                }
            }
            Some(value) => {
                if proxy.primary_upstreams.iter().any(|u| u == &value) {
                    continue;
                }
                if proxy.backup_upstreams.iter().any(|u| u == &value) {
                    if proxy.alert_on_backup {
                        lines.push(format!("{domain}: backup_upstream_in_use ({value})"));
                        issues.push(json!({
                            "domain": domain, "reason": "backup_upstream_in_use", "value": value,
                        }));
                    }
                    continue;
                }
                if (!proxy.primary_upstreams.is_empty() || !proxy.backup_upstreams.is_empty())
                    && proxy.alert_on_unknown
                {
                    lines.push(format!("{domain}: unknown_upstream_value ({value})"));
                    issues.push(json!({
                        "domain": domain, "reason": "unknown_upstream_value", "value": value,
                    }));
                }
            }
        }
    }

    if issues.is_empty() {
        return SignalObservation::ok_for(SignalKind::Proxy);
    }
    SignalObservation {
        kind: SignalKind::Proxy,
        ok: false,
        summary: lines.join("\n"),
        details: json!({ "issues": issues }),
    }
}

/// Nginx log-tail analysis, folded into the proxy signal. Without a
/// configured 502/504 cap the stats are diagnostic only and ride along as
/// signal data.
#[must_use]
pub fn fold_nginx(
    access: Option<&vigil_probe::nginx::AccessWindowStats>,
    upstream_summary: &serde_json::Value,
    max_502_504: Option<usize>,
) -> SignalObservation {
    let details = json!({
        "access": access,
        "upstream_errors": upstream_summary,
    });

    if let (Some(stats), Some(max)) = (access, max_502_504) {
        if stats.status_502_504 > max {
            return SignalObservation {
                kind: SignalKind::Proxy,
                ok: false,
                summary: format!(
                    "nginx: {} 502/504 responses in window (total {}, 5xx {})",
                    stats.status_502_504, stats.total, stats.status_5xx
                ),
                details,
            };
        }
    }

    let mut obs = SignalObservation::ok_for(SignalKind::Proxy);
    obs.details = details;
    obs
}

/// Host snapshot against the configured thresholds.
#[must_use]
pub fn fold_host(snapshot: &HostSnapshot, config: &HostConfig) -> SignalObservation {
    let mut lines: Vec<String> = Vec::new();

    for (mount, used) in &snapshot.disk_used_percent {
        let threshold = config
            .per_mount_overrides
            .get(mount)
            .copied()
            .or(config.disk_used_percent_max);
        if let Some(max) = threshold {
            if *used > max {
                lines.push(format!("disk {mount}: {used:.1}% > {max:.1}%"));
            }
        }
    }
    if let (Some(max), Some(used)) = (config.mem_used_percent_max, snapshot.mem_used_percent) {
        if used > max {
            lines.push(format!("mem: {used:.1}% > {max:.1}%"));
        }
    }
    if let (Some(max), Some(used)) = (config.swap_used_percent_max, snapshot.swap_used_percent) {
        if used > max {
            lines.push(format!("swap: {used:.1}% > {max:.1}%"));
        }
    }
    if let (Some(max), Some(used)) = (config.cpu_used_percent_max, snapshot.cpu_used_percent) {
        if used > max {
            lines.push(format!("cpu: {used:.1}% > {max:.1}%"));
        }
    }
    if let (Some(max), Some(load)) = (config.load1_per_cpu_max, snapshot.load1_per_cpu) {
        if load > max {
            lines.push(format!("load1/cpu: {load:.2} > {max:.2}"));
        }
    }

    if lines.is_empty() {
        return SignalObservation::ok_for(SignalKind::HostHealth);
    }
    SignalObservation {
        kind: SignalKind::HostHealth,
        ok: false,
        summary: lines.join("\n"),
        details: serde_json::to_value(snapshot).unwrap_or_default(),
    }
}

/// Per-domain latency thresholds against this cycle's elapsed times.
#[must_use]
pub fn fold_performance(
    outcomes: &BTreeMap<String, (Option<f64>, Option<f64>)>,
    config: &PerformanceConfig,
) -> SignalObservation {
    let mut lines: Vec<String> = Vec::new();
    for (domain, (http_ms, browser_ms)) in outcomes {
        let thresholds = config.for_domain(domain);
        if let (Some(max), Some(ms)) = (thresholds.http_elapsed_ms_max, *http_ms) {
            if ms > max {
                lines.push(format!("{domain}: http {ms:.0}ms > {max:.0}ms"));
            }
        }
        if let (Some(max), Some(ms)) = (thresholds.browser_elapsed_ms_max, *browser_ms) {
            if ms > max {
                lines.push(format!("{domain}: browser {ms:.0}ms > {max:.0}ms"));
            }
        }
    }

    if lines.is_empty() {
        return SignalObservation::ok_for(SignalKind::Performance);
    }
    SignalObservation {
        kind: SignalKind::Performance,
        ok: false,
        summary: lines.join("\n"),
        details: serde_json::Value::Null,
    }
}

#[must_use]
pub fn fold_slo(violations: &[SloBurnViolation]) -> SignalObservation {
    if violations.is_empty() {
        return SignalObservation::ok_for(SignalKind::Slo);
    }
    let lines: Vec<String> = violations
        .iter()
        .map(|v| {
            format!(
                "{} [{}]: burn {:.1}x/{:.1}x over {}m/{}m",
                v.domain,
                v.rule,
                v.short_burn_rate,
                v.long_burn_rate,
                v.short_window_minutes,
                v.long_window_minutes
            )
        })
        .collect();
    SignalObservation {
        kind: SignalKind::Slo,
        ok: false,
        summary: lines.join("\n"),
        details: json!({ "violations": violations }),
    }
}

#[must_use]
pub fn fold_red(violations: &[RedViolation]) -> SignalObservation {
    if violations.is_empty() {
        return SignalObservation::ok_for(SignalKind::Red);
    }
    let lines: Vec<String> = violations
        .iter()
        .map(|v| format!("{}: {}", v.domain, v.reasons.join(", ")))
        .collect();
    SignalObservation {
        kind: SignalKind::Red,
        ok: false,
        summary: lines.join("\n"),
        details: json!({ "violations": violations }),
    }
}

/// Synthetic transactions: non-infra failures fail the signal; infra
/// errors are excluded (they feed the browser signal instead).
#[must_use]
pub fn fold_synthetics(outcomes: &[SyntheticOutcome]) -> SignalObservation {
    let failing: Vec<&SyntheticOutcome> = outcomes
        .iter()
        .filter(|o| !o.ok && !o.browser_infra_error)
        .collect();
    if failing.is_empty() {
        return SignalObservation::ok_for(SignalKind::Browser);
    }
    let lines: Vec<String> = failing
        .iter()
        .map(|o| {
            format!(
                "{} [{}]: {}",
                o.domain,
                o.name,
                o.error.as_deref().unwrap_or("failed")
            )
        })
        .collect();
    SignalObservation {
        kind: SignalKind::Browser,
        ok: false,
        summary: lines.join("\n"),
        details: json!({ "failing": failing }),
    }
}

/// Web vitals against the configured caps. Infra failures are neutral.
#[must_use]
pub fn fold_web_vitals(
    outcomes: &[WebVitalsOutcome],
    config: &WebVitalsConfig,
) -> SignalObservation {
    let mut lines: Vec<String> = Vec::new();
    for outcome in outcomes {
        if !outcome.ok {
            continue;
        }
        if let (Some(max), Some(lcp)) = (config.lcp_ms_max, outcome.metrics.lcp_ms) {
            if lcp > max {
                lines.push(format!("{}: lcp {lcp:.0}ms > {max:.0}ms", outcome.domain));
            }
        }
        if let (Some(max), Some(cls)) = (config.cls_max, outcome.metrics.cls) {
            if cls > max {
                lines.push(format!("{}: cls {cls:.3} > {max:.3}", outcome.domain));
            }
        }
        if let (Some(max), Some(inp)) = (config.inp_ms_max, outcome.metrics.inp_ms) {
            if inp > max {
                lines.push(format!("{}: inp {inp:.0}ms > {max:.0}ms", outcome.domain));
            }
        }
    }

    if lines.is_empty() {
        return SignalObservation::ok_for(SignalKind::Performance);
    }
    SignalObservation {
        kind: SignalKind::Performance,
        ok: false,
        summary: lines.join("\n"),
        details: serde_json::Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::check::ProxyExpectations;

    fn http_outcome_with_header(header: &str, value: &str) -> HttpCheckOutcome {
        HttpCheckOutcome {
            ok: true,
            status_code: Some(200),
            final_url: None,
            final_host: None,
            forbidden_hits: Vec::new(),
            captured_headers: [(header.to_owned(), value.to_owned())].into(),
            elapsed_ms: 10.0,
            error: None,
        }
    }

    fn proxy(primary: &[&str], backup: &[&str]) -> ProxyExpectations {
        serde_json::from_value(json!({
            "primary_upstreams": primary,
            "backup_upstreams": backup,
        }))
        .unwrap()
    }

    #[test]
    fn primary_upstream_is_clean() {
        let outcomes = [(
            "a.example".to_owned(),
            http_outcome_with_header("x-aipc-upstream", "blue"),
        )]
        .into();
        let obs = fold_proxy(&[("a.example".to_owned(), proxy(&["blue"], &["green"]))], &outcomes);
        assert!(obs.ok);
    }

    #[test]
    fn backup_upstream_alerts_by_default() {
        let outcomes = [(
            "a.example".to_owned(),
            http_outcome_with_header("x-aipc-upstream", "green"),
        )]
        .into();
        let obs = fold_proxy(&[("a.example".to_owned(), proxy(&["blue"], &["green"]))], &outcomes);
        assert!(!obs.ok);
        assert!(obs.summary.contains("backup_upstream_in_use"));
    }

    #[test]
    fn unknown_upstream_alerts() {
        let outcomes = [(
            "a.example".to_owned(),
            http_outcome_with_header("x-aipc-upstream", "purple"),
        )]
        .into();
        let obs = fold_proxy(&[("a.example".to_owned(), proxy(&["blue"], &[]))], &outcomes);
        assert!(!obs.ok);
        assert!(obs.summary.contains("unknown_upstream_value"));
    }

    #[test]
    fn missing_header_is_quiet_by_default() {
        let outcomes = [(
            "a.example".to_owned(),
            http_outcome_with_header("other", "x"),
        )]
        .into();
        let obs = fold_proxy(&[("a.example".to_owned(), proxy(&["blue"], &[]))], &outcomes);
        assert!(obs.ok);
    }

    #[test]
    fn host_thresholds_with_mount_override() {
        let mut snapshot = HostSnapshot::default();
        snapshot.disk_used_percent.insert("/".to_owned(), 91.0);
        snapshot.disk_used_percent.insert("/data".to_owned(), 91.0);
        snapshot.mem_used_percent = Some(50.0);

        let config = HostConfig {
            disk_used_percent_max: Some(95.0),
            per_mount_overrides: [("/data".to_owned(), 90.0)].into(),
            ..HostConfig::default()
        };
        let obs = fold_host(&snapshot, &config);
        assert!(!obs.ok);
        assert!(obs.summary.contains("/data"));
        assert!(!obs.summary.contains("disk /:"));
    }

    #[test]
    fn infra_synthetics_are_neutral() {
        let outcomes = vec![SyntheticOutcome {
            domain: "a.example".to_owned(),
            name: "login".to_owned(),
            ok: false,
            elapsed_ms: 10.0,
            error: Some("Page crashed".to_owned()),
            failed_step: Some(0),
            final_url: None,
            browser_infra_error: true,
        }];
        assert!(fold_synthetics(&outcomes).ok);
    }
}
