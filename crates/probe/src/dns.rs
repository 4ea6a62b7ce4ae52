//! DNS resolution and drift checks.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;

use hickory_resolver::Resolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use serde::Serialize;
use tracing::debug;

/// Resolver settings shared by all domains in a cycle.
#[derive(Debug, Clone, Default)]
pub struct DnsCheckConfig {
    /// Resolver IPs; the system configuration is used when empty.
    pub resolvers: Vec<IpAddr>,
    pub timeout_seconds: f64,
    pub require_ipv4: bool,
    pub require_ipv6: bool,
}

/// Per-domain resolution verdict.
#[derive(Debug, Clone, Serialize)]
pub struct DnsCheckResult {
    pub domain: String,
    pub ok: bool,
    pub a_records: Vec<String>,
    pub aaaa_records: Vec<String>,
    pub error: Option<String>,
    pub drift_detected: bool,
    pub expected_ips: Option<Vec<String>>,
}

type TokioResolver = Resolver<TokioConnectionProvider>;

fn build_resolver(config: &DnsCheckConfig) -> Result<TokioResolver, String> {
    let timeout = Duration::from_secs_f64(config.timeout_seconds.clamp(0.5, 60.0));
    let mut builder = if config.resolvers.is_empty() {
        Resolver::builder_tokio().map_err(|e| e.to_string())?
    } else {
        let group = NameServerConfigGroup::from_ips_clear(&config.resolvers, 53, true);
        Resolver::builder_with_config(
            ResolverConfig::from_parts(None, Vec::new(), group),
            TokioConnectionProvider::default(),
        )
    };
    builder.options_mut().timeout = timeout;
    builder.options_mut().attempts = 1;
    Ok(builder.build())
}

fn push_err(err: &mut Option<String>, msg: &str) {
    match err {
        Some(existing) => {
            existing.push_str("; ");
            existing.push_str(msg);
        }
        None => *err = Some(msg.to_owned()),
    }
}

/// Resolve A and AAAA for one domain and judge it.
///
/// `previous_ips` feeds drift detection: a change against a non-empty
/// previous set flags `drift_detected`, and fails the check only when
/// `alert_on_drift` is set. An `expected_ips` set fails the check when the
/// intersection with the current answers is empty. The two conditions are
/// independent; expected-mismatch is reported before drift.
#[allow(clippy::too_many_arguments)]
pub async fn check_dns(
    config: &DnsCheckConfig,
    domain: &str,
    previous_ips: &[String],
    expected_ips: &[String],
    alert_on_drift: bool,
) -> DnsCheckResult {
    let domain = domain.trim().to_lowercase();

    let resolver = match build_resolver(config) {
        Ok(r) => r,
        Err(e) => {
            return DnsCheckResult {
                domain,
                ok: false,
                a_records: Vec::new(),
                aaaa_records: Vec::new(),
                error: Some(format!("resolver_init_failed: {e}")),
                drift_detected: false,
                expected_ips: None,
            };
        }
    };

    let mut error: Option<String> = None;

    let a_set: BTreeSet<String> = match resolver.ipv4_lookup(domain.clone()).await {
        Ok(lookup) => lookup.iter().map(|r| r.0.to_string()).collect(),
        Err(e) if e.is_no_records_found() => BTreeSet::new(),
        Err(e) => {
            push_err(&mut error, &format!("A: {e}"));
            BTreeSet::new()
        }
    };
    let aaaa_set: BTreeSet<String> = match resolver.ipv6_lookup(domain.clone()).await {
        Ok(lookup) => lookup.iter().map(|r| r.0.to_string()).collect(),
        Err(e) if e.is_no_records_found() => BTreeSet::new(),
        Err(e) => {
            push_err(&mut error, &format!("AAAA: {e}"));
            BTreeSet::new()
        }
    };

    let current: BTreeSet<String> = a_set.union(&aaaa_set).cloned().collect();
    let mut ok = true;

    if config.require_ipv4 && a_set.is_empty() {
        ok = false;
        push_err(&mut error, "missing_A_record");
    }
    if config.require_ipv6 && aaaa_set.is_empty() {
        ok = false;
        push_err(&mut error, "missing_AAAA_record");
    }
    if current.is_empty() {
        ok = false;
        if error.is_none() {
            push_err(&mut error, "no_dns_records");
        }
    }

    let expected: BTreeSet<String> = expected_ips
        .iter()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .collect();
    if !expected.is_empty() && current.intersection(&expected).next().is_none() {
        ok = false;
        push_err(&mut error, "expected_ip_mismatch");
    }

    let previous: BTreeSet<String> = previous_ips
        .iter()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .collect();
    let mut drift_detected = false;
    if !previous.is_empty() && !current.is_empty() && current != previous {
        drift_detected = true;
        debug!(domain = %domain, "dns drift detected");
        if alert_on_drift {
            ok = false;
            push_err(&mut error, "drift_detected");
        }
    }

    DnsCheckResult {
        domain,
        ok,
        a_records: a_set.into_iter().collect(),
        aaaa_records: aaaa_set.into_iter().collect(),
        error,
        drift_detected,
        expected_ips: if expected.is_empty() {
            None
        } else {
            Some(expected.into_iter().collect())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Result-shape checks; live resolution is covered by integration runs.

    fn result_with(current: &[&str], previous: &[&str], expected: &[&str], alert_on_drift: bool) -> DnsCheckResult {
        // Reimplements the judgement half on a fixed answer set.
        let current: BTreeSet<String> = current.iter().map(|s| (*s).to_owned()).collect();
        let previous: BTreeSet<String> = previous.iter().map(|s| (*s).to_owned()).collect();
        let expected_set: BTreeSet<String> = expected.iter().map(|s| (*s).to_owned()).collect();

        let mut ok = !current.is_empty();
        let mut error: Option<String> = if ok { None } else { Some("no_dns_records".to_owned()) };
        if !expected_set.is_empty() && current.intersection(&expected_set).next().is_none() {
            ok = false;
            push_err(&mut error, "expected_ip_mismatch");
        }
        let mut drift_detected = false;
        if !previous.is_empty() && !current.is_empty() && current != previous {
            drift_detected = true;
            if alert_on_drift {
                ok = false;
                push_err(&mut error, "drift_detected");
            }
        }
        DnsCheckResult {
            domain: "d".to_owned(),
            ok,
            a_records: current.iter().cloned().collect(),
            aaaa_records: Vec::new(),
            error,
            drift_detected,
            expected_ips: if expected_set.is_empty() { None } else { Some(expected_set.into_iter().collect()) },
        }
    }

    #[test]
    fn drift_without_alerting_keeps_ok() {
        let r = result_with(&["1.1.1.1"], &["2.2.2.2"], &[], false);
        assert!(r.ok);
        assert!(r.drift_detected);
    }

    #[test]
    fn drift_with_alerting_fails() {
        let r = result_with(&["1.1.1.1"], &["2.2.2.2"], &[], true);
        assert!(!r.ok);
        assert_eq!(r.error.as_deref(), Some("drift_detected"));
    }

    #[test]
    fn expected_mismatch_reported_before_drift() {
        let r = result_with(&["1.1.1.1"], &["2.2.2.2"], &["3.3.3.3"], true);
        assert!(!r.ok);
        assert_eq!(r.error.as_deref(), Some("expected_ip_mismatch; drift_detected"));
    }

    #[test]
    fn expected_intersection_passes() {
        let r = result_with(&["1.1.1.1", "9.9.9.9"], &[], &["9.9.9.9"], false);
        assert!(r.ok);
    }
}
