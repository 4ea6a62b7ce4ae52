//! Availability, latency percentile, SLO burn-rate and RED analytics over
//! sample windows.

use serde::{Deserialize, Serialize};

use crate::history::{History, window};
use crate::sample::{LatencyField, Sample};

/// Returns `(total, ok_count, ok_percent)`; the percentage is `None` for an
/// empty window.
#[must_use]
pub fn availability(samples: &[Sample]) -> (usize, usize, Option<f64>) {
    let total = samples.len();
    if total == 0 {
        return (0, 0, None);
    }
    let ok_count = samples.iter().filter(|s| s.ok).count();
    #[allow(clippy::cast_precision_loss)]
    let pct = (ok_count as f64 / total as f64) * 100.0;
    (total, ok_count, Some(pct))
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: usize, total: usize) -> f64 {
    part as f64 / total as f64
}

#[must_use]
pub fn error_rate_percent(samples: &[Sample]) -> Option<f64> {
    let (total, ok_count, _) = availability(samples);
    if total == 0 {
        return None;
    }
    Some(ratio(total - ok_count, total) * 100.0)
}

/// Nearest-rank percentile over the non-null latency values of a window.
///
/// `p <= 0` returns the minimum, `p >= 100` the maximum.
#[must_use]
pub fn latency_percentile_ms(samples: &[Sample], field: LatencyField, p: f64) -> Option<f64> {
    let mut values: Vec<f64> = samples.iter().filter_map(|s| s.latency_ms(field)).collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    if p <= 0.0 {
        return values.first().copied();
    }
    if p >= 100.0 {
        return values.last().copied();
    }
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let k = ((p / 100.0) * (values.len() - 1) as f64).round() as usize;
    values.get(k.min(values.len() - 1)).copied()
}

/// `error_rate / error_budget` where the budget is `1 - slo_target`.
///
/// Undefined (`None`) when the window is empty, the target is outside
/// `(0, 100)`, or the budget is not positive.
#[must_use]
pub fn burn_rate(samples: &[Sample], slo_target_percent: f64) -> Option<f64> {
    let (total, ok_count, _) = availability(samples);
    if total == 0 {
        return None;
    }
    if !(0.0 < slo_target_percent && slo_target_percent < 100.0) {
        return None;
    }
    let budget = 1.0 - (slo_target_percent / 100.0);
    if budget <= 0.0 {
        return None;
    }
    Some(ratio(total - ok_count, total) / budget)
}

/// Caps for the RED window check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedThresholds {
    pub window_minutes: u32,
    pub min_samples: usize,
    pub error_rate_max_percent: Option<f64>,
    pub http_p95_ms_max: Option<f64>,
    pub browser_p95_ms_max: Option<f64>,
}

/// One domain exceeding at least one RED cap inside the window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedViolation {
    pub domain: String,
    pub reasons: Vec<String>,
    pub total_samples: usize,
    pub error_rate_percent: Option<f64>,
    pub http_p95_ms: Option<f64>,
    pub browser_p95_ms: Option<f64>,
}

/// Emit one violation per domain whose window meets `min_samples` and
/// exceeds any configured cap. Sorted by domain.
#[must_use]
pub fn red_violations(history: &History, now_ts: f64, caps: &RedThresholds) -> Vec<RedViolation> {
    let cutoff = now_ts - f64::from(caps.window_minutes.max(1)) * 60.0;
    let mut out = Vec::new();

    for (domain, items) in history.iter() {
        let w = window(items, cutoff);
        if w.len() < caps.min_samples.max(1) {
            continue;
        }

        let mut reasons = Vec::new();
        let err_rate = error_rate_percent(w);
        if let (Some(max), Some(rate)) = (caps.error_rate_max_percent, err_rate) {
            if rate > max {
                reasons.push(format!("errors>{max:.2}%"));
            }
        }

        let http_p95 = latency_percentile_ms(w, LatencyField::Http, 95.0);
        if let (Some(max), Some(p95)) = (caps.http_p95_ms_max, http_p95) {
            if p95 > max {
                reasons.push(format!("http_p95>{}ms", max.round() as i64));
            }
        }

        let browser_p95 = latency_percentile_ms(w, LatencyField::Browser, 95.0);
        if let (Some(max), Some(p95)) = (caps.browser_p95_ms_max, browser_p95) {
            if p95 > max {
                reasons.push(format!("browser_p95>{}ms", max.round() as i64));
            }
        }

        if !reasons.is_empty() {
            out.push(RedViolation {
                domain: domain.to_owned(),
                reasons,
                total_samples: w.len(),
                error_rate_percent: err_rate,
                http_p95_ms: http_p95,
                browser_p95_ms: browser_p95,
            });
        }
    }

    out.sort_by(|a, b| a.domain.cmp(&b.domain));
    out
}

fn default_rule_name() -> String {
    "burn".to_owned()
}

fn default_short_window() -> u32 {
    5
}

fn default_long_window() -> u32 {
    60
}

fn default_short_burn() -> f64 {
    14.4
}

fn default_long_burn() -> f64 {
    6.0
}

fn default_min_samples() -> usize {
    5
}

/// A multi-window burn-rate rule in the Google SRE style: the violation
/// fires only when both the short and the long window burn too fast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BurnRateRule {
    #[serde(default = "default_rule_name")]
    pub name: String,
    #[serde(default = "default_short_window")]
    pub short_window_minutes: u32,
    #[serde(default = "default_long_window")]
    pub long_window_minutes: u32,
    #[serde(default = "default_short_burn")]
    pub short_burn_rate: f64,
    #[serde(default = "default_long_burn")]
    pub long_burn_rate: f64,
    #[serde(default = "default_min_samples")]
    pub min_samples_short: usize,
    #[serde(default = "default_min_samples")]
    pub min_samples_long: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloBurnViolation {
    pub domain: String,
    pub rule: String,
    pub short_window_minutes: u32,
    pub long_window_minutes: u32,
    pub short_burn_rate: f64,
    pub long_burn_rate: f64,
    pub short_availability_percent: Option<f64>,
    pub long_availability_percent: Option<f64>,
    pub short_total: usize,
    pub long_total: usize,
}

/// Evaluate every rule against every domain. Sorted by `(domain, rule)`.
#[must_use]
pub fn slo_burn_violations(
    history: &History,
    now_ts: f64,
    slo_target_percent: f64,
    rules: &[BurnRateRule],
) -> Vec<SloBurnViolation> {
    let mut out = Vec::new();

    for (domain, items) in history.iter() {
        if items.is_empty() {
            continue;
        }
        for rule in rules {
            if rule.short_window_minutes == 0 || rule.long_window_minutes == 0 {
                continue;
            }
            let short = window(items, now_ts - f64::from(rule.short_window_minutes) * 60.0);
            let long = window(items, now_ts - f64::from(rule.long_window_minutes) * 60.0);
            if short.len() < rule.min_samples_short || long.len() < rule.min_samples_long {
                continue;
            }
            let (Some(short_burn), Some(long_burn)) = (
                burn_rate(short, slo_target_percent),
                burn_rate(long, slo_target_percent),
            ) else {
                continue;
            };
            if short_burn >= rule.short_burn_rate && long_burn >= rule.long_burn_rate {
                let (_, _, short_pct) = availability(short);
                let (_, _, long_pct) = availability(long);
                out.push(SloBurnViolation {
                    domain: domain.to_owned(),
                    rule: rule.name.clone(),
                    short_window_minutes: rule.short_window_minutes,
                    long_window_minutes: rule.long_window_minutes,
                    short_burn_rate: short_burn,
                    long_burn_rate: long_burn,
                    short_availability_percent: short_pct,
                    long_availability_percent: long_pct,
                    short_total: short.len(),
                    long_total: long.len(),
                });
            }
        }
    }

    out.sort_by(|a, b| (a.domain.as_str(), a.rule.as_str()).cmp(&(b.domain.as_str(), b.rule.as_str())));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Sample;

    fn series(now: f64, spec: &[(f64, bool)]) -> History {
        let mut h = History::new();
        for (age_min, ok) in spec {
            h.append("d.example", Sample::new(now - age_min * 60.0, *ok));
        }
        h
    }

    #[test]
    fn percentile_edges() {
        let samples: Vec<Sample> = [10.0, 20.0, 30.0, 40.0]
            .iter()
            .map(|ms| Sample::new(1.0, true).with_latencies(Some(*ms), None))
            .collect();
        assert_eq!(latency_percentile_ms(&samples, LatencyField::Http, -5.0), Some(10.0));
        assert_eq!(latency_percentile_ms(&samples, LatencyField::Http, 150.0), Some(40.0));
        assert_eq!(latency_percentile_ms(&samples, LatencyField::Http, 50.0), Some(30.0));
        assert_eq!(latency_percentile_ms(&samples, LatencyField::Browser, 50.0), None);
    }

    #[test]
    fn burn_rate_undefined_cases() {
        assert_eq!(burn_rate(&[], 99.9), None);
        let samples = [Sample::new(1.0, false)];
        assert_eq!(burn_rate(&samples, 100.0), None);
        assert_eq!(burn_rate(&samples, 0.0), None);
    }

    #[test]
    fn burn_rate_is_error_rate_over_budget() {
        // 25% errors against a 99.9% target: 0.25 / 0.001 = 250.
        let samples: Vec<Sample> = (0..20)
            .map(|i| Sample::new(f64::from(i), i % 4 != 0))
            .collect();
        let burn = burn_rate(&samples, 99.9).unwrap();
        assert!((burn - 250.0).abs() < 1e-6);
    }

    #[test]
    fn red_reason_formatting() {
        let now = 1_000_000.0;
        let mut h = History::new();
        for i in 0..10 {
            h.append(
                "d.example",
                Sample::new(now - f64::from(i) * 30.0, i >= 6)
                    .with_latencies(Some(2000.0), Some(5000.0)),
            );
        }
        let caps = RedThresholds {
            window_minutes: 10,
            min_samples: 5,
            error_rate_max_percent: Some(5.0),
            http_p95_ms_max: Some(1500.0),
            browser_p95_ms_max: Some(4000.0),
        };
        let violations = red_violations(&h, now, &caps);
        assert_eq!(violations.len(), 1);
        assert_eq!(
            violations[0].reasons,
            vec!["errors>5.00%", "http_p95>1500ms", "browser_p95>4000ms"]
        );
    }

    #[test]
    fn red_respects_min_samples() {
        let now = 1_000.0;
        let h = series(now, &[(1.0, false), (2.0, false)]);
        let caps = RedThresholds {
            window_minutes: 10,
            min_samples: 5,
            error_rate_max_percent: Some(1.0),
            http_p95_ms_max: None,
            browser_p95_ms_max: None,
        };
        assert!(red_violations(&h, now, &caps).is_empty());
    }

    #[test]
    fn slo_burn_fires_when_both_windows_exceed() {
        // 20 samples over 20 minutes at 25% error rate, target 99.9%.
        let now = 10_000_000.0;
        let mut h = History::new();
        for i in 0..20 {
            h.append("d.example", Sample::new(now - f64::from(i) * 60.0, i % 4 != 0));
        }
        let rules = [BurnRateRule {
            name: "fast".to_owned(),
            short_window_minutes: 5,
            long_window_minutes: 10,
            short_burn_rate: 1.0,
            long_burn_rate: 1.0,
            min_samples_short: 5,
            min_samples_long: 5,
        }];
        let violations = slo_burn_violations(&h, now, 99.9, &rules);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, "fast");
    }

    #[test]
    fn slo_burn_sorted_by_domain_then_rule() {
        let now = 1_000_000.0;
        let mut h = History::new();
        for domain in ["b.example", "a.example"] {
            for i in 0..10 {
                h.append(domain, Sample::new(now - f64::from(i) * 60.0, false));
            }
        }
        let mk = |name: &str| BurnRateRule {
            name: name.to_owned(),
            short_window_minutes: 5,
            long_window_minutes: 10,
            short_burn_rate: 1.0,
            long_burn_rate: 1.0,
            min_samples_short: 2,
            min_samples_long: 2,
        };
        let violations = slo_burn_violations(&h, now, 99.0, &[mk("z"), mk("a")]);
        let keys: Vec<(String, String)> = violations
            .iter()
            .map(|v| (v.domain.clone(), v.rule.clone()))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(violations.len(), 4);
    }
}
