//! Nginx access/error log tail analysis.

use std::collections::BTreeMap;
use std::io::Read;
use std::io::Seek;
use std::path::Path;
use std::sync::LazyLock;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;

static ACCESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^\S+\s+\S+\s+\S+\s+\[(?P<ts>[^\]]+)\]\s+"(?P<req>[^"]*)"\s+(?P<status>\d{3})\s+\S+\s+"[^"]*"\s+"[^"]*""#,
    )
    .unwrap()
});

static ERROR_TS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<ts>\d{4}/\d{2}/\d{2}\s+\d{2}:\d{2}:\d{2})\s+\[(?P<level>\w+)\]\s+").unwrap()
});

/// Best-effort tail read. `.gz` rotations are decompressed whole, so keep
/// `max_bytes` small for compressed paths.
#[must_use]
pub fn tail_bytes(path: &Path, max_bytes: usize) -> String {
    let max_bytes = max_bytes.max(1);
    if !path.exists() {
        return String::new();
    }

    if path.extension().is_some_and(|e| e == "gz") {
        let Ok(file) = std::fs::File::open(path) else {
            return String::new();
        };
        let mut text = String::new();
        if flate2::read::GzDecoder::new(file)
            .read_to_string(&mut text)
            .is_err()
        {
            return String::new();
        }
        let start = text.len().saturating_sub(max_bytes);
        return text
            .get(start..)
            .map(str::to_owned)
            .unwrap_or_else(|| text.chars().skip(start).collect());
    }

    let Ok(mut file) = std::fs::File::open(path) else {
        return String::new();
    };
    let Ok(size) = file.seek(std::io::SeekFrom::End(0)) else {
        return String::new();
    };
    let n = (max_bytes as u64).min(size);
    if file.seek(std::io::SeekFrom::Start(size - n)).is_err() {
        return String::new();
    }
    let mut raw = Vec::with_capacity(usize::try_from(n).unwrap_or(0));
    if file.read_to_end(&mut raw).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&raw).into_owned()
}

/// Status-code counts over a trailing window of the access log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessWindowStats {
    pub total: usize,
    pub status_5xx: usize,
    pub status_502_504: usize,
    pub status_4xx: usize,
    pub sample_lines: Vec<String>,
}

/// Walk the access-log tail backwards and count statuses inside the
/// window. Up to 8 sample 502/503/504 lines are kept for alerts. Returns
/// `None` for a missing or empty log.
#[must_use]
pub fn access_window_stats(
    access_log_path: &Path,
    now: DateTime<Utc>,
    window_seconds: u64,
    max_bytes: usize,
) -> Option<AccessWindowStats> {
    let text = tail_bytes(access_log_path, max_bytes);
    if text.trim().is_empty() {
        return None;
    }

    #[allow(clippy::cast_precision_loss)]
    let cutoff = now.timestamp() - i64::try_from(window_seconds.max(1)).unwrap_or(1);
    let mut stats = AccessWindowStats {
        total: 0,
        status_5xx: 0,
        status_502_504: 0,
        status_4xx: 0,
        sample_lines: Vec::new(),
    };

    for line in text.lines().rev() {
        let Some(caps) = ACCESS_RE.captures(line.trim()) else {
            continue;
        };
        let Ok(ts) = DateTime::parse_from_str(&caps["ts"], "%d/%b/%Y:%H:%M:%S %z") else {
            continue;
        };
        if ts.timestamp() < cutoff {
            break;
        }

        let status: u16 = caps["status"].parse().unwrap_or(0);
        stats.total += 1;
        if (500..600).contains(&status) {
            stats.status_5xx += 1;
        }
        if status == 502 || status == 504 {
            stats.status_502_504 += 1;
        }
        if (400..500).contains(&status) {
            stats.status_4xx += 1;
        }
        if matches!(status, 502 | 503 | 504) && stats.sample_lines.len() < 8 {
            stats.sample_lines.push(line.trim().chars().take(800).collect());
        }
    }

    stats.sample_lines.reverse();
    Some(stats)
}

/// One upstream failure event from the error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamErrorEvent {
    pub ts: String,
    pub level: String,
    pub server: Option<String>,
    pub upstream: Option<String>,
    pub message: String,
}

fn extract_kv(line: &str, key: &str) -> Option<String> {
    let marker = format!("{key}: ");
    let rest = line.split_once(&marker)?.1;
    let value = rest.split(',').next().unwrap_or(rest).trim().trim_matches('"');
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}

/// Parse recent upstream-failure events from the error-log tail.
///
/// Error-log timestamps carry no zone; they are interpreted in the host's
/// local time, matching how nginx writes them.
#[must_use]
pub fn recent_upstream_errors(
    error_log_path: &Path,
    now: DateTime<Utc>,
    window_seconds: u64,
    max_bytes: usize,
    max_events: usize,
) -> Vec<UpstreamErrorEvent> {
    let text = tail_bytes(error_log_path, max_bytes);
    if text.trim().is_empty() {
        return Vec::new();
    }

    let cutoff = now.timestamp() - i64::try_from(window_seconds.max(1)).unwrap_or(1);
    let mut events = Vec::new();

    for line in text.lines().rev() {
        let s = line.trim();
        if s.is_empty() {
            continue;
        }
        let Some(caps) = ERROR_TS_RE.captures(s) else {
            continue;
        };
        let Ok(naive) = NaiveDateTime::parse_from_str(&caps["ts"], "%Y/%m/%d %H:%M:%S") else {
            continue;
        };
        let Some(ts) = Local.from_local_datetime(&naive).single() else {
            continue;
        };
        if ts.timestamp() < cutoff {
            break;
        }

        let lower = s.to_lowercase();
        if !lower.contains("upstream") && !lower.contains("connect()") {
            continue;
        }
        if lower.contains("upstream response is buffered") {
            continue;
        }
        if !["timed out", "failed", "refused", "no live upstreams", "upstream prematurely closed"]
            .iter()
            .any(|marker| lower.contains(marker))
        {
            continue;
        }

        events.push(UpstreamErrorEvent {
            ts: caps["ts"].to_owned(),
            level: caps["level"].to_owned(),
            server: extract_kv(s, "server"),
            upstream: extract_kv(s, "upstream"),
            message: s.chars().take(1000).collect(),
        });
        if events.len() >= max_events {
            break;
        }
    }

    events.reverse();
    events
}

/// Roll events up by server with up to 3 sample messages each.
#[must_use]
pub fn summarize_upstream_errors(events: &[UpstreamErrorEvent]) -> serde_json::Value {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut samples: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for event in events {
        let server = event.server.clone().unwrap_or_else(|| "(unknown)".to_owned());
        *counts.entry(server.clone()).or_default() += 1;
        let entry = samples.entry(server).or_default();
        if entry.len() < 3 {
            entry.push(event.message.clone());
        }
    }
    serde_json::json!({
        "counts_by_server": counts,
        "samples_by_server": samples,
    })
}
