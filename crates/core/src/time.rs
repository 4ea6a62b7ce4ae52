//! Unix-seconds helpers shared by the monitor and the registry.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Current unix time in seconds.
#[must_use]
pub fn now_ts() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Parse a `disabled_until` style value into a unix timestamp.
///
/// Accepts unix seconds (number or numeric string), `YYYY-MM-DD` (midnight
/// UTC), and ISO-8601 datetimes with `Z`/offset or none (treated as UTC).
/// Null/empty/non-positive values yield `None`.
pub fn parse_until_ts(value: &serde_json::Value) -> Result<Option<f64>, String> {
    let s = match value {
        serde_json::Value::Null => return Ok(None),
        serde_json::Value::Number(n) => {
            let ts = n.as_f64().unwrap_or(0.0);
            return Ok((ts > 0.0).then_some(ts));
        }
        serde_json::Value::String(s) => s.trim(),
        other => return Err(format!("invalid_until: {other}")),
    };
    if s.is_empty() {
        return Ok(None);
    }

    if let Ok(ts) = s.parse::<f64>() {
        return Ok((ts > 0.0).then_some(ts));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        #[allow(clippy::cast_precision_loss)]
        return Ok(Some(dt.timestamp() as f64));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        #[allow(clippy::cast_precision_loss)]
        return Ok(Some(naive.and_utc().timestamp() as f64));
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc();
        #[allow(clippy::cast_precision_loss)]
        return Ok(Some(midnight.timestamp() as f64));
    }

    Err(format!("invalid_until: {s:?}"))
}

/// Render a unix timestamp for dashboards and alerts.
#[must_use]
pub fn format_ts(ts: f64) -> String {
    #[allow(clippy::cast_possible_truncation)]
    DateTime::<Utc>::from_timestamp(ts as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("{ts}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_pass_through() {
        assert_eq!(parse_until_ts(&json!(1_700_000_000)).unwrap(), Some(1_700_000_000.0));
        assert_eq!(parse_until_ts(&json!(0)).unwrap(), None);
        assert_eq!(parse_until_ts(&json!(null)).unwrap(), None);
    }

    #[test]
    fn numeric_strings_pass_through() {
        assert_eq!(parse_until_ts(&json!("1700000000.5")).unwrap(), Some(1_700_000_000.5));
        assert_eq!(parse_until_ts(&json!("  ")).unwrap(), None);
    }

    #[test]
    fn iso_dates_parse() {
        assert_eq!(
            parse_until_ts(&json!("2026-03-01")).unwrap(),
            Some(1_772_323_200.0)
        );
        assert_eq!(
            parse_until_ts(&json!("2026-03-01T00:00:00Z")).unwrap(),
            Some(1_772_323_200.0)
        );
        assert_eq!(
            parse_until_ts(&json!("2026-03-01T02:00:00+02:00")).unwrap(),
            Some(1_772_323_200.0)
        );
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_until_ts(&json!("next tuesday")).is_err());
        assert!(parse_until_ts(&json!({"at": 1})).is_err());
    }
}
