//! Rolling per-domain sample history.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::sample::Sample;

/// Ordered sample series keyed by domain.
///
/// Samples are kept sorted by `ts` ascending; duplicates by `ts` are
/// permitted. Appends in cycle order are O(1); out-of-order appends fall
/// back to a sorted insert.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct History(BTreeMap<String, Vec<Sample>>);

impl History {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    #[must_use]
    pub fn samples(&self, domain: &str) -> &[Sample] {
        self.0.get(domain).map_or(&[], Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Sample])> {
        self.0.iter().map(|(d, s)| (d.as_str(), s.as_slice()))
    }

    /// Append a sample, keeping the series sorted by `ts`.
    pub fn append(&mut self, domain: &str, sample: Sample) {
        if domain.is_empty() {
            return;
        }
        let items = self.0.entry(domain.to_owned()).or_default();
        match items.last() {
            Some(last) if last.ts > sample.ts => {
                let idx = items.partition_point(|s| s.ts < sample.ts);
                items.insert(idx, sample);
            }
            _ => items.push(sample),
        }
    }

    /// Drop samples with `ts < before_ts`; domains left empty are removed.
    pub fn prune(&mut self, before_ts: f64) {
        self.0.retain(|_, items| {
            let idx = items.partition_point(|s| s.ts < before_ts);
            if idx > 0 {
                items.drain(..idx);
            }
            !items.is_empty()
        });
    }
}

impl<'de> Deserialize<'de> for History {
    /// Best-effort decode for history loaded from the state file.
    ///
    /// Invalid entries are skipped so a partial write or an older format
    /// never prevents the monitor from starting.
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(coerce_history(&raw))
    }
}

/// Decode a raw JSON value into a [`History`], skipping malformed entries
/// and re-sorting each series.
#[must_use]
pub fn coerce_history(raw: &serde_json::Value) -> History {
    let mut out = BTreeMap::new();
    let Some(map) = raw.as_object() else {
        return History(out);
    };
    for (domain, items) in map {
        if domain.is_empty() {
            continue;
        }
        let Some(items) = items.as_array() else {
            continue;
        };
        let mut samples: Vec<Sample> = items
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect();
        samples.sort_by(|a, b| a.ts.total_cmp(&b.ts));
        if !samples.is_empty() {
            out.insert(domain.clone(), samples);
        }
    }
    History(out)
}

/// View of the samples with `ts >= since_ts` (binary-search lower bound).
#[must_use]
pub fn window(samples: &[Sample], since_ts: f64) -> &[Sample] {
    let idx = samples.partition_point(|s| s.ts < since_ts);
    &samples[idx..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(ts: f64, ok: bool) -> Sample {
        Sample::new(ts, ok)
    }

    #[test]
    fn append_keeps_series_sorted() {
        let mut h = History::new();
        h.append("a.example", s(10.0, true));
        h.append("a.example", s(30.0, true));
        h.append("a.example", s(20.0, false));
        let ts: Vec<f64> = h.samples("a.example").iter().map(|x| x.ts).collect();
        assert_eq!(ts, vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn append_permutations_agree_on_window() {
        let samples = [s(1.0, true), s(2.0, false), s(3.0, true), s(4.0, true)];
        let mut a = History::new();
        let mut b = History::new();
        for x in samples {
            a.append("d", x);
        }
        for x in [samples[2], samples[0], samples[3], samples[1]] {
            b.append("d", x);
        }
        assert_eq!(window(a.samples("d"), 2.0), window(b.samples("d"), 2.0));
    }

    #[test]
    fn prune_drops_old_and_empty_domains() {
        let mut h = History::new();
        h.append("old", s(1.0, true));
        h.append("mixed", s(1.0, true));
        h.append("mixed", s(5.0, true));
        h.prune(3.0);
        assert!(h.samples("old").is_empty());
        assert_eq!(h.domains().count(), 1);
        assert_eq!(h.samples("mixed").len(), 1);
    }

    #[test]
    fn window_is_lower_bound() {
        let mut h = History::new();
        for ts in [1.0, 2.0, 2.0, 3.0] {
            h.append("d", s(ts, true));
        }
        assert_eq!(window(h.samples("d"), 2.0).len(), 3);
        assert_eq!(window(h.samples("d"), 3.5).len(), 0);
    }

    #[test]
    fn coerce_skips_malformed_entries() {
        let raw = serde_json::json!({
            "good": [[1.0, true], [2.0, false, 10.0, null, 200]],
            "bad": [[true], "nope", [3.0, true]],
            "empty": [],
            "": [[1.0, true]],
        });
        let h = coerce_history(&raw);
        assert_eq!(h.samples("good").len(), 2);
        assert_eq!(h.samples("bad").len(), 1);
        assert!(h.samples("empty").is_empty());
        assert_eq!(h.domains().count(), 2);
    }
}
