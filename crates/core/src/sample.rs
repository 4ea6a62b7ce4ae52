//! Per-cycle observation samples.
//!
//! Samples are persisted in the monitor state file as fixed-arity JSON
//! arrays `[ts, ok, http_elapsed_ms, browser_elapsed_ms, status_code]` so
//! the on-disk schema stays compact and stable across versions.

use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One observation for one domain in one cycle.
///
/// The `ok` field records the *debounced effective* state at the time the
/// sample was appended, not the raw probe outcome (`history_ok_mode =
/// "effective"` in the state file).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Unix timestamp in seconds.
    pub ts: f64,
    /// Effective up/down at append time.
    pub ok: bool,
    /// HTTP probe wall time, when the probe ran.
    pub http_elapsed_ms: Option<f64>,
    /// Browser probe wall time, when the probe ran.
    pub browser_elapsed_ms: Option<f64>,
    /// Final HTTP status code, when known.
    pub status_code: Option<u16>,
}

impl Sample {
    #[must_use]
    pub fn new(ts: f64, ok: bool) -> Self {
        Self {
            ts,
            ok,
            http_elapsed_ms: None,
            browser_elapsed_ms: None,
            status_code: None,
        }
    }

    #[must_use]
    pub fn with_latencies(
        mut self,
        http_elapsed_ms: Option<f64>,
        browser_elapsed_ms: Option<f64>,
    ) -> Self {
        self.http_elapsed_ms = http_elapsed_ms;
        self.browser_elapsed_ms = browser_elapsed_ms;
        self
    }

    #[must_use]
    pub fn with_status_code(mut self, status_code: Option<u16>) -> Self {
        self.status_code = status_code;
        self
    }

    /// Latency value for the given field, when present.
    #[must_use]
    pub fn latency_ms(&self, field: LatencyField) -> Option<f64> {
        match field {
            LatencyField::Http => self.http_elapsed_ms,
            LatencyField::Browser => self.browser_elapsed_ms,
        }
    }
}

/// Which latency column of a sample an analytics query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyField {
    Http,
    Browser,
}

impl Serialize for Sample {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(5)?;
        tup.serialize_element(&self.ts)?;
        tup.serialize_element(&self.ok)?;
        tup.serialize_element(&self.http_elapsed_ms)?;
        tup.serialize_element(&self.browser_elapsed_ms)?;
        tup.serialize_element(&self.status_code)?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for Sample {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SampleVisitor;

        impl<'de> Visitor<'de> for SampleVisitor {
            type Value = Sample;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a [ts, ok, http_ms, browser_ms, status] array")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Sample, A::Error> {
                let ts: f64 = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::invalid_length(0, &self))?;
                let ok: bool = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::invalid_length(1, &self))?;
                // Trailing columns were added over time; tolerate short arrays.
                let http_elapsed_ms: Option<f64> = seq.next_element()?.flatten();
                let browser_elapsed_ms: Option<f64> = seq.next_element()?.flatten();
                let status_code: Option<u16> = seq.next_element()?.flatten();
                while seq.next_element::<serde_json::Value>()?.is_some() {}
                Ok(Sample {
                    ts,
                    ok,
                    http_elapsed_ms,
                    browser_elapsed_ms,
                    status_code,
                })
            }
        }

        deserializer.deserialize_seq(SampleVisitor)
    }
}
