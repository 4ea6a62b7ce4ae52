//! On-disk monitor state (schema version 5).
//!
//! The state file is the single source of truth across restarts: rolling
//! history, per-domain and per-signal streaks, signal auxiliary data,
//! dispatch records and a bounded event log. Writes are atomic
//! (temp-file + rename); a missing or malformed file loads as the empty
//! default so a partial write can never brick the monitor.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use vigil_core::history::History;
use vigil_core::signal::{SignalKind, SignalState};
use vigil_probe::host::{CpuTotals, HostSnapshot};

use crate::error::MonitorError;

pub const STATE_VERSION: u32 = 5;

const DISPATCH_HISTORY_LIMIT: usize = 80;
const EVENT_LOG_LIMIT: usize = 200;

fn default_version() -> u32 {
    STATE_VERSION
}

fn default_ok_mode() -> String {
    "effective".to_owned()
}

/// One dispatcher escalation, kept per state key and in a bounded history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub ts: f64,
    pub state_key: String,
    pub title: String,
    #[serde(default)]
    pub bundle: Option<String>,
    #[serde(default)]
    pub queue_state: Option<String>,
    #[serde(default)]
    pub ui_url: Option<String>,
    pub ok: bool,
    #[serde(default)]
    pub agent_message: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// One line of the bounded event log shown on the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub ts: f64,
    pub kind: String,
    pub message: String,
}

/// Everything the monitor persists between cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorState {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Samples record the debounced effective state, not raw observations.
    #[serde(default = "default_ok_mode")]
    pub history_ok_mode: String,
    #[serde(default)]
    pub history: History,
    #[serde(default)]
    pub last_ok: BTreeMap<String, bool>,
    #[serde(default)]
    pub fail_streak: BTreeMap<String, u32>,
    #[serde(default)]
    pub success_streak: BTreeMap<String, u32>,
    #[serde(default)]
    pub signals: BTreeMap<SignalKind, SignalState>,
    #[serde(default)]
    pub dns_last_ips: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub container_restart_counts: BTreeMap<String, i64>,
    #[serde(default)]
    pub last_dispatch: BTreeMap<String, DispatchRecord>,
    #[serde(default)]
    pub dispatch_history: Vec<DispatchRecord>,
    #[serde(default)]
    pub events: Vec<EventLogEntry>,
    #[serde(default)]
    pub host_snapshot: Option<HostSnapshot>,
    #[serde(default)]
    pub cpu_prev_totals: Option<CpuTotals>,
    #[serde(default)]
    pub state_write_fail_streak: u32,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            history_ok_mode: default_ok_mode(),
            history: History::new(),
            last_ok: BTreeMap::new(),
            fail_streak: BTreeMap::new(),
            success_streak: BTreeMap::new(),
            signals: BTreeMap::new(),
            dns_last_ips: BTreeMap::new(),
            container_restart_counts: BTreeMap::new(),
            last_dispatch: BTreeMap::new(),
            dispatch_history: Vec::new(),
            events: Vec::new(),
            host_snapshot: None,
            cpu_prev_totals: None,
            state_write_fail_streak: 0,
        }
    }
}

impl MonitorState {
    /// Load state, falling back to the empty default on a missing or
    /// malformed file. Older schema versions carry forward: unknown keys
    /// are dropped, missing ones default.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str::<MonitorState>(&raw) {
            Ok(mut state) => {
                if state.version != STATE_VERSION {
                    warn!(from = state.version, to = STATE_VERSION, "migrating state schema");
                    state.version = STATE_VERSION;
                }
                state.history_ok_mode = default_ok_mode();
                state
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), "state file unreadable, starting empty");
                Self::default()
            }
        }
    }

    /// Write atomically: serialize to `<path>.tmp`, fsync, rename.
    pub fn save_atomic(&self, path: &Path) -> Result<(), MonitorError> {
        let tmp = path.with_extension("json.tmp");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec(self)?;
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Mutable access to one signal's state, created on first use.
    pub fn signal_mut(&mut self, kind: SignalKind) -> &mut SignalState {
        self.signals.entry(kind).or_default()
    }

    /// Record a dispatch both per-key and in the bounded history.
    pub fn push_dispatch(&mut self, record: DispatchRecord) {
        self.last_dispatch
            .insert(record.state_key.clone(), record.clone());
        self.dispatch_history.push(record);
        if self.dispatch_history.len() > DISPATCH_HISTORY_LIMIT {
            let excess = self.dispatch_history.len() - DISPATCH_HISTORY_LIMIT;
            self.dispatch_history.drain(..excess);
        }
    }

    /// Append to the bounded event log.
    pub fn push_event(&mut self, ts: f64, kind: impl Into<String>, message: impl Into<String>) {
        self.events.push(EventLogEntry {
            ts,
            kind: kind.into(),
            message: message.into(),
        });
        if self.events.len() > EVENT_LOG_LIMIT {
            let excess = self.events.len() - EVENT_LOG_LIMIT;
            self.events.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::sample::Sample;

    fn record(key: &str, ts: f64) -> DispatchRecord {
        DispatchRecord {
            ts,
            state_key: key.to_owned(),
            title: "t".to_owned(),
            bundle: None,
            queue_state: Some("processed".to_owned()),
            ui_url: None,
            ok: true,
            agent_message: None,
            error_message: None,
        }
    }

    #[test]
    fn missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let state = MonitorState::load(&dir.path().join("state.json"));
        assert_eq!(state.version, STATE_VERSION);
        assert!(state.history.is_empty());
    }

    #[test]
    fn malformed_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{\"version\": 5, \"history\": {trunc").unwrap();
        let state = MonitorState::load(&path);
        assert!(state.history.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = MonitorState::default();
        state.history.append("d.example", Sample::new(10.0, true));
        state.last_ok.insert("d.example".to_owned(), true);
        state.fail_streak.insert("d.example".to_owned(), 0);
        state.push_event(10.0, "alert", "d.example DOWN");
        state.save_atomic(&path).unwrap();

        let loaded = MonitorState::load(&path);
        assert_eq!(loaded.history.samples("d.example").len(), 1);
        assert_eq!(loaded.last_ok.get("d.example"), Some(&true));
        assert_eq!(loaded.events.len(), 1);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn older_versions_migrate_forward() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "version": 3,
                "last_ok": {"a.example": false},
            })
            .to_string(),
        )
        .unwrap();
        let state = MonitorState::load(&path);
        assert_eq!(state.version, STATE_VERSION);
        assert_eq!(state.history_ok_mode, "effective");
        assert_eq!(state.last_ok.get("a.example"), Some(&false));
    }

    #[test]
    fn dispatch_history_is_bounded() {
        let mut state = MonitorState::default();
        for i in 0..100 {
            state.push_dispatch(record("k", f64::from(i)));
        }
        assert_eq!(state.dispatch_history.len(), 80);
        assert_eq!(state.dispatch_history[0].ts, 20.0);
        assert_eq!(state.last_dispatch.get("k").unwrap().ts, 99.0);
    }

    #[test]
    fn event_log_is_bounded() {
        let mut state = MonitorState::default();
        for i in 0..250 {
            state.push_event(f64::from(i), "e", "msg");
        }
        assert_eq!(state.events.len(), 200);
        assert_eq!(state.events[0].ts, 50.0);
    }
}
