//! Cross-cutting signal identities and their debounced state.

use serde::{Deserialize, Serialize};

use crate::debounce::StreakState;

/// Every cross-cutting check the monitor folds into a debounced signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Browser,
    HostHealth,
    Performance,
    Slo,
    Red,
    Tls,
    Dns,
    ContainerHealth,
    Proxy,
    Meta,
}

impl SignalKind {
    pub const ALL: [SignalKind; 10] = [
        SignalKind::Browser,
        SignalKind::HostHealth,
        SignalKind::Performance,
        SignalKind::Slo,
        SignalKind::Red,
        SignalKind::Tls,
        SignalKind::Dns,
        SignalKind::ContainerHealth,
        SignalKind::Proxy,
        SignalKind::Meta,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Browser => "browser",
            SignalKind::HostHealth => "host_health",
            SignalKind::Performance => "performance",
            SignalKind::Slo => "slo",
            SignalKind::Red => "red",
            SignalKind::Tls => "tls",
            SignalKind::Dns => "dns",
            SignalKind::ContainerHealth => "container_health",
            SignalKind::Proxy => "proxy",
            SignalKind::Meta => "meta",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Debounced state of one signal, persisted in the monitor state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalState {
    #[serde(default = "default_true")]
    pub last_ok: bool,
    #[serde(flatten)]
    pub streaks: StreakState,
    #[serde(default)]
    pub last_run_ts: Option<f64>,
    /// Signal-specific auxiliary data (e.g. DNS last IPs, container restart
    /// counts), kept opaque at this layer.
    #[serde(default)]
    pub data: serde_json::Value,
}

fn default_true() -> bool {
    true
}

impl Default for SignalState {
    fn default() -> Self {
        Self {
            last_ok: true,
            streaks: StreakState::default(),
            last_run_ts: None,
            data: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_snake_case() {
        let json = serde_json::to_string(&SignalKind::ContainerHealth).unwrap();
        assert_eq!(json, "\"container_health\"");
        let back: SignalKind = serde_json::from_str("\"host_health\"").unwrap();
        assert_eq!(back, SignalKind::HostHealth);
    }

    #[test]
    fn default_state_is_up_with_no_streaks() {
        let s = SignalState::default();
        assert!(s.last_ok);
        assert_eq!(s.streaks, StreakState::default());
    }

    #[test]
    fn state_round_trips_with_flattened_streaks() {
        let mut s = SignalState::default();
        s.streaks.fail_streak = 3;
        s.last_ok = false;
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["fail_streak"], 3);
        let back: SignalState = serde_json::from_value(json).unwrap();
        assert_eq!(back.streaks.fail_streak, 3);
        assert!(!back.last_ok);
    }
}
