//! Debounced effective up/down state machine.
//!
//! The same machine drives the monitor's per-domain and per-signal state
//! and the registry's per-test state. Infra-degraded observations must not
//! be fed through it; they preserve the prior effective state.

use serde::{Deserialize, Serialize};

fn default_threshold() -> u32 {
    2
}

/// Debounce thresholds. Values below 1 are treated as 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DebounceConfig {
    #[serde(default = "default_threshold")]
    pub down_after_failures: u32,
    #[serde(default = "default_threshold")]
    pub up_after_successes: u32,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            down_after_failures: 2,
            up_after_successes: 2,
        }
    }
}

/// Consecutive-observation counters. At most one of the two is non-zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakState {
    #[serde(default)]
    pub fail_streak: u32,
    #[serde(default)]
    pub success_streak: u32,
}

/// Result of applying one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub effective_ok: bool,
    pub alerted_down: bool,
    pub recovered_up: bool,
}

/// Apply one raw observation and compute the next effective state.
///
/// Alerts are edges only: `alerted_down` on the UP→DOWN transition,
/// `recovered_up` on DOWN→UP.
#[must_use]
pub fn apply_observation(
    prev_effective_ok: bool,
    observed_ok: bool,
    streaks: &mut StreakState,
    cfg: DebounceConfig,
) -> Transition {
    let down_after = cfg.down_after_failures.max(1);
    let up_after = cfg.up_after_successes.max(1);

    if observed_ok {
        streaks.success_streak += 1;
        streaks.fail_streak = 0;
    } else {
        streaks.fail_streak += 1;
        streaks.success_streak = 0;
    }

    let effective_ok = if prev_effective_ok {
        streaks.fail_streak < down_after
    } else {
        streaks.success_streak >= up_after
    };

    Transition {
        effective_ok,
        alerted_down: prev_effective_ok && !effective_ok,
        recovered_up: !prev_effective_ok && effective_ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(down: u32, up: u32) -> DebounceConfig {
        DebounceConfig {
            down_after_failures: down,
            up_after_successes: up,
        }
    }

    #[test]
    fn flaky_domain_alerts_exactly_once_each_way() {
        // F, F, F, T, T with thresholds 2/2: one DOWN after obs 2, one UP
        // after obs 5, nothing in between.
        let mut streaks = StreakState::default();
        let mut effective = true;
        let mut downs = 0;
        let mut ups = 0;

        for (i, observed) in [false, false, false, true, true].iter().enumerate() {
            let t = apply_observation(effective, *observed, &mut streaks, cfg(2, 2));
            effective = t.effective_ok;
            if t.alerted_down {
                downs += 1;
                assert_eq!(i, 1);
            }
            if t.recovered_up {
                ups += 1;
                assert_eq!(i, 4);
            }
        }
        assert_eq!(downs, 1);
        assert_eq!(ups, 1);
        assert!(effective);
    }

    #[test]
    fn streak_invariant_holds() {
        let mut streaks = StreakState::default();
        let mut effective = true;
        for observed in [true, false, false, true, false, true, true, true] {
            let _ = apply_observation(effective, observed, &mut streaks, cfg(3, 2));
            effective = true;
            assert!(streaks.fail_streak == 0 || streaks.success_streak == 0);
        }
    }

    #[test]
    fn recovery_flips_exactly_once() {
        let mut streaks = StreakState::default();
        let mut effective = false;
        let mut flips = 0;
        for _ in 0..5 {
            let t = apply_observation(effective, true, &mut streaks, cfg(2, 3));
            if t.recovered_up {
                flips += 1;
            }
            effective = t.effective_ok;
        }
        assert_eq!(flips, 1);
        assert!(effective);
    }

    #[test]
    fn single_failure_with_threshold_one_goes_down() {
        let mut streaks = StreakState::default();
        let t = apply_observation(true, false, &mut streaks, cfg(1, 1));
        assert!(t.alerted_down);
        assert!(!t.effective_ok);
    }

    #[test]
    fn zero_thresholds_clamp_to_one() {
        let mut streaks = StreakState::default();
        let t = apply_observation(true, false, &mut streaks, cfg(0, 0));
        assert!(!t.effective_ok);
    }
}
