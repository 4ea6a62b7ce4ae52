pub mod analytics;
pub mod check;
pub mod debounce;
pub mod history;
pub mod kinds;
pub mod sample;
pub mod signal;
pub mod step;
pub mod time;

pub use analytics::{
    BurnRateRule, RedThresholds, RedViolation, SloBurnViolation, availability, burn_rate,
    error_rate_percent, latency_percentile_ms, red_violations, slo_burn_violations,
};
pub use check::{
    ApiContractCheck, CheckSpec, DEFAULT_MAINTENANCE_TEXT, ProxyExpectations, SelectorCheck,
    SelectorState, SyntheticTransaction, normalize_text,
};
pub use debounce::{DebounceConfig, StreakState, Transition, apply_observation};
pub use history::{History, window};
pub use sample::{LatencyField, Sample};
pub use signal::{SignalKind, SignalState};
pub use step::{Step, StepFlow, StepFlowError, validate_definition};
pub use time::{format_ts, now_ts, parse_until_ts};
