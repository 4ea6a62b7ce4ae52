//! Stable error-kind strings shared by probes, alerts and dashboards.

pub const HTTP_ERROR: &str = "http_error";
pub const FORBIDDEN_TEXT: &str = "forbidden_text";
pub const FINAL_HOST_MISMATCH: &str = "final_host_mismatch";
pub const BROWSER_INFRA_ERROR: &str = "browser_infra_error";
pub const BROWSER_DEGRADED: &str = "browser_degraded";
pub const SELECTOR_MISSING: &str = "selector_missing";
pub const ASSERTION_FAILED: &str = "assertion_failed";
pub const RUNNER_LAUNCH_FAILED: &str = "browser_launch_failed";
pub const TIMEOUT: &str = "timeout";
pub const DISPATCH_TIMEOUT: &str = "dispatch_timeout";
pub const STATE_WRITE_FAILED: &str = "state_write_failed";
