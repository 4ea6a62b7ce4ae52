//! Browser infrastructure-error heuristic.
//!
//! Certain driver failures say nothing about the site under test: the
//! renderer crashed, the CDP connection died, the browser went away. Those
//! outcomes are reported as `browser_degraded` and must not feed the
//! debounced effective state. The match list is centralized here so it can
//! be tested and extended in one place.

const INFRA_MARKERS: [&str; 8] = [
    "Page crashed",
    "Target crashed",
    "Target closed",
    "Session closed",
    "Browser has been closed",
    "Connection closed while reading from the driver",
    "browser was not able to start",
    "websocket connection closed",
];

/// Whether an error string indicates browser infrastructure failure.
#[must_use]
pub fn is_browser_infra_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    INFRA_MARKERS
        .iter()
        .any(|marker| lower.contains(&marker.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_crash_is_infra() {
        assert!(is_browser_infra_error("Error: Page.goto: Page crashed"));
    }

    #[test]
    fn target_crash_is_infra() {
        assert!(is_browser_infra_error("Error: Page.wait_for_selector: Target crashed"));
    }

    #[test]
    fn driver_connection_loss_is_infra() {
        assert!(is_browser_infra_error(
            "Exception: Browser.new_context: Connection closed while reading from the driver"
        ));
    }

    #[test]
    fn assertion_failures_are_not_infra() {
        assert!(!is_browser_infra_error("selector `#app` not found within 25000ms"));
        assert!(!is_browser_infra_error("net::ERR_NAME_NOT_RESOLVED"));
    }
}
