//! Alert message composition and dispatcher escalation prompts.

use vigil_core::signal::SignalKind;
use vigil_core::time::format_ts;

use crate::signals::SignalObservation;

/// State key used for dispatcher deduplication, one per domain.
#[must_use]
pub fn domain_state_key(domain: &str) -> String {
    format!("service-monitoring.{domain}")
}

#[must_use]
pub fn signal_state_key(kind: SignalKind) -> String {
    format!("service-monitoring.signal.{kind}")
}

#[must_use]
pub fn domain_down_message(
    domain: &str,
    reason: &str,
    fail_streak: u32,
    down_after: u32,
    details: &serde_json::Value,
) -> String {
    let mut lines = vec![
        format!("{domain} is DOWN ❌"),
        format!("Reason: {reason}"),
        format!("Debounce: fail_streak={fail_streak}/{down_after}"),
    ];
    if !details.is_null() {
        let rendered = serde_json::to_string_pretty(details).unwrap_or_default();
        if !rendered.is_empty() && rendered != "{}" {
            lines.push(format!("Details:\n{}", truncate(&rendered, 2_000)));
        }
    }
    lines.join("\n")
}

#[must_use]
pub fn domain_up_message(domain: &str, success_streak: u32, up_after: u32) -> String {
    format!("{domain} RECOVERED ✅\nDebounce: success_streak={success_streak}/{up_after}")
}

#[must_use]
pub fn signal_down_message(observation: &SignalObservation, now_ts: f64) -> String {
    let mut lines = vec![
        format!("Signal {} is DOWN ❌", observation.kind),
        format!("At: {}", format_ts(now_ts)),
    ];
    if !observation.summary.is_empty() {
        lines.push(truncate(&observation.summary, 3_000));
    }
    lines.join("\n")
}

#[must_use]
pub fn signal_up_message(kind: SignalKind, now_ts: f64) -> String {
    format!("Signal {kind} RECOVERED ✅\nAt: {}", format_ts(now_ts))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_owned()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}\n...truncated...")
    }
}

/// Safety rules embedded in every investigation prompt. The dispatcher
/// contract is strictly read-only.
#[must_use]
pub fn read_only_rules() -> &'static str {
    "IMPORTANT safety rules:\n\
     - Do NOT restart/stop/recreate any containers or services.\n\
     - Do NOT deploy, update images, run apt-get, or change configuration files.\n\
     - Do NOT prune/remove volumes/images/containers.\n\
     - Only run read-only diagnostics (docker ps/inspect/logs/stats, curl, df, free, uptime, etc.).\n\
     - If you believe a restart would help, suggest it as a human action but do not execute it.\n"
}

/// The sandbox configuration shipped with every investigation job.
#[must_use]
pub fn dispatch_config_toml() -> String {
    [
        "approval_policy = \"never\"",
        "sandbox_mode = \"danger-full-access\"",
        "hide_agent_reasoning = true",
        "",
    ]
    .join("\n")
}

/// Investigation prompt for a confirmed domain DOWN.
#[must_use]
pub fn dispatch_prompt_for_domain(
    domain: &str,
    url: &str,
    reason: &str,
    details: &serde_json::Value,
) -> String {
    let payload = serde_json::json!({
        "domain": domain,
        "url": url,
        "reason": reason,
        "details": details,
    });
    let rendered = serde_json::to_string_pretty(&payload).unwrap_or_default();
    format!(
        "A monitored production domain has been confirmed DOWN by the \
         service monitor (debounced over consecutive failing cycles).\n\n\
         Failure details (JSON):\n{}\n\n{}\n\
         Task:\n\
         1) Determine whether this is a real outage vs monitoring/infra instability.\n\
         2) Reproduce from the production host with curl and, if needed, a headless browser.\n\
         3) Inspect relevant containers, reverse proxy, logs, and recent deploys.\n\
         4) Provide a remediation plan for a human operator (no changes executed).\n\n\
         Return a concise final report with:\n\
         - Root cause + evidence\n\
         - Reproduction steps\n\
         - Scope/impact (which service/domain)\n\
         - Suggested safe next actions\n",
        truncate(&rendered, 20_000),
        read_only_rules()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn down_message_carries_streaks_and_reason() {
        let msg = domain_down_message(
            "app.example",
            "http_check_failed",
            2,
            2,
            &serde_json::json!({"status_code": 502}),
        );
        assert!(msg.contains("app.example is DOWN"));
        assert!(msg.contains("fail_streak=2/2"));
        assert!(msg.contains("502"));
    }

    #[test]
    fn prompt_embeds_rules_and_context() {
        let prompt = dispatch_prompt_for_domain(
            "app.example",
            "https://app.example/",
            "http_check_failed",
            &serde_json::Value::Null,
        );
        assert!(prompt.contains("Do NOT restart"));
        assert!(prompt.contains("app.example"));
        assert!(prompt.contains("Root cause"));
    }

    #[test]
    fn state_keys_are_stable() {
        assert_eq!(domain_state_key("a.example"), "service-monitoring.a.example");
        assert_eq!(
            signal_state_key(SignalKind::ContainerHealth),
            "service-monitoring.signal.container_health"
        );
    }
}
