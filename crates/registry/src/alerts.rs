//! Post-commit alerting and dispatcher escalation for run completions.

use tracing::{info, warn};

use vigil_dispatch::{DispatchClient, DispatchConfig};
use vigil_telegram::{TelegramClient, TelegramConfig};

use crate::settings::Settings;
use crate::store::{CompletionOutcome, RunCompletion, Store};

fn safe_json(value: &serde_json::Value, max_len: usize) -> String {
    let rendered = serde_json::to_string_pretty(value).unwrap_or_default();
    if rendered.chars().count() <= max_len {
        rendered
    } else {
        let cut: String = rendered.chars().take(max_len).collect();
        format!("{cut}\n...truncated...")
    }
}

/// Failure alert body for a confirmed DOWN transition.
#[must_use]
pub fn failure_message(
    settings: &Settings,
    outcome: &CompletionOutcome,
    completion: &RunCompletion,
    down_after_failures: i64,
) -> String {
    let test_name = outcome.test_name.as_deref().unwrap_or("unknown");
    let test_id = outcome.test_id.as_deref().unwrap_or("");
    let run_id = outcome.run_id.as_deref().unwrap_or("");

    let mut lines = vec![
        "External E2E test is FAILING ❌".to_owned(),
        format!("Test: {test_name}"),
        format!("Test ID: {test_id}"),
        format!("Run ID: {run_id}"),
    ];
    if down_after_failures > 1 {
        lines.push(format!(
            "Debounce: fail_streak={}/{down_after_failures}",
            outcome.fail_streak.unwrap_or(0)
        ));
    }
    if let Some(kind) = completion.error_kind.as_deref() {
        lines.push(format!("Error kind: {}", &kind.chars().take(120).collect::<String>()));
    }
    if let Some(message) = completion.error_message.as_deref() {
        lines.push(format!("Error: {}", message.chars().take(500).collect::<String>()));
    }
    if let Some(final_url) = completion.final_url.as_deref() {
        lines.push(format!("Final URL: {}", final_url.chars().take(800).collect::<String>()));
    }
    lines.push(format!("UI: {}", settings.public_url(&format!("/ui/runs/{run_id}"))));
    lines.push(format!("Test: {}", settings.public_url(&format!("/ui/tests/{test_id}"))));

    if let Some(artifacts) = completion.artifacts.as_object() {
        let present: Vec<&str> = ["failure_screenshot", "trace_zip", "run_log"]
            .into_iter()
            .filter(|k| artifacts.get(*k).and_then(serde_json::Value::as_str).is_some())
            .collect();
        if !present.is_empty() {
            lines.push(format!("Artifacts: {}", present.join(", ")));
        }
    }

    lines.join("\n")
}

/// Recovery alert body.
#[must_use]
pub fn recovery_message(settings: &Settings, outcome: &CompletionOutcome) -> String {
    let run_id = outcome.run_id.as_deref().unwrap_or("");
    [
        "External E2E test RECOVERED ✅".to_owned(),
        format!("Test: {}", outcome.test_name.as_deref().unwrap_or("unknown")),
        format!("Test ID: {}", outcome.test_id.as_deref().unwrap_or("")),
        format!("Run: {}", settings.public_url(&format!("/ui/runs/{run_id}"))),
    ]
    .join("\n")
}

fn read_only_rules() -> &'static str {
    "IMPORTANT safety rules:\n\
     - Do NOT restart/stop/recreate any containers or services.\n\
     - Do NOT deploy, update images, run apt-get, or change configuration files.\n\
     - Do NOT prune/remove volumes/images/containers.\n\
     - Only run read-only diagnostics (docker ps/inspect/logs/stats, curl, df, free, uptime, etc.).\n\
     - If you believe a restart would help, suggest it as a human action but do not execute it.\n"
}

/// Escalation prompt for a failing submitted test.
#[must_use]
pub fn dispatch_prompt(
    outcome: &CompletionOutcome,
    base_url: &str,
    completion: &RunCompletion,
) -> String {
    let payload = serde_json::json!({
        "test_id": outcome.test_id,
        "test_name": outcome.test_name,
        "base_url": base_url,
        "run_id": outcome.run_id,
        "error_kind": completion.error_kind,
        "error_message": completion.error_message,
        "artifacts": completion.artifacts,
    });
    format!(
        "An external developer-submitted end-to-end UI test is failing.\n\n\
         Failure details (JSON):\n{}\n\n{}\n\
         Task:\n\
         1) Determine whether the failure is a real product regression vs monitoring/infra instability.\n\
         2) Reproduce from the production host with curl and, if needed, a headless browser.\n\
         3) Inspect relevant containers, reverse proxy, logs, and recent deploys.\n\
         4) Provide a remediation plan for a human operator (no changes executed).\n\n\
         Return a concise final report with:\n\
         - Root cause + evidence\n\
         - Reproduction steps\n\
         - Scope/impact (which service/domain)\n\
         - Suggested safe next actions\n",
        safe_json(&payload, 20_000),
        read_only_rules()
    )
}

#[must_use]
pub fn telegram_client(settings: &Settings, http: &reqwest::Client) -> Option<TelegramClient> {
    if !settings.alerts_enabled
        || settings.telegram_bot_token.is_empty()
        || settings.telegram_chat_id.is_empty()
    {
        return None;
    }
    Some(TelegramClient::new(
        http.clone(),
        TelegramConfig::new(&settings.telegram_bot_token, &settings.telegram_chat_id),
    ))
}

/// Send an alert if Telegram is configured; log otherwise.
pub async fn maybe_send_alert(settings: &Settings, http: &reqwest::Client, message: &str) {
    match telegram_client(settings, http) {
        Some(client) => {
            if let Err(e) = client.send_chunked(message).await {
                warn!(error = %e, "telegram alert failed");
            }
        }
        None => info!(message, "alerts disabled or telegram not configured"),
    }
}

/// Spawn a dispatcher escalation for a failing test. Runs detached so the
/// completion response is never blocked on the long poll; the conclusion is
/// recorded in `dispatch_runs` and sent as a follow-up alert.
pub fn spawn_dispatch_escalation(
    settings: Settings,
    http: reqwest::Client,
    store: Store,
    outcome: CompletionOutcome,
    base_url: String,
    completion: RunCompletion,
) {
    if !settings.dispatch_enabled {
        return;
    }
    if settings.dispatch_token.is_empty() {
        warn!("dispatcher token missing; skipping escalation");
        return;
    }

    tokio::spawn(async move {
        let mut config = DispatchConfig::new(&settings.dispatch_base_url, &settings.dispatch_token);
        config.model = Some(settings.dispatch_model.clone()).filter(|m| !m.is_empty());
        config.max_wait = std::time::Duration::from_secs(20 * 60);
        let client = DispatchClient::new(http.clone(), config);

        let prompt = dispatch_prompt(&outcome, &base_url, &completion);
        let config_toml = [
            "approval_policy = \"never\"",
            "sandbox_mode = \"danger-full-access\"",
            "hide_agent_reasoning = true",
            "",
        ]
        .join("\n");
        let state_key = "e2e-registry.failure";
        let context = serde_json::json!({
            "test_id": outcome.test_id,
            "run_id": outcome.run_id,
        });

        let job = match client.dispatch(&prompt, &config_toml, Some(state_key), None).await {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "dispatch enqueue failed");
                let _ = store
                    .insert_dispatch_run(state_key, None, None, None, None, Some(&e.to_string()), &context)
                    .await;
                return;
            }
        };
        let ui_url = vigil_dispatch::run_ui_url(&settings.dispatch_base_url, &job.bundle);

        let queue_state = match client.wait_for_terminal_status(&job.bundle).await {
            Ok(status) => status.queue_state,
            Err(e) => {
                warn!(error = %e, bundle = %job.bundle, "dispatch wait failed");
                None
            }
        };

        let agent_message = client.last_agent_message(&job.bundle).await.ok().flatten();
        let error_message = if agent_message.is_none() {
            client
                .log_tail(&job.bundle, client.config().log_tail_bytes)
                .await
                .ok()
                .and_then(|tail| vigil_dispatch::extract_last_error_message(&tail))
        } else {
            None
        };

        let _ = store
            .insert_dispatch_run(
                state_key,
                Some(&job.bundle),
                Some(&ui_url),
                queue_state.as_deref(),
                agent_message.as_deref(),
                error_message.as_deref(),
                &context,
            )
            .await;

        let followup = match &agent_message {
            Some(message) => format!("Dispatcher triage completed:\n{ui_url}\n\n{message}"),
            None => format!(
                "Dispatcher triage failed state={}\nui={ui_url}\nError: {}",
                queue_state.as_deref().unwrap_or("unknown"),
                error_message
                    .as_deref()
                    .unwrap_or("")
                    .chars()
                    .take(500)
                    .collect::<String>()
            ),
        };
        maybe_send_alert(&settings, &http, &followup).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome() -> CompletionOutcome {
        CompletionOutcome {
            updated: true,
            alerted_down: true,
            recovered_up: false,
            effective_ok: Some(false),
            fail_streak: Some(2),
            success_streak: Some(0),
            tenant_id: Some("t1".to_owned()),
            test_id: Some("test-1".to_owned()),
            test_name: Some("login smoke".to_owned()),
            run_id: Some("run-1".to_owned()),
        }
    }

    fn completion() -> RunCompletion {
        RunCompletion {
            status: "fail".to_owned(),
            elapsed_ms: Some(900.0),
            error_kind: Some("assertion_failed".to_owned()),
            error_message: Some("text_missing: \"Welcome\"".to_owned()),
            final_url: Some("https://app.prod.net/login".to_owned()),
            title: None,
            artifacts: serde_json::json!({"failure_screenshot": "failure.png"}),
            started_at_ts: None,
            finished_at_ts: None,
        }
    }

    #[test]
    fn failure_message_names_test_and_artifacts() {
        let mut settings = Settings::from_env();
        settings.public_base_url = "https://monitoring.pitchai.net".to_owned();
        let msg = failure_message(&settings, &outcome(), &completion(), 2);
        assert!(msg.contains("login smoke"));
        assert!(msg.contains("fail_streak=2/2"));
        assert!(msg.contains("https://monitoring.pitchai.net/ui/runs/run-1"));
        assert!(msg.contains("Artifacts: failure_screenshot"));
    }

    #[test]
    fn recovery_message_links_the_run() {
        let settings = Settings::from_env();
        let msg = recovery_message(&settings, &outcome());
        assert!(msg.contains("RECOVERED"));
        assert!(msg.contains("/ui/runs/run-1"));
    }

    #[test]
    fn prompt_is_read_only_and_carries_context() {
        let prompt = dispatch_prompt(&outcome(), "https://app.prod.net", &completion());
        assert!(prompt.contains("Do NOT restart"));
        assert!(prompt.contains("assertion_failed"));
        assert!(prompt.contains("app.prod.net"));
    }
}
