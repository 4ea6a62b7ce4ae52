//! Job execution: step-flow interpretation and sandbox hand-off.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chromiumoxide::page::ScreenshotParams;
use serde_json::json;
use tokio::time::Instant;
use tracing::{info, warn};

use vigil_core::step::StepFlow;
use vigil_core::time::now_ts;
use vigil_probe::browser::BrowserSession;
use vigil_probe::steps::{StepContext, execute_steps};

use crate::client::{Job, RunPayload};
use crate::config::RunnerConfig;
use crate::sandbox::{SandboxOutcome, run_in_sandbox};

/// Artifact directory for one run: `{root}/{tenant}/{test}/{run}`.
#[must_use]
pub fn artifacts_dir_for(config: &RunnerConfig, job: &Job) -> PathBuf {
    Path::new(&config.artifacts_dir)
        .join(&job.tenant_id)
        .join(&job.test_id)
        .join(&job.run_id)
}

fn infra_payload(started_at_ts: f64, error_kind: &str, error_message: String) -> RunPayload {
    RunPayload {
        status: "infra_degraded".to_owned(),
        elapsed_ms: None,
        error_kind: Some(error_kind.to_owned()),
        error_message: Some(error_message),
        final_url: None,
        title: None,
        artifacts: json!({}),
        started_at_ts,
        finished_at_ts: now_ts(),
    }
}

/// Execute one job end to end and build its completion payload.
pub async fn execute_job(
    config: &RunnerConfig,
    session: &BrowserSession,
    job: &Job,
) -> RunPayload {
    let started_at_ts = now_ts();
    let out_dir = artifacts_dir_for(config, job);
    if let Err(e) = tokio::fs::create_dir_all(&out_dir).await {
        return infra_payload(started_at_ts, "artifacts_dir_failed", e.to_string());
    }

    match job.test_kind.as_str() {
        "stepflow" => execute_stepflow(config, session, job, &out_dir, started_at_ts).await,
        "playwright_python" | "puppeteer_js" => {
            execute_sandboxed(config, job, &out_dir, started_at_ts).await
        }
        other => RunPayload {
            status: "fail".to_owned(),
            elapsed_ms: None,
            error_kind: Some("invalid_definition".to_owned()),
            error_message: Some(format!("unknown test kind: {other}")),
            final_url: None,
            title: None,
            artifacts: json!({}),
            started_at_ts,
            finished_at_ts: now_ts(),
        },
    }
}

async fn execute_stepflow(
    config: &RunnerConfig,
    session: &BrowserSession,
    job: &Job,
    out_dir: &Path,
    started_at_ts: f64,
) -> RunPayload {
    let flow: StepFlow = match serde_json::from_value(job.definition.clone()) {
        Ok(flow) => flow,
        Err(e) => {
            return RunPayload {
                status: "fail".to_owned(),
                elapsed_ms: None,
                error_kind: Some("invalid_definition".to_owned()),
                error_message: Some(e.to_string()),
                final_url: None,
                title: None,
                artifacts: json!({}),
                started_at_ts,
                finished_at_ts: now_ts(),
            };
        }
    };

    let page = match session.new_page().await {
        Ok(page) => page,
        Err(e) => {
            return infra_payload(
                started_at_ts,
                if e.is_browser_infra() {
                    vigil_core::kinds::BROWSER_INFRA_ERROR
                } else {
                    vigil_core::kinds::RUNNER_LAUNCH_FAILED
                },
                e.to_string(),
            );
        }
    };

    let started = Instant::now();
    #[allow(clippy::cast_sign_loss)]
    let deadline = started + Duration::from_secs(job.timeout_seconds.max(1) as u64);
    let mut ctx = StepContext::new(&page, &job.base_url, deadline);
    ctx.artifacts_dir = Some(out_dir.to_path_buf());

    let result = execute_steps(&mut ctx, &flow.steps).await;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    let final_url = page.url().await.ok().flatten();
    let title = page.get_title().await.ok().flatten();
    let mut artifacts = ctx.artifacts.clone();

    let payload = match result {
        Ok(()) => RunPayload {
            status: "pass".to_owned(),
            elapsed_ms: Some(elapsed_ms),
            error_kind: None,
            error_message: None,
            final_url,
            title,
            artifacts: json!(artifacts),
            started_at_ts,
            finished_at_ts: now_ts(),
        },
        Err((step_idx, e)) => {
            let status = if e.is_browser_infra() { "infra_degraded" } else { "fail" };
            let error_message = format!("step[{step_idx}]: {e}");

            if status == "fail" {
                // failure.png + run.log; trace capture is delegated to
                // sandboxed children, which own a full driver.
                if let Ok(bytes) = page
                    .screenshot(ScreenshotParams::builder().full_page(true).build())
                    .await
                {
                    if tokio::fs::write(out_dir.join("failure.png"), bytes).await.is_ok() {
                        artifacts.insert("failure_screenshot".to_owned(), "failure.png".to_owned());
                    }
                }
                let log = serde_json::to_vec_pretty(&json!({
                    "status": status,
                    "error_kind": e.kind(),
                    "error_message": error_message,
                    "failed_step": step_idx,
                    "final_url": final_url,
                    "title": title,
                }))
                .unwrap_or_default();
                if tokio::fs::write(out_dir.join("run.log"), log).await.is_ok() {
                    artifacts.insert("run_log".to_owned(), "run.log".to_owned());
                }
            }

            RunPayload {
                status: status.to_owned(),
                elapsed_ms: Some(elapsed_ms),
                error_kind: Some(e.kind().to_owned()),
                error_message: Some(error_message),
                final_url,
                title,
                artifacts: json!(artifacts),
                started_at_ts,
                finished_at_ts: now_ts(),
            }
        }
    };

    let _ = page.close().await;
    payload
}

async fn execute_sandboxed(
    config: &RunnerConfig,
    job: &Job,
    out_dir: &Path,
    started_at_ts: f64,
) -> RunPayload {
    let Some(relpath) = job.source_relpath.as_deref().filter(|p| !p.is_empty()) else {
        return RunPayload {
            status: "fail".to_owned(),
            elapsed_ms: None,
            error_kind: Some("invalid_definition".to_owned()),
            error_message: Some("missing source for code-based test".to_owned()),
            final_url: None,
            title: None,
            artifacts: json!({}),
            started_at_ts,
            finished_at_ts: now_ts(),
        };
    };
    let source_path = Path::new(&config.tests_dir).join(relpath);
    let interpreter = if job.test_kind == "playwright_python" {
        &config.python_bin
    } else {
        &config.node_bin
    };
    #[allow(clippy::cast_sign_loss)]
    let timeout = Duration::from_secs(job.timeout_seconds.max(1) as u64);

    info!(run = %job.run_id, kind = %job.test_kind, "spawning sandbox child");
    let outcome = run_in_sandbox(
        interpreter,
        &source_path,
        &job.base_url,
        out_dir,
        timeout,
        config.trace_on_failure,
    )
    .await;

    match outcome {
        SandboxOutcome::Finished(result) => {
            // A browser-infra failure inside the child is not a verdict
            // about the target.
            let status = if result.browser_infra_error && result.status != "pass" {
                "infra_degraded".to_owned()
            } else {
                result.status.clone()
            };
            let error_kind = if result.browser_infra_error && result.status != "pass" {
                Some(vigil_core::kinds::BROWSER_INFRA_ERROR.to_owned())
            } else {
                result.error_kind.clone()
            };
            RunPayload {
                status,
                elapsed_ms: result.elapsed_ms,
                error_kind,
                error_message: result.error_message,
                final_url: result.final_url,
                title: result.title,
                artifacts: json!(result.artifacts),
                started_at_ts,
                finished_at_ts: now_ts(),
            }
        }
        SandboxOutcome::TimedOut => {
            warn!(run = %job.run_id, "sandbox child timed out");
            infra_payload(started_at_ts, vigil_core::kinds::TIMEOUT, "child exceeded timeout".to_owned())
        }
        SandboxOutcome::ProtocolError { exit_code, tail } => infra_payload(
            started_at_ts,
            "sandbox_protocol_error",
            format!("exit={exit_code:?} tail={tail}"),
        ),
        SandboxOutcome::SpawnFailed(message) => {
            infra_payload(started_at_ts, vigil_core::kinds::RUNNER_LAUNCH_FAILED, message)
        }
    }
}
