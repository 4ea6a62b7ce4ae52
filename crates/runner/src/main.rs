use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use vigil_core::time::now_ts;
use vigil_runner::browser::BrowserManager;
use vigil_runner::client::{RegistryClient, RunPayload};
use vigil_runner::config::RunnerConfig;
use vigil_runner::execute::execute_job;

/// Vigil E2E runner worker.
#[derive(Parser, Debug)]
#[command(name = "vigil-runner", about = "Claims due E2E runs and executes them")]
struct Cli {
    /// Run a single claim+execute pass then exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = RunnerConfig::from_env();
    if config.runner_token.is_empty() {
        return Err("Missing E2E_REGISTRY_RUNNER_TOKEN".into());
    }

    let client = RegistryClient::new(
        reqwest::Client::new(),
        config.registry_base_url.clone(),
        config.runner_token.clone(),
    );
    let mut browser = BrowserManager::new();

    info!(
        registry = %config.registry_base_url,
        concurrency = config.concurrency,
        "runner starting"
    );

    loop {
        let did_work = run_pass(&config, &client, &mut browser).await;
        if cli.once {
            break;
        }
        if !did_work {
            tokio::time::sleep(Duration::from_secs_f64(config.poll_seconds)).await;
        }
    }

    browser.shutdown().await;
    Ok(())
}

/// One pass: ensure the browser, claim, execute, complete. Returns whether
/// any job ran (idle passes sleep before polling again).
async fn run_pass(
    config: &RunnerConfig,
    client: &RegistryClient,
    browser: &mut BrowserManager,
) -> bool {
    // Never claim while the browser is down; a claimed run would sit
    // locked until the lease times out.
    if browser.ensure().await.is_none() {
        return false;
    }

    let jobs = match client.claim(config.concurrency).await {
        Ok(jobs) => jobs,
        Err(e) => {
            warn!(error = %e, "claim failed");
            return false;
        }
    };
    if jobs.is_empty() {
        return false;
    }

    for job in &jobs {
        let payload = match browser.ensure().await {
            Some(session) => execute_job(config, session, job).await,
            None => RunPayload {
                status: "infra_degraded".to_owned(),
                elapsed_ms: None,
                error_kind: Some(vigil_core::kinds::RUNNER_LAUNCH_FAILED.to_owned()),
                error_message: Some("browser lost between claim and execute".to_owned()),
                final_url: None,
                title: None,
                artifacts: serde_json::json!({}),
                started_at_ts: now_ts(),
                finished_at_ts: now_ts(),
            },
        };

        // Completion always goes out, even for infra degradation, so the
        // lease is released promptly.
        if let Err(e) = client.complete(&job.run_id, &payload).await {
            warn!(run = %job.run_id, error = %e, "complete failed");
        } else {
            info!(run = %job.run_id, status = %payload.status, "run completed");
        }
    }
    true
}
