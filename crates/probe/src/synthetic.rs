//! Synthetic multi-step transactions driven over a fresh page.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use vigil_core::check::SyntheticTransaction;

use crate::browser::BrowserSession;
use crate::steps::{StepContext, execute_steps};

/// Result of one synthetic transaction.
#[derive(Debug, Clone, Serialize)]
pub struct SyntheticOutcome {
    pub domain: String,
    pub name: String,
    pub ok: bool,
    pub elapsed_ms: f64,
    pub error: Option<String>,
    pub failed_step: Option<usize>,
    pub final_url: Option<String>,
    pub browser_infra_error: bool,
}

/// Drive one transaction over a single page. One step failure fails the
/// transaction; browser infra errors are flagged so the caller can keep
/// them out of the debounced state.
pub async fn run_synthetic_transaction(
    session: &BrowserSession,
    domain: &str,
    base_url: &str,
    tx: &SyntheticTransaction,
    timeout: Duration,
) -> SyntheticOutcome {
    let started = Instant::now();
    let deadline = started + timeout.max(Duration::from_secs(1));
    let domain = domain.trim().to_lowercase();
    let name = tx.name.trim().chars().take(120).collect::<String>();
    let elapsed = |s: Instant| s.elapsed().as_secs_f64() * 1000.0;

    let page = match session.new_page().await {
        Ok(page) => page,
        Err(e) => {
            return SyntheticOutcome {
                domain,
                name,
                ok: false,
                elapsed_ms: elapsed(started),
                error: Some(e.to_string()),
                failed_step: None,
                final_url: None,
                browser_infra_error: e.is_browser_infra(),
            };
        }
    };

    let mut ctx = StepContext::new(&page, base_url, deadline);
    let steps: Vec<_> = tx.steps.iter().take(60).cloned().collect();
    let result = execute_steps(&mut ctx, &steps).await;
    let final_url = page.url().await.ok().flatten();
    let _ = page.close().await;

    match result {
        Ok(()) => SyntheticOutcome {
            domain,
            name,
            ok: true,
            elapsed_ms: elapsed(started),
            error: None,
            failed_step: None,
            final_url,
            browser_infra_error: false,
        },
        Err((idx, e)) => SyntheticOutcome {
            domain,
            name,
            ok: false,
            elapsed_ms: elapsed(started),
            browser_infra_error: e.is_browser_infra(),
            error: Some(e.to_string()),
            failed_step: Some(idx),
            final_url,
        },
    }
}
