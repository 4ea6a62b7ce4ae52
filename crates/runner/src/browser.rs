//! Browser lifecycle with capped exponential backoff.
//!
//! The runner never claims work while the browser is unhealthy: a claimed
//! run would sit locked in `pending` until the lease times out.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use vigil_probe::browser::{BrowserOptions, BrowserSession};

const BACKOFF_CAP: Duration = Duration::from_secs(120);

pub struct BrowserManager {
    session: Option<BrowserSession>,
    launch_fail_count: u32,
    next_try_at: Option<Instant>,
}

impl BrowserManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            session: None,
            launch_fail_count: 0,
            next_try_at: None,
        }
    }

    /// A healthy session, or `None` while backing off after launch
    /// failures. Backoff doubles up to 120 s.
    pub async fn ensure(&mut self) -> Option<&BrowserSession> {
        let healthy = self.session.as_ref().is_some_and(BrowserSession::healthy);
        if healthy {
            return self.session.as_ref();
        }
        if let Some(dead) = self.session.take() {
            warn!("browser session unhealthy, relaunching");
            dead.close().await;
        }

        if let Some(next_try) = self.next_try_at {
            if Instant::now() < next_try {
                return None;
            }
        }

        match BrowserSession::launch(&BrowserOptions::default()).await {
            Ok(session) => {
                info!("browser launched");
                self.session = Some(session);
                self.launch_fail_count = 0;
                self.next_try_at = None;
                self.session.as_ref()
            }
            Err(e) => {
                self.launch_fail_count += 1;
                let backoff = Duration::from_secs(2 * 2_u64.pow(self.launch_fail_count.min(6)))
                    .min(BACKOFF_CAP);
                self.next_try_at = Some(Instant::now() + backoff);
                warn!(
                    error = %e,
                    failures = self.launch_fail_count,
                    backoff_seconds = backoff.as_secs(),
                    "browser launch failed"
                );
                None
            }
        }
    }

    pub async fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}

impl Default for BrowserManager {
    fn default() -> Self {
        Self::new()
    }
}
