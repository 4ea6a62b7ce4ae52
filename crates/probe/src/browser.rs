//! Shared headless-Chromium session and the per-domain browser check.
//!
//! One browser process is shared by all checks in a cycle; every check gets
//! a fresh page. Selector conditions are polled through `evaluate` against
//! a shared deadline, so a check's wall time stays close to one timeout
//! budget even when several selectors are missing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::SetBlockedUrLsParams;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use vigil_core::check::{CheckSpec, SelectorCheck, SelectorState, normalize_text};

use crate::error::ProbeError;

const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(150);

/// URL patterns blocked on every page: images, media and fonts are dead
/// weight for availability checks.
const BLOCKED_URL_PATTERNS: [&str; 13] = [
    "*.png", "*.jpg", "*.jpeg", "*.gif", "*.webp", "*.svg", "*.ico", "*.mp4", "*.webm", "*.mp3",
    "*.woff", "*.woff2", "*.ttf",
];

/// Browser launch options.
#[derive(Debug, Clone, Default)]
pub struct BrowserOptions {
    /// Explicit Chromium binary; discovered when absent.
    pub executable: Option<PathBuf>,
}

/// Locate a Chromium/Chrome binary: `CHROMIUM_PATH` first, then the usual
/// install locations.
#[must_use]
pub fn find_chromium_executable() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("CHROMIUM_PATH") {
        let p = PathBuf::from(env_path);
        if p.exists() {
            return Some(p);
        }
    }
    [
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}

fn dev_shm_is_tiny() -> bool {
    match nix::sys::statvfs::statvfs("/dev/shm") {
        Ok(st) => {
            let bytes = st.fragment_size() as u128 * st.blocks() as u128;
            bytes > 0 && bytes < 512 * 1024 * 1024
        }
        Err(_) => false,
    }
}

/// The stable flag set used for every launch. `--disable-dev-shm-usage` is
/// added when `/dev/shm` is under 512 MiB (renderers crash otherwise).
#[must_use]
pub fn stable_launch_args() -> Vec<String> {
    let mut args: Vec<String> = [
        "--disable-gpu",
        "--disable-extensions",
        "--disable-background-networking",
        "--disable-background-timer-throttling",
        "--disable-backgrounding-occluded-windows",
        "--disable-renderer-backgrounding",
        "--disable-sync",
        "--metrics-recording-only",
        "--no-first-run",
        "--no-default-browser-check",
        "--disable-features=site-per-process",
    ]
    .iter()
    .map(|s| (*s).to_owned())
    .collect();
    if dev_shm_is_tiny() {
        args.insert(0, "--disable-dev-shm-usage".to_owned());
    }
    args
}

/// A live headless browser plus its CDP event pump.
pub struct BrowserSession {
    browser: Browser,
    handler_task: JoinHandle<()>,
}

impl BrowserSession {
    /// Launch headless Chromium with the stable flag set.
    pub async fn launch(options: &BrowserOptions) -> Result<Self, ProbeError> {
        let executable = options
            .executable
            .clone()
            .or_else(find_chromium_executable)
            .ok_or_else(|| {
                ProbeError::BrowserLaunch(
                    "could not find a Chromium executable (set CHROMIUM_PATH)".to_owned(),
                )
            })?;

        let mut builder = BrowserConfig::builder()
            .chrome_executable(executable)
            .no_sandbox()
            .viewport(Viewport {
                width: 1280,
                height: 720,
                ..Viewport::default()
            });
        for arg in stable_launch_args() {
            builder = builder.arg(arg);
        }
        let config = builder.build().map_err(ProbeError::BrowserLaunch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| ProbeError::BrowserLaunch(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        debug!("browser session launched");
        Ok(Self {
            browser,
            handler_task,
        })
    }

    /// The session is healthy while its event pump is still running.
    #[must_use]
    pub fn healthy(&self) -> bool {
        !self.handler_task.is_finished()
    }

    /// Open a blank page with heavy resource types blocked.
    pub async fn new_page(&self) -> Result<Page, ProbeError> {
        let page = self.browser.new_page("about:blank").await?;
        if let Err(e) = page
            .execute(SetBlockedUrLsParams::new(
                BLOCKED_URL_PATTERNS.iter().map(|s| (*s).to_owned()).collect::<Vec<_>>(),
            ))
            .await
        {
            debug!(error = %e, "resource blocking unavailable");
        }
        Ok(page)
    }

    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!(error = %e, "browser close failed");
        }
        let _ = self.browser.wait().await;
        self.handler_task.abort();
    }
}

fn selector_state_expr(selector: &str, state: SelectorState) -> String {
    let sel = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_owned());
    let predicate = match state {
        SelectorState::Attached => "el !== null",
        SelectorState::Detached => "el === null",
        SelectorState::Visible => "visible",
        SelectorState::Hidden => "!visible",
    };
    format!(
        "(() => {{
            const el = document.querySelector({sel});
            let visible = false;
            if (el) {{
                const rect = el.getBoundingClientRect();
                const style = window.getComputedStyle(el);
                visible = rect.width > 0 && rect.height > 0 && style.visibility !== 'hidden';
            }}
            return {predicate};
        }})()"
    )
}

async fn selector_in_state(page: &Page, check: &SelectorCheck) -> Result<bool, ProbeError> {
    let expr = selector_state_expr(&check.selector, check.state);
    let value: bool = page.evaluate(expr).await?.into_value().unwrap_or(false);
    Ok(value)
}

/// Poll a selector until it reaches the required state or the deadline
/// passes. `Ok(false)` means the deadline elapsed.
pub async fn wait_for_selector_state(
    page: &Page,
    check: &SelectorCheck,
    deadline: Instant,
) -> Result<bool, ProbeError> {
    loop {
        if selector_in_state(page, check).await? {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(SELECTOR_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))).await;
    }
}

/// Race a candidate list: success as soon as any selector reaches its
/// state. The poll is a single combined evaluation per tick, so the total
/// wall time is ~one timeout budget even when every candidate is missing.
pub async fn wait_for_any_selector(
    page: &Page,
    checks: &[SelectorCheck],
    deadline: Instant,
) -> Result<bool, ProbeError> {
    if checks.is_empty() {
        return Ok(true);
    }
    loop {
        for check in checks {
            if selector_in_state(page, check).await? {
                return Ok(true);
            }
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(SELECTOR_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))).await;
    }
}

/// Visible page text (`document.body.innerText`).
pub async fn body_text(page: &Page) -> Result<String, ProbeError> {
    let text: String = page
        .evaluate("document.body ? document.body.innerText : ''")
        .await?
        .into_value()
        .unwrap_or_default();
    Ok(text)
}

/// Count of elements matching a selector.
pub async fn selector_count(page: &Page, selector: &str) -> Result<u32, ProbeError> {
    let sel = serde_json::to_string(selector)?;
    let count: u32 = page
        .evaluate(format!("document.querySelectorAll({sel}).length"))
        .await?
        .into_value()
        .unwrap_or(0);
    Ok(count)
}

/// Result of one headless-browser check.
#[derive(Debug, Clone, Serialize)]
pub struct BrowserCheckOutcome {
    pub ok: bool,
    pub reason: String,
    pub final_url: Option<String>,
    pub title: Option<String>,
    pub title_ok: bool,
    pub forbidden_hits: Vec<String>,
    pub missing_selectors_all: Vec<String>,
    pub required_any_ok: bool,
    pub missing_text: Vec<String>,
    pub elapsed_ms: f64,
    pub browser_infra_error: bool,
    pub error: Option<String>,
}

impl BrowserCheckOutcome {
    fn degraded(error: String, elapsed_ms: f64) -> Self {
        Self {
            ok: false,
            reason: "browser_degraded".to_owned(),
            final_url: None,
            title: None,
            title_ok: true,
            forbidden_hits: Vec::new(),
            missing_selectors_all: Vec::new(),
            required_any_ok: true,
            missing_text: Vec::new(),
            elapsed_ms,
            browser_infra_error: true,
            error: Some(error),
        }
    }

    fn failed(error: String, elapsed_ms: f64) -> Self {
        Self {
            browser_infra_error: false,
            reason: "browser_check_failed".to_owned(),
            ..Self::degraded(error, elapsed_ms)
        }
    }
}

/// Load the page and verify title, selectors, text and final host under
/// one shared timeout budget.
pub async fn browser_check(session: &BrowserSession, spec: &CheckSpec) -> BrowserCheckOutcome {
    let started = Instant::now();
    let deadline = started + Duration::from_secs_f64(spec.browser_timeout_seconds.max(1.0));
    let elapsed = |s: Instant| s.elapsed().as_secs_f64() * 1000.0;

    match browser_check_inner(session, spec, deadline).await {
        Ok(mut outcome) => {
            outcome.elapsed_ms = elapsed(started);
            outcome
        }
        Err(e) => {
            let msg = e.to_string();
            if e.is_browser_infra() {
                BrowserCheckOutcome::degraded(msg, elapsed(started))
            } else {
                BrowserCheckOutcome::failed(msg, elapsed(started))
            }
        }
    }
}

async fn browser_check_inner(
    session: &BrowserSession,
    spec: &CheckSpec,
    deadline: Instant,
) -> Result<BrowserCheckOutcome, ProbeError> {
    let page = session.new_page().await?;
    let result = page_checks(&page, spec, deadline).await;
    let _ = page.close().await;
    result
}

async fn page_checks(
    page: &Page,
    spec: &CheckSpec,
    deadline: Instant,
) -> Result<BrowserCheckOutcome, ProbeError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    // `goto` resolves when the navigate command is acknowledged, not when
    // the document is ready; the lifecycle wait must complete before any
    // title/body/selector read.
    let navigation = async {
        page.goto(spec.url.clone()).await?;
        page.wait_for_navigation().await?;
        Ok::<(), chromiumoxide::error::CdpError>(())
    };
    match tokio::time::timeout(remaining, navigation).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(ProbeError::from(e)),
        Err(_) => {
            return Ok(BrowserCheckOutcome::failed(
                format!("browser_goto_timeout: {}", spec.url),
                0.0,
            ));
        }
    }

    let title = page.get_title().await?;
    let title_ok = spec.expected_title_contains.as_deref().is_none_or(|want| {
        title
            .as_deref()
            .unwrap_or("")
            .to_lowercase()
            .contains(&want.to_lowercase())
    });

    let body = normalize_text(&body_text(page).await?);
    let forbidden_hits = spec.forbidden_hits(&body);
    let missing_text: Vec<String> = spec
        .required_text_all
        .iter()
        .filter(|t| !body.contains(&normalize_text(t)))
        .cloned()
        .collect();

    // Selector conditions run concurrently against the one shared deadline.
    let all_waits = futures::future::join_all(
        spec.required_selectors_all
            .iter()
            .map(|check| wait_for_selector_state(page, check, deadline)),
    );
    let any_wait = wait_for_any_selector(page, &spec.required_selectors_any, deadline);
    let (all_results, required_any_ok) = tokio::join!(all_waits, any_wait);

    let mut missing_selectors_all = Vec::new();
    for (check, found) in spec.required_selectors_all.iter().zip(all_results) {
        if !found? {
            missing_selectors_all.push(check.selector.clone());
        }
    }
    let required_any_ok = required_any_ok?;

    let final_url = page.url().await?.unwrap_or_default();
    let final_host_ok = url::Url::parse(&final_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
        .is_none_or(|h| spec.final_host_allowed(&h));

    let ok = title_ok
        && forbidden_hits.is_empty()
        && missing_selectors_all.is_empty()
        && required_any_ok
        && missing_text.is_empty()
        && final_host_ok;

    let reason = if ok {
        "ok".to_owned()
    } else if !final_host_ok {
        "final_host_mismatch".to_owned()
    } else if !missing_selectors_all.is_empty() || !required_any_ok {
        "selector_missing".to_owned()
    } else if !forbidden_hits.is_empty() {
        "forbidden_text".to_owned()
    } else {
        "assertion_failed".to_owned()
    };

    Ok(BrowserCheckOutcome {
        ok,
        reason,
        final_url: Some(final_url),
        title,
        title_ok,
        forbidden_hits,
        missing_selectors_all,
        required_any_ok,
        missing_text,
        elapsed_ms: 0.0,
        browser_infra_error: false,
        error: None,
    })
}
