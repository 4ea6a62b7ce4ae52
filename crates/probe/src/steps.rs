//! Total step executor for declarative browser flows.
//!
//! The validator (registry) or config (monitor) produces the tagged
//! [`Step`] variant; this module dispatches it against a live page. One
//! failing step fails the flow.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::page::{Page, ScreenshotParams};
use regex::Regex;
use thiserror::Error;
use tokio::time::Instant;

use vigil_core::check::SelectorCheck;
use vigil_core::step::Step;

use crate::browser::{body_text, selector_count, wait_for_selector_state};
use crate::error::ProbeError;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Z0-9_]{1,64})\}").unwrap());

/// Why a step failed.
#[derive(Debug, Error)]
pub enum StepError {
    /// An `expect_*` or text condition did not hold.
    #[error("assertion_failed: {0}")]
    Assertion(String),

    /// A selector never reached its required state within the budget.
    #[error("selector_missing: {0}")]
    SelectorMissing(String),

    /// The shared time budget ran out mid-flow.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Browser/driver failure while executing the step.
    #[error(transparent)]
    Browser(#[from] ProbeError),
}

impl StepError {
    #[must_use]
    pub fn is_browser_infra(&self) -> bool {
        matches!(self, StepError::Browser(e) if e.is_browser_infra())
    }

    /// Stable kind string for run records and alerts.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::Assertion(_) => vigil_core::kinds::ASSERTION_FAILED,
            StepError::SelectorMissing(_) => vigil_core::kinds::SELECTOR_MISSING,
            StepError::Timeout(_) => vigil_core::kinds::TIMEOUT,
            StepError::Browser(e) if e.is_browser_infra() => vigil_core::kinds::BROWSER_INFRA_ERROR,
            StepError::Browser(_) => vigil_core::kinds::ASSERTION_FAILED,
        }
    }
}

/// Expand `${ENVVAR}` secret placeholders from the process environment.
/// Unset variables expand to the empty string.
#[must_use]
pub fn expand_placeholders(text: &str) -> String {
    expand_with(text, |name| std::env::var(name).ok())
}

fn expand_with(text: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    PLACEHOLDER_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            lookup(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

/// Mutable execution context threaded through a flow.
pub struct StepContext<'a> {
    pub page: &'a Page,
    pub base_url: &'a str,
    pub deadline: Instant,
    /// Directory for `screenshot` steps; steps that need it fail when
    /// absent.
    pub artifacts_dir: Option<PathBuf>,
    /// Artifact name → file name, filled in as steps produce files.
    pub artifacts: BTreeMap<String, String>,
    /// Whether `${ENVVAR}` placeholders in `fill` text are expanded.
    pub expand_secrets: bool,
}

impl<'a> StepContext<'a> {
    #[must_use]
    pub fn new(page: &'a Page, base_url: &'a str, deadline: Instant) -> Self {
        Self {
            page,
            base_url,
            deadline,
            artifacts_dir: None,
            artifacts: BTreeMap::new(),
            expand_secrets: true,
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn check_budget(&self, step: &str) -> Result<(), StepError> {
        if self.remaining().is_zero() {
            return Err(StepError::Timeout(step.to_owned()));
        }
        Ok(())
    }

    fn resolve_url(&self, url: Option<&str>) -> String {
        match url {
            None | Some("") => self.base_url.to_owned(),
            Some(u) if u.starts_with('/') => {
                format!("{}/{}", self.base_url.trim_end_matches('/'), u.trim_start_matches('/'))
            }
            Some(u) => u.to_owned(),
        }
    }
}

async fn wait_attached(ctx: &StepContext<'_>, selector: &str) -> Result<(), StepError> {
    let check = SelectorCheck::new(selector).with_state(vigil_core::check::SelectorState::Attached);
    if wait_for_selector_state(ctx.page, &check, ctx.deadline).await? {
        Ok(())
    } else {
        Err(StepError::SelectorMissing(selector.to_owned()))
    }
}

/// Execute one step. Total over the [`Step`] variant.
#[allow(clippy::too_many_lines)]
pub async fn execute_step(ctx: &mut StepContext<'_>, step: &Step) -> Result<(), StepError> {
    match step {
        Step::Goto { url } => {
            ctx.check_budget("goto")?;
            let target = ctx.resolve_url(url.as_deref());
            // `goto` resolves when the navigate command is acknowledged,
            // not when the document is ready; later steps read the DOM, so
            // the lifecycle wait has to finish first.
            let navigation = async {
                ctx.page.goto(target.clone()).await?;
                ctx.page.wait_for_navigation().await?;
                Ok::<(), chromiumoxide::error::CdpError>(())
            };
            match tokio::time::timeout(ctx.remaining(), navigation).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(StepError::Browser(ProbeError::from(e))),
                Err(_) => Err(StepError::Timeout(format!("goto {target}"))),
            }
        }
        Step::Click { selector } => {
            wait_attached(ctx, selector).await?;
            let element = ctx
                .page
                .find_element(selector.as_str())
                .await
                .map_err(ProbeError::from)?;
            element.click().await.map_err(ProbeError::from)?;
            Ok(())
        }
        Step::Fill { selector, text } => {
            wait_attached(ctx, selector).await?;
            let value = if ctx.expand_secrets {
                expand_placeholders(text)
            } else {
                text.clone()
            };
            let element = ctx
                .page
                .find_element(selector.as_str())
                .await
                .map_err(ProbeError::from)?;
            element.click().await.map_err(ProbeError::from)?;
            element.type_str(value).await.map_err(ProbeError::from)?;
            Ok(())
        }
        Step::Press { selector, key } => {
            let target = selector.as_deref().unwrap_or("body");
            wait_attached(ctx, target).await?;
            let element = ctx
                .page
                .find_element(target)
                .await
                .map_err(ProbeError::from)?;
            element.press_key(key.as_str()).await.map_err(ProbeError::from)?;
            Ok(())
        }
        Step::WaitForSelector { selector, state } => {
            let check = SelectorCheck::new(selector.as_str()).with_state(*state);
            if wait_for_selector_state(ctx.page, &check, ctx.deadline)
                .await
                .map_err(StepError::Browser)?
            {
                Ok(())
            } else {
                Err(StepError::SelectorMissing(selector.clone()))
            }
        }
        Step::ExpectUrlContains { value } => {
            let current = ctx
                .page
                .url()
                .await
                .map_err(ProbeError::from)?
                .unwrap_or_default();
            if current.contains(value.as_str()) {
                Ok(())
            } else {
                Err(StepError::Assertion(format!(
                    "url_missing_substring: {value:?} not in {current:?}"
                )))
            }
        }
        Step::ExpectText { text } => {
            let body = body_text(ctx.page).await?.to_lowercase();
            if body.contains(&text.to_lowercase()) {
                Ok(())
            } else {
                Err(StepError::Assertion(format!("text_missing: {text:?}")))
            }
        }
        Step::ExpectTitleContains { text } => {
            let title = ctx
                .page
                .get_title()
                .await
                .map_err(ProbeError::from)?
                .unwrap_or_default();
            if title.to_lowercase().contains(&text.to_lowercase()) {
                Ok(())
            } else {
                Err(StepError::Assertion(format!(
                    "title_missing_substring: {text:?} not in {title:?}"
                )))
            }
        }
        Step::ExpectSelectorCount { selector, count } => {
            let found = selector_count(ctx.page, selector).await?;
            if found == *count {
                Ok(())
            } else {
                Err(StepError::Assertion(format!(
                    "selector_count_mismatch: {selector:?} expected {count} got {found}"
                )))
            }
        }
        Step::Screenshot { name } => {
            let Some(dir) = ctx.artifacts_dir.clone() else {
                return Err(StepError::Assertion("screenshot_requires_artifacts_dir".to_owned()));
            };
            let file_name = format!("screenshot_{name}.png");
            let bytes = ctx
                .page
                .screenshot(ScreenshotParams::builder().full_page(true).build())
                .await
                .map_err(ProbeError::from)?;
            tokio::fs::write(dir.join(&file_name), bytes)
                .await
                .map_err(ProbeError::from)?;
            ctx.artifacts.insert(format!("screenshot_{name}"), file_name);
            Ok(())
        }
        Step::SetViewport { width, height } => {
            let params = SetDeviceMetricsOverrideParams::builder()
                .width(i64::from(*width))
                .height(i64::from(*height))
                .device_scale_factor(1.0)
                .mobile(false)
                .build()
                .map_err(|e| StepError::Assertion(format!("invalid_viewport: {e}")))?;
            ctx.page.execute(params).await.map_err(ProbeError::from)?;
            Ok(())
        }
        Step::SleepMs { ms } => {
            let wanted = Duration::from_millis(*ms);
            tokio::time::sleep(wanted.min(ctx.remaining())).await;
            Ok(())
        }
    }
}

/// Run a whole flow, stopping at the first failing step. Returns the index
/// of the failed step alongside the error.
pub async fn execute_steps(
    ctx: &mut StepContext<'_>,
    steps: &[Step],
) -> Result<(), (usize, StepError)> {
    for (idx, step) in steps.iter().enumerate() {
        execute_step(ctx, step).await.map_err(|e| (idx, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_expand_via_lookup() {
        let lookup = |name: &str| (name == "SMOKE_PASSWORD").then(|| "s3cret".to_owned());
        assert_eq!(expand_with("user ${SMOKE_PASSWORD} end", lookup), "user s3cret end");
        assert_eq!(expand_with("${UNSET_VAR}", lookup), "");
        assert_eq!(expand_with("no refs", lookup), "no refs");
        assert_eq!(expand_with("${lowercase} stays", lookup), "${lowercase} stays");
    }

    #[test]
    fn step_error_kinds_are_stable() {
        assert_eq!(StepError::Assertion("x".to_owned()).kind(), "assertion_failed");
        assert_eq!(StepError::SelectorMissing("#a".to_owned()).kind(), "selector_missing");
        assert_eq!(StepError::Timeout("goto".to_owned()).kind(), "timeout");
        assert_eq!(
            StepError::Browser(ProbeError::Browser("Page crashed".to_owned())).kind(),
            "browser_infra_error"
        );
    }
}
