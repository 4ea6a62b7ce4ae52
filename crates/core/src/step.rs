//! Tagged step representation for declarative browser flows.
//!
//! The validator turns untrusted submissions into this variant; executors
//! only ever dispatch on the variant. The monitor's synthetic transactions
//! deserialize the same shape straight from config.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::check::SelectorState;

/// Secret references look like `${SMOKE_PASSWORD}`. Large literal `fill`
/// texts without one are rejected to keep raw secrets out of definitions.
static SECRET_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{[A-Z0-9_]{1,64}\}").unwrap());

const MAX_STEPS: usize = 60;
const MAX_FILL_TEXT: usize = 5_000;
const FILL_PLACEHOLDER_THRESHOLD: usize = 512;
const MAX_SLEEP_MS: u64 = 30_000;

fn default_press_key() -> String {
    "Enter".to_owned()
}

fn visible() -> SelectorState {
    SelectorState::Visible
}

/// One operation in a step flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Goto {
        #[serde(default)]
        url: Option<String>,
    },
    Click {
        selector: String,
    },
    Fill {
        selector: String,
        #[serde(default)]
        text: String,
    },
    Press {
        #[serde(default)]
        selector: Option<String>,
        #[serde(default = "default_press_key")]
        key: String,
    },
    WaitForSelector {
        selector: String,
        #[serde(default = "visible")]
        state: SelectorState,
    },
    ExpectUrlContains {
        value: String,
    },
    ExpectText {
        text: String,
    },
    ExpectTitleContains {
        text: String,
    },
    ExpectSelectorCount {
        selector: String,
        count: u32,
    },
    Screenshot {
        name: String,
    },
    SetViewport {
        width: u32,
        height: u32,
    },
    #[serde(rename = "sleep_ms", alias = "sleep")]
    SleepMs {
        ms: u64,
    },
}

/// Validated and normalized flow: `{name, steps}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFlow {
    pub name: String,
    pub steps: Vec<Step>,
}

/// Validation failure with the stable reason string surfaced to callers
/// (`unknown_step_type[3]: zap`, `fill_text_must_use_secret_placeholder[1]`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct StepFlowError(pub String);

impl StepFlowError {
    fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

fn req_str(step: &serde_json::Value, key: &str) -> Option<String> {
    let s = step.get(key)?.as_str()?.trim();
    if s.is_empty() { None } else { Some(s.to_owned()) }
}

fn truncate(s: String, max: usize) -> String {
    if s.chars().count() <= max {
        s
    } else {
        s.chars().take(max).collect()
    }
}

fn selector_state(step: &serde_json::Value) -> SelectorState {
    match step.get("state").and_then(serde_json::Value::as_str) {
        Some("attached") => SelectorState::Attached,
        Some("detached") => SelectorState::Detached,
        Some("hidden") => SelectorState::Hidden,
        _ => SelectorState::Visible,
    }
}

/// Validate a submitted definition and normalize it into a [`StepFlow`].
pub fn validate_definition(defn: &serde_json::Value) -> Result<StepFlow, StepFlowError> {
    let obj = defn
        .as_object()
        .ok_or_else(|| StepFlowError::new("definition_must_be_object"))?;

    let name = obj
        .get("name")
        .or_else(|| obj.get("test_name"))
        .and_then(serde_json::Value::as_str)
        .unwrap_or("test")
        .trim();
    let name = truncate(if name.is_empty() { "test" } else { name }.to_owned(), 120);

    let steps = obj
        .get("steps")
        .and_then(serde_json::Value::as_array)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| StepFlowError::new("missing_steps"))?;
    if steps.len() > MAX_STEPS {
        return Err(StepFlowError::new("too_many_steps"));
    }

    let mut out = Vec::with_capacity(steps.len());
    for (idx, raw) in steps.iter().enumerate() {
        if !raw.is_object() {
            return Err(StepFlowError::new(format!("invalid_step[{idx}]")));
        }
        let typ = raw
            .get("type")
            .and_then(serde_json::Value::as_str)
            .map(|s| s.trim().to_lowercase())
            .unwrap_or_default();
        if typ.is_empty() {
            return Err(StepFlowError::new(format!("missing_step_type[{idx}]")));
        }

        let step = match typ.as_str() {
            "goto" => Step::Goto {
                url: req_str(raw, "url").map(|u| truncate(u, 2_000)),
            },
            "click" => Step::Click {
                selector: truncate(
                    req_str(raw, "selector")
                        .ok_or_else(|| StepFlowError::new(format!("missing_selector[{idx}]")))?,
                    500,
                ),
            },
            "fill" => {
                let selector = req_str(raw, "selector")
                    .ok_or_else(|| StepFlowError::new(format!("missing_selector[{idx}]")))?;
                let text = raw
                    .get("text")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                if text.chars().count() > MAX_FILL_TEXT {
                    return Err(StepFlowError::new(format!("text_too_long[{idx}]")));
                }
                if text.chars().count() > FILL_PLACEHOLDER_THRESHOLD
                    && !SECRET_REF_RE.is_match(&text)
                {
                    return Err(StepFlowError::new(format!(
                        "fill_text_must_use_secret_placeholder[{idx}]"
                    )));
                }
                Step::Fill {
                    selector: truncate(selector, 500),
                    text,
                }
            }
            "press" => Step::Press {
                selector: req_str(raw, "selector").map(|s| truncate(s, 500)),
                key: truncate(req_str(raw, "key").unwrap_or_else(default_press_key), 80),
            },
            "wait_for_selector" => Step::WaitForSelector {
                selector: truncate(
                    req_str(raw, "selector")
                        .ok_or_else(|| StepFlowError::new(format!("missing_selector[{idx}]")))?,
                    500,
                ),
                state: selector_state(raw),
            },
            "expect_url_contains" => Step::ExpectUrlContains {
                value: truncate(
                    req_str(raw, "value")
                        .ok_or_else(|| StepFlowError::new(format!("missing_value[{idx}]")))?,
                    500,
                ),
            },
            "expect_text" => Step::ExpectText {
                text: truncate(
                    req_str(raw, "text")
                        .ok_or_else(|| StepFlowError::new(format!("missing_text[{idx}]")))?,
                    500,
                ),
            },
            "expect_title_contains" => Step::ExpectTitleContains {
                text: truncate(
                    req_str(raw, "text")
                        .or_else(|| req_str(raw, "value"))
                        .ok_or_else(|| StepFlowError::new(format!("missing_text[{idx}]")))?,
                    200,
                ),
            },
            "expect_selector_count" => {
                let selector = req_str(raw, "selector")
                    .ok_or_else(|| StepFlowError::new(format!("missing_selector[{idx}]")))?;
                let count = raw
                    .get("count")
                    .and_then(serde_json::Value::as_u64)
                    .filter(|c| *c <= 10_000)
                    .and_then(|c| u32::try_from(c).ok())
                    .ok_or_else(|| StepFlowError::new(format!("invalid_count[{idx}]")))?;
                Step::ExpectSelectorCount {
                    selector: truncate(selector, 500),
                    count,
                }
            }
            "screenshot" => Step::Screenshot {
                name: truncate(req_str(raw, "name").unwrap_or_else(|| "screenshot".to_owned()), 80),
            },
            "set_viewport" => {
                let dim = |key: &str| {
                    raw.get(key)
                        .and_then(serde_json::Value::as_u64)
                        .filter(|v| (100..=5_000).contains(v))
                        .and_then(|v| u32::try_from(v).ok())
                };
                let (Some(width), Some(height)) = (dim("width"), dim("height")) else {
                    return Err(StepFlowError::new(format!("invalid_viewport[{idx}]")));
                };
                Step::SetViewport { width, height }
            }
            "sleep" | "sleep_ms" => Step::SleepMs {
                ms: raw
                    .get("ms")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(250)
                    .min(MAX_SLEEP_MS),
            },
            other => {
                return Err(StepFlowError::new(format!("unknown_step_type[{idx}]: {other}")));
            }
        };
        out.push(step);
    }

    Ok(StepFlow { name, steps: out })
}
