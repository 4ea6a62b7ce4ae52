//! Web-vitals measurement: LCP, CLS and an INP approximation.
//!
//! An init script installs `PerformanceObserver`s before navigation; after
//! a full load plus a settle wait, the metrics are read back out of the
//! page context. INP is approximated as the maximum Event Timing duration
//! among entries with a non-zero `interactionId`.

use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::browser::BrowserSession;
use crate::error::ProbeError;

const VITALS_INIT_SCRIPT: &str = r#"
(() => {
  try {
    window.__vigilVitals = { lcp: null, cls: 0, inpMax: null, errors: [] };

    try {
      const lcpObs = new PerformanceObserver((list) => {
        const entries = list.getEntries();
        const last = entries && entries.length ? entries[entries.length - 1] : null;
        if (last && typeof last.startTime === 'number') {
          window.__vigilVitals.lcp = last.startTime;
        }
      });
      lcpObs.observe({ type: 'largest-contentful-paint', buffered: true });
    } catch (e) {
      window.__vigilVitals.errors.push('lcp:' + (e && e.message ? e.message : String(e)));
    }

    try {
      const clsObs = new PerformanceObserver((list) => {
        for (const entry of list.getEntries()) {
          if (!entry || entry.hadRecentInput) continue;
          if (typeof entry.value === 'number') window.__vigilVitals.cls += entry.value;
        }
      });
      clsObs.observe({ type: 'layout-shift', buffered: true });
    } catch (e) {
      window.__vigilVitals.errors.push('cls:' + (e && e.message ? e.message : String(e)));
    }

    try {
      const evtObs = new PerformanceObserver((list) => {
        for (const entry of list.getEntries()) {
          if (!entry || !(entry.interactionId || 0)) continue;
          if (typeof entry.duration !== 'number') continue;
          const prev = window.__vigilVitals.inpMax || 0;
          if (entry.duration > prev) window.__vigilVitals.inpMax = entry.duration;
        }
      });
      evtObs.observe({ type: 'event', buffered: true, durationThreshold: 0 });
    } catch (e) {
      window.__vigilVitals.errors.push('inp:' + (e && e.message ? e.message : String(e)));
    }
  } catch (e) {
    // init must never break the page
  }
})();
"#;

const VITALS_READ_SCRIPT: &str = r"
(() => {
  const v = window.__vigilVitals || {};
  const nav = performance.getEntriesByType('navigation')[0];
  const fcp = performance.getEntriesByName('first-contentful-paint')[0];
  return {
    lcp_ms: (typeof v.lcp === 'number' ? v.lcp : null),
    cls: (typeof v.cls === 'number' ? v.cls : null),
    inp_ms: (typeof v.inpMax === 'number' ? v.inpMax : null),
    ttfb_ms: (nav && typeof nav.responseStart === 'number' ? nav.responseStart : null),
    fcp_ms: (fcp && typeof fcp.startTime === 'number' ? fcp.startTime : null),
    dom_content_loaded_ms: (nav && typeof nav.domContentLoadedEventEnd === 'number' ? nav.domContentLoadedEventEnd : null),
    load_ms: (nav && typeof nav.loadEventEnd === 'number' ? nav.loadEventEnd : null),
    errors: (Array.isArray(v.errors) ? v.errors.slice(0, 10) : []),
  };
})()
";

/// Metrics read from the page context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebVitals {
    pub lcp_ms: Option<f64>,
    pub cls: Option<f64>,
    pub inp_ms: Option<f64>,
    pub ttfb_ms: Option<f64>,
    pub fcp_ms: Option<f64>,
    pub dom_content_loaded_ms: Option<f64>,
    pub load_ms: Option<f64>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Result of one web-vitals run.
#[derive(Debug, Clone, Serialize)]
pub struct WebVitalsOutcome {
    pub domain: String,
    pub ok: bool,
    pub metrics: WebVitals,
    pub error: Option<String>,
    pub elapsed_ms: f64,
    pub browser_infra_error: bool,
}

/// Load the page with vitals observers installed and read the metrics
/// after `post_load_wait`.
pub async fn measure_web_vitals(
    session: &BrowserSession,
    domain: &str,
    url: &str,
    timeout: Duration,
    post_load_wait: Duration,
) -> WebVitalsOutcome {
    let started = Instant::now();
    let domain = domain.trim().to_lowercase();
    let elapsed = |s: Instant| s.elapsed().as_secs_f64() * 1000.0;

    match measure_inner(session, url, timeout, post_load_wait).await {
        Ok(metrics) => WebVitalsOutcome {
            domain,
            ok: true,
            metrics,
            error: None,
            elapsed_ms: elapsed(started),
            browser_infra_error: false,
        },
        Err(e) => WebVitalsOutcome {
            domain,
            ok: false,
            metrics: WebVitals::default(),
            browser_infra_error: e.is_browser_infra(),
            error: Some(e.to_string()),
            elapsed_ms: elapsed(started),
        },
    }
}

async fn measure_inner(
    session: &BrowserSession,
    url: &str,
    timeout: Duration,
    post_load_wait: Duration,
) -> Result<WebVitals, ProbeError> {
    let page = session.new_page().await?;
    let result = async {
        // Vitals pages get a larger viewport than availability checks; LCP
        // candidates depend on it.
        let viewport = SetDeviceMetricsOverrideParams::builder()
            .width(1440)
            .height(900)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(ProbeError::Browser)?;
        page.execute(viewport).await?;
        page.evaluate_on_new_document(VITALS_INIT_SCRIPT).await?;

        match tokio::time::timeout(timeout.max(Duration::from_secs(1)), async {
            page.goto(url).await?;
            // domcontentloaded is too early for LCP; wait for full load.
            page.wait_for_navigation().await?;
            Ok::<(), chromiumoxide::error::CdpError>(())
        })
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ProbeError::from(e)),
            Err(_) => return Err(ProbeError::Browser(format!("vitals_goto_timeout: {url}"))),
        }

        tokio::time::sleep(post_load_wait).await;

        // A minimal interaction surfaces Event Timing entries for the INP
        // approximation.
        if let Ok(body) = page.find_element("body").await {
            let _ = body.click().await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let metrics: WebVitals = page
            .evaluate(VITALS_READ_SCRIPT)
            .await?
            .into_value()
            .unwrap_or_default();
        Ok(metrics)
    }
    .await;

    let _ = page.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_script_returns_every_metric_key() {
        for key in [
            "lcp_ms",
            "cls",
            "inp_ms",
            "ttfb_ms",
            "fcp_ms",
            "dom_content_loaded_ms",
            "load_ms",
        ] {
            assert!(VITALS_READ_SCRIPT.contains(key), "missing {key}");
        }
    }

    #[test]
    fn init_script_observes_all_three_signals() {
        assert!(VITALS_INIT_SCRIPT.contains("largest-contentful-paint"));
        assert!(VITALS_INIT_SCRIPT.contains("layout-shift"));
        assert!(VITALS_INIT_SCRIPT.contains("interactionId"));
        assert!(VITALS_INIT_SCRIPT.contains("hadRecentInput"));
    }

    #[test]
    fn vitals_deserialize_with_nulls() {
        let v: WebVitals = serde_json::from_str(
            r#"{"lcp_ms": 1200.5, "cls": 0.02, "inp_ms": null, "ttfb_ms": null,
                "fcp_ms": null, "dom_content_loaded_ms": null, "load_ms": null, "errors": []}"#,
        )
        .unwrap();
        assert_eq!(v.lcp_ms, Some(1200.5));
        assert_eq!(v.inp_ms, None);
    }
}
