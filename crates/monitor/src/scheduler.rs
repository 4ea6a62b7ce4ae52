//! Cycle orchestration.
//!
//! One cycle probes every enabled domain (HTTP, then browser behind a
//! semaphore), gathers the cross-cutting signals concurrently, feeds the
//! debounce machines, appends effective samples to history, raises and
//! clears alerts, escalates confirmed failures to the dispatcher, and
//! persists state atomically. State is owned by this task; dispatcher
//! tasks report back over a channel drained at the top of each cycle.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tracing::{info, warn};

use vigil_core::analytics::RedThresholds;
use vigil_core::debounce::{DebounceConfig, StreakState, apply_observation};
use vigil_core::signal::SignalKind;
use vigil_core::time::now_ts;
use vigil_dispatch::DispatchClient;
use vigil_probe::browser::{BrowserOptions, BrowserSession, browser_check};
use vigil_probe::containers::{ContainerHealthConfig, check_container_health};
use vigil_probe::dns::{DnsCheckConfig, check_dns};
use vigil_probe::docker::DockerClient;
use vigil_probe::host::snapshot_host;
use vigil_probe::http::{HttpCheckOutcome, build_http_client, http_get_check};
use vigil_probe::synthetic::run_synthetic_transaction;
use vigil_probe::tls::check_tls_cert;
use vigil_probe::web_vitals::measure_web_vitals;
use vigil_telegram::TelegramClient;

use crate::alerts;
use crate::config::{DomainEntry, MonitorConfig, load_config};
use crate::error::MonitorError;
use crate::signals::{
    SignalObservation, fold_containers, fold_dns, fold_host, fold_nginx, fold_performance,
    fold_proxy, fold_red, fold_slo, fold_synthetics, fold_tls, fold_web_vitals,
};
use crate::state::{DispatchRecord, MonitorState};

const STATE_WRITE_FAIL_THRESHOLD: u32 = 3;

/// Per-domain result of the probe fan-out.
#[derive(Debug)]
struct DomainOutcome {
    domain: String,
    observed_ok: bool,
    reason: String,
    http_elapsed_ms: Option<f64>,
    browser_elapsed_ms: Option<f64>,
    status_code: Option<u16>,
    details: serde_json::Value,
    /// The browser check ran and hit an infrastructure error; the whole
    /// observation is neutral and must not feed the debounce machine.
    browser_infra: bool,
    /// The shared browser session was down, so only the HTTP check ran.
    /// The HTTP verdict still feeds the debounce machine; this flag only
    /// degrades the cross-cutting browser signal.
    browser_unavailable: bool,
}

/// The long-running monitor.
pub struct Monitor {
    config_path: PathBuf,
    state_path: PathBuf,
    http: reqwest::Client,
    telegram: Option<TelegramClient>,
    dispatch: Option<DispatchClient>,
    browser: Option<BrowserSession>,
    state: MonitorState,
    dispatch_tx: mpsc::UnboundedSender<DispatchRecord>,
    dispatch_rx: mpsc::UnboundedReceiver<DispatchRecord>,
}

impl Monitor {
    #[must_use]
    pub fn new(
        config_path: PathBuf,
        state_path: PathBuf,
        telegram: Option<TelegramClient>,
        dispatch: Option<DispatchClient>,
    ) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let state = MonitorState::load(&state_path);
        Self {
            config_path,
            state_path,
            http: build_http_client(),
            telegram,
            dispatch,
            browser: None,
            state,
            dispatch_tx,
            dispatch_rx,
        }
    }

    /// Run cycles forever (or once). The next cycle starts at
    /// `cycle_start + interval`, skipping past missed ticks.
    pub async fn run(&mut self, once: bool) -> Result<(), MonitorError> {
        loop {
            let cycle_start = Instant::now();
            let config = match load_config(&self.config_path) {
                Ok(config) => config,
                Err(e) => {
                    warn!(error = %e, "config load failed, skipping cycle");
                    if once {
                        return Err(e);
                    }
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    continue;
                }
            };

            self.run_cycle(&config).await;

            if once {
                return Ok(());
            }

            let interval = Duration::from_secs(config.interval_seconds.max(1));
            let mut next = cycle_start + interval;
            let now = Instant::now();
            while next <= now {
                next += interval;
            }
            tokio::time::sleep_until(next).await;
        }
    }

    async fn ensure_browser(&mut self) -> bool {
        let healthy = self.browser.as_ref().is_some_and(BrowserSession::healthy);
        if healthy {
            return true;
        }
        if let Some(dead) = self.browser.take() {
            dead.close().await;
        }
        match BrowserSession::launch(&BrowserOptions::default()).await {
            Ok(session) => {
                self.browser = Some(session);
                true
            }
            Err(e) => {
                warn!(error = %e, "browser launch failed; browser checks degraded this cycle");
                false
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn run_cycle(&mut self, config: &MonitorConfig) {
        let now = now_ts();
        info!("cycle start");

        // Conclusions from dispatch tasks spawned in earlier cycles.
        while let Ok(record) = self.dispatch_rx.try_recv() {
            self.state
                .push_event(record.ts, "dispatch", format!("{}: {}", record.state_key, record.title));
            self.state.push_dispatch(record);
        }

        let entries = config.enabled_domains(now);
        let browser_up = self.ensure_browser().await;
        let browser_sem = Arc::new(Semaphore::new(config.browser.concurrency.max(1)));

        // ---- Domain probes -------------------------------------------------
        let outcomes: Vec<DomainOutcome> = futures::future::join_all(entries.iter().map(|entry| {
            let http = self.http.clone();
            let browser = self.browser.as_ref().filter(|_| browser_up);
            let sem = Arc::clone(&browser_sem);
            async move { probe_domain(&http, browser, sem, entry).await }
        }))
        .await;

        let browser_infra_count = outcomes.iter().filter(|o| o.browser_infra).count();
        let browser_unavailable_count = outcomes.iter().filter(|o| o.browser_unavailable).count();
        let http_by_domain: BTreeMap<String, HttpCheckOutcome> = BTreeMap::new();

        // ---- Cross-cutting signal checks ----------------------------------
        let tls_results = futures::future::join_all(entries.iter().map(|entry| {
            check_tls_cert(
                &entry.spec.domain,
                &entry.spec.url,
                config.tls.min_days_valid,
                config.tls.timeout_seconds,
                now,
            )
        }))
        .await
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();

        let dns_config = DnsCheckConfig {
            resolvers: config.dns.resolvers.clone(),
            timeout_seconds: config.dns.timeout_seconds,
            require_ipv4: config.dns.require_ipv4,
            require_ipv6: config.dns.require_ipv6,
        };
        let empty: Vec<String> = Vec::new();
        let dns_results = futures::future::join_all(entries.iter().map(|entry| {
            let domain = entry.spec.domain.clone();
            let previous = self.state.dns_last_ips.get(&domain).unwrap_or(&empty);
            let expected = config
                .dns
                .expected_ips_by_domain
                .get(&domain)
                .unwrap_or(&empty);
            let alert_on_drift = config
                .dns
                .alert_on_drift_by_domain
                .get(&domain)
                .copied()
                .unwrap_or(false);
            let cfg = &dns_config;
            async move { check_dns(cfg, &domain, previous, expected, alert_on_drift).await }
        }))
        .await;

        let container_results = if config.container_monitoring.enabled {
            let docker = DockerClient::new(
                config.container_monitoring.socket_path.clone(),
                Duration::from_secs(3),
            );
            let cfg = ContainerHealthConfig {
                include_name_patterns: config.container_monitoring.include_name_patterns.clone(),
                exclude_name_patterns: config.container_monitoring.exclude_name_patterns.clone(),
                monitor_all: config.container_monitoring.monitor_all,
            };
            Some(check_container_health(&docker, &cfg, &self.state.container_restart_counts).await)
        } else {
            None
        };

        let host_snapshot = snapshot_host(&config.host.disk_paths, self.state.cpu_prev_totals);

        // Log parsing is blocking file I/O on a tail window; cheap enough
        // to run inline on the cycle task.
        let nginx_access = config.nginx.access_log_path.as_deref().and_then(|path| {
            vigil_probe::nginx::access_window_stats(
                std::path::Path::new(path),
                chrono::Utc::now(),
                config.nginx.window_seconds,
                1_000_000,
            )
        });
        let nginx_upstream = config
            .nginx
            .error_log_path
            .as_deref()
            .map(|path| {
                vigil_probe::nginx::recent_upstream_errors(
                    std::path::Path::new(path),
                    chrono::Utc::now(),
                    config.nginx.window_seconds,
                    1_000_000,
                    200,
                )
            })
            .unwrap_or_default();
        let nginx_upstream_summary =
            vigil_probe::nginx::summarize_upstream_errors(&nginx_upstream);

        let api_jobs: Vec<(String, String, vigil_core::check::ApiContractCheck)> = entries
            .iter()
            .flat_map(|entry| {
                entry
                    .spec
                    .api_contract_checks
                    .iter()
                    .map(|check| (entry.spec.domain.clone(), entry.spec.url.clone(), check.clone()))
            })
            .collect();
        let api_results = futures::future::join_all(api_jobs.iter().map(|(domain, base_url, check)| {
            let http = self.http.clone();
            async move {
                vigil_probe::api_contract::run_api_contract_check(&http, domain, base_url, check, 10.0)
                    .await
            }
        }))
        .await;

        let mut synthetic_results = Vec::new();
        let mut vitals_results = Vec::new();
        if browser_up {
            if let Some(session) = &self.browser {
                for entry in &entries {
                    for tx in &entry.spec.synthetic_transactions {
                        let _permit = browser_sem.acquire().await.ok();
                        synthetic_results.push(
                            run_synthetic_transaction(
                                session,
                                &entry.spec.domain,
                                &entry.spec.url,
                                tx,
                                Duration::from_secs_f64(entry.spec.browser_timeout_seconds.max(30.0)),
                            )
                            .await,
                        );
                    }
                }
                if config.web_vitals.enabled {
                    for entry in &entries {
                        if !config.web_vitals.domains.is_empty()
                            && !config.web_vitals.domains.contains(&entry.spec.domain)
                        {
                            continue;
                        }
                        let _permit = browser_sem.acquire().await.ok();
                        vitals_results.push(
                            measure_web_vitals(
                                session,
                                &entry.spec.domain,
                                &entry.spec.url,
                                Duration::from_secs_f64(config.web_vitals.timeout_seconds),
                                Duration::from_millis(config.web_vitals.post_load_wait_ms),
                            )
                            .await,
                        );
                    }
                }
            }
        }

        // ---- Domain debounce + history ------------------------------------
        let debounce = config.alerting.debounce;
        let mut down_alerts: Vec<(String, String, serde_json::Value, u32)> = Vec::new();
        let mut up_alerts: Vec<(String, u32)> = Vec::new();
        let mut perf_inputs: BTreeMap<String, (Option<f64>, Option<f64>)> = BTreeMap::new();
        let mut http_outcomes = http_by_domain;

        for outcome in &outcomes {
            let domain = outcome.domain.clone();
            perf_inputs.insert(
                domain.clone(),
                (outcome.http_elapsed_ms, outcome.browser_elapsed_ms),
            );
            if let Ok(http) = serde_json::from_value::<HttpCheckOutcome>(
                outcome.details.get("http").cloned().unwrap_or_default(),
            ) {
                http_outcomes.insert(domain.clone(), http);
            }

            let prev_effective = self.state.last_ok.get(&domain).copied().unwrap_or(true);
            let mut streaks = StreakState {
                fail_streak: self.state.fail_streak.get(&domain).copied().unwrap_or(0),
                success_streak: self.state.success_streak.get(&domain).copied().unwrap_or(0),
            };

            // Only a browser infra error (the check ran and the driver
            // failed) is neutral. An unavailable browser still applies the
            // HTTP-only observation, so outages and recoveries keep
            // flowing while the session is down.
            let transition = if outcome.browser_infra {
                None
            } else {
                Some(apply_observation(
                    prev_effective,
                    outcome.observed_ok,
                    &mut streaks,
                    debounce,
                ))
            };

            let effective = transition.map_or(prev_effective, |t| t.effective_ok);
            self.state.last_ok.insert(domain.clone(), effective);
            self.state.fail_streak.insert(domain.clone(), streaks.fail_streak);
            self.state
                .success_streak
                .insert(domain.clone(), streaks.success_streak);

            // Samples record the effective (debounced) state.
            self.state.history.append(
                &domain,
                vigil_core::sample::Sample::new(now, effective)
                    .with_latencies(outcome.http_elapsed_ms, outcome.browser_elapsed_ms)
                    .with_status_code(outcome.status_code),
            );

            if let Some(t) = transition {
                if t.alerted_down {
                    down_alerts.push((
                        domain.clone(),
                        outcome.reason.clone(),
                        outcome.details.clone(),
                        streaks.fail_streak,
                    ));
                }
                if t.recovered_up {
                    up_alerts.push((domain.clone(), streaks.success_streak));
                }
            }
        }

        let retention_secs = config.history.retention_days.max(0.01) * 86_400.0;
        self.state.history.prune(now - retention_secs);

        // ---- Signal folding ----------------------------------------------
        let red_caps = RedThresholds {
            window_minutes: config.red.window_minutes,
            min_samples: config.red.min_samples,
            error_rate_max_percent: config.red.error_rate_max_percent,
            http_p95_ms_max: config.red.http_p95_ms_max,
            browser_p95_ms_max: config.red.browser_p95_ms_max,
        };
        let red = vigil_core::analytics::red_violations(&self.state.history, now, &red_caps);
        let slo = vigil_core::analytics::slo_burn_violations(
            &self.state.history,
            now,
            config.slo.target_percent,
            &config.slo.burn_rate_rules,
        );

        let proxy_specs: Vec<_> = entries
            .iter()
            .filter_map(|e| e.spec.proxy.clone().map(|p| (e.spec.domain.clone(), p)))
            .collect();

        let mut observations: Vec<SignalObservation> = vec![
            fold_tls(&tls_results),
            fold_dns(&dns_results),
            fold_host(&host_snapshot, &config.host),
            fold_performance(&perf_inputs, &config.performance),
            fold_web_vitals(&vitals_results, &config.web_vitals),
            fold_slo(&slo),
            fold_red(&red),
            fold_proxy(&proxy_specs, &http_outcomes),
            fold_nginx(
                nginx_access.as_ref(),
                &nginx_upstream_summary,
                config.nginx.max_502_504,
            ),
            fold_synthetics(&synthetic_results),
        ];

        // Browser infrastructure: infra errors, a failed launch, or
        // HTTP-only cycles degrade the browser signal.
        observations.push(SignalObservation {
            kind: SignalKind::Browser,
            ok: browser_up && browser_infra_count == 0 && browser_unavailable_count == 0,
            summary: if browser_up {
                format!("{browser_infra_count} browser infra errors this cycle")
            } else {
                format!(
                    "browser launch failed; {browser_unavailable_count} domains checked over HTTP only"
                )
            },
            details: serde_json::Value::Null,
        });

        if let Some((issues, restart_counts)) = container_results {
            observations.push(fold_containers(&issues));
            self.state.container_restart_counts = restart_counts;
        }

        let failing_api: Vec<String> = api_results
            .iter()
            .filter(|r| !r.ok)
            .map(|r| format!("{} [{}]: {}", r.domain, r.name, r.error.as_deref().unwrap_or("failed")))
            .collect();
        observations.push(SignalObservation {
            kind: SignalKind::Meta,
            ok: self.state.state_write_fail_streak < STATE_WRITE_FAIL_THRESHOLD,
            summary: format!(
                "state_write_fail_streak={}",
                self.state.state_write_fail_streak
            ),
            details: serde_json::Value::Null,
        });
        if !failing_api.is_empty() {
            observations.push(SignalObservation {
                kind: SignalKind::Performance,
                ok: false,
                summary: failing_api.join("\n"),
                details: serde_json::Value::Null,
            });
        }

        // Merge multiple observations of the same kind: any failure wins.
        let mut merged: BTreeMap<SignalKind, SignalObservation> = BTreeMap::new();
        for obs in observations {
            match merged.get_mut(&obs.kind) {
                None => {
                    merged.insert(obs.kind, obs);
                }
                Some(existing) => {
                    if !obs.ok {
                        existing.ok = false;
                        if !existing.summary.is_empty() && !obs.summary.is_empty() {
                            existing.summary.push('\n');
                        }
                        existing.summary.push_str(&obs.summary);
                    }
                    if existing.details.is_null() && !obs.details.is_null() {
                        existing.details = obs.details;
                    }
                }
            }
        }

        // ---- Signal debounce + alerts -------------------------------------
        for (kind, obs) in merged {
            let signal = self.state.signal_mut(kind);
            let prev = signal.last_ok;
            let mut streaks = signal.streaks;
            let transition = apply_observation(prev, obs.ok, &mut streaks, debounce);
            signal.streaks = streaks;
            signal.last_ok = transition.effective_ok;
            signal.last_run_ts = Some(now);
            if !obs.details.is_null() {
                signal.data = obs.details.clone();
            }

            if transition.alerted_down {
                let msg = alerts::signal_down_message(&obs, now);
                self.state.push_event(now, "signal_down", kind.to_string());
                self.send_alert(&msg).await;
            } else if transition.recovered_up && config.alerting.notify_on_recovery {
                let msg = alerts::signal_up_message(kind, now);
                self.state.push_event(now, "signal_up", kind.to_string());
                self.send_alert(&msg).await;
            }
        }

        // Remember auxiliary signal data for the next cycle.
        for result in &dns_results {
            let mut ips = result.a_records.clone();
            ips.extend(result.aaaa_records.iter().cloned());
            if !ips.is_empty() {
                self.state.dns_last_ips.insert(result.domain.clone(), ips);
            }
        }
        self.state.cpu_prev_totals = host_snapshot.cpu_totals;
        self.state.host_snapshot = Some(host_snapshot);

        // ---- Domain alerts + escalation -----------------------------------
        for (domain, success_streak) in up_alerts {
            if config.alerting.notify_on_recovery {
                let msg = alerts::domain_up_message(
                    &domain,
                    success_streak,
                    debounce.up_after_successes,
                );
                self.state.push_event(now, "recovered", domain.clone());
                self.send_alert(&msg).await;
            }
        }

        for (domain, reason, details, fail_streak) in down_alerts {
            let msg = alerts::domain_down_message(
                &domain,
                &reason,
                fail_streak,
                debounce.down_after_failures,
                &details,
            );
            self.state.push_event(now, "alert", domain.clone());
            self.send_alert(&msg).await;

            if config.dispatch.enabled {
                if let Some(entry) = entries.iter().find(|e| e.spec.domain == domain) {
                    self.spawn_dispatch(&domain, &entry.spec.url, &reason, details);
                }
            }
        }

        // ---- Persist -------------------------------------------------------
        match self.state.save_atomic(&self.state_path) {
            Ok(()) => {
                self.state.state_write_fail_streak = 0;
            }
            Err(e) => {
                self.state.state_write_fail_streak += 1;
                warn!(
                    error = %e,
                    streak = self.state.state_write_fail_streak,
                    "state write failed"
                );
                if self.state.state_write_fail_streak == STATE_WRITE_FAIL_THRESHOLD {
                    self.send_alert(&format!(
                        "Monitor state writes failing ({} in a row): {e}",
                        self.state.state_write_fail_streak
                    ))
                    .await;
                }
            }
        }

        info!(
            domains = entries.len(),
            browser_up, "cycle complete"
        );
    }

    async fn send_alert(&self, message: &str) {
        if let Some(telegram) = &self.telegram {
            if let Err(e) = telegram.send_chunked(message).await {
                warn!(error = %e, "telegram alert failed");
            }
        } else {
            warn!(message, "telegram not configured, dropping alert");
        }
    }

    /// Escalate a confirmed DOWN to the dispatcher without blocking the
    /// cycle; the conclusion comes back over the channel and is recorded
    /// at the top of a later cycle.
    fn spawn_dispatch(
        &self,
        domain: &str,
        url: &str,
        reason: &str,
        details: serde_json::Value,
    ) {
        let Some(client) = self.dispatch.clone() else {
            return;
        };
        let telegram = self.telegram.clone();
        let tx = self.dispatch_tx.clone();
        let state_key = alerts::domain_state_key(domain);
        let title = format!("{domain} DOWN investigation");
        let prompt = alerts::dispatch_prompt_for_domain(domain, url, reason, &details);
        let domain = domain.to_owned();

        tokio::spawn(async move {
            let record = run_dispatch(&client, &state_key, &title, &prompt).await;

            if let Some(telegram) = &telegram {
                let followup = match (&record.agent_message, &record.error_message) {
                    (Some(msg), _) => format!(
                        "Dispatcher triage for {domain} completed:\n{}\n\n{msg}",
                        record.ui_url.as_deref().unwrap_or("")
                    ),
                    (None, Some(err)) => format!(
                        "Dispatcher triage for {domain} failed state={}\n{}\nError: {err}",
                        record.queue_state.as_deref().unwrap_or("unknown"),
                        record.ui_url.as_deref().unwrap_or("")
                    ),
                    (None, None) => format!(
                        "Dispatcher triage for {domain} finished state={} with no agent message",
                        record.queue_state.as_deref().unwrap_or("unknown")
                    ),
                };
                if let Err(e) = telegram.send_chunked(&followup).await {
                    warn!(error = %e, "dispatch follow-up alert failed");
                }
            }

            let _ = tx.send(record);
        });
    }
}

async fn run_dispatch(
    client: &DispatchClient,
    state_key: &str,
    title: &str,
    prompt: &str,
) -> DispatchRecord {
    let ts = now_ts();
    let config_toml = alerts::dispatch_config_toml();

    let job = match client
        .dispatch(prompt, &config_toml, Some(state_key), None)
        .await
    {
        Ok(job) => job,
        Err(e) => {
            return DispatchRecord {
                ts,
                state_key: state_key.to_owned(),
                title: title.to_owned(),
                bundle: None,
                queue_state: None,
                ui_url: None,
                ok: false,
                agent_message: None,
                error_message: Some(e.to_string()),
            };
        }
    };

    let ui_url = vigil_dispatch::run_ui_url(&client.config().base_url, &job.bundle);
    let (queue_state, ok, error_message) = match client.wait_for_terminal_status(&job.bundle).await
    {
        Ok(status) => {
            let state = status.queue_state.clone();
            let ok = state.as_deref() == Some("processed");
            (state, ok, None)
        }
        Err(e) => (None, false, Some(e.to_string())),
    };

    let agent_message = client.last_agent_message(&job.bundle).await.ok().flatten();
    let error_message = if agent_message.is_none() && error_message.is_none() && !ok {
        client
            .log_tail(&job.bundle, client.config().log_tail_bytes)
            .await
            .ok()
            .and_then(|tail| vigil_dispatch::extract_last_error_message(&tail))
    } else {
        error_message
    };

    DispatchRecord {
        ts,
        state_key: state_key.to_owned(),
        title: title.to_owned(),
        bundle: Some(job.bundle),
        queue_state,
        ui_url: Some(ui_url),
        ok,
        agent_message,
        error_message,
    }
}

/// Probe one domain: HTTP first; browser only when HTTP passed and the
/// session is up. A browser infra error never counts against the domain;
/// an unavailable browser leaves the HTTP verdict in force.
async fn probe_domain(
    http: &reqwest::Client,
    browser: Option<&BrowserSession>,
    browser_sem: Arc<Semaphore>,
    entry: &DomainEntry,
) -> DomainOutcome {
    let spec = &entry.spec;
    let http_outcome = http_get_check(http, spec).await;
    let http_details = serde_json::to_value(&http_outcome).unwrap_or_default();

    if !http_outcome.ok {
        let reason = http_outcome
            .error
            .as_deref()
            .map_or("http_check_failed", |e| {
                e.split(':').next().unwrap_or("http_check_failed")
            })
            .to_owned();
        return DomainOutcome {
            domain: spec.domain.clone(),
            observed_ok: false,
            reason,
            http_elapsed_ms: Some(http_outcome.elapsed_ms),
            browser_elapsed_ms: None,
            status_code: http_outcome.status_code,
            details: serde_json::json!({ "http": http_details }),
            browser_infra: false,
            browser_unavailable: browser.is_none(),
        };
    }

    let Some(session) = browser else {
        // Browser unavailable: the HTTP-only verdict still drives the
        // domain's debounce so real outages and recoveries keep alerting;
        // only the browser signal is degraded.
        return DomainOutcome {
            domain: spec.domain.clone(),
            observed_ok: true,
            reason: "ok".to_owned(),
            http_elapsed_ms: Some(http_outcome.elapsed_ms),
            browser_elapsed_ms: None,
            status_code: http_outcome.status_code,
            details: serde_json::json!({ "http": http_details }),
            browser_infra: false,
            browser_unavailable: true,
        };
    };

    let _permit = browser_sem.acquire().await.ok();
    let browser_outcome = browser_check(session, spec).await;
    let browser_details = serde_json::to_value(&browser_outcome).unwrap_or_default();

    let browser_infra = browser_outcome.browser_infra_error;
    let observed_ok = if browser_infra {
        true
    } else {
        browser_outcome.ok
    };
    let reason = if browser_infra {
        "browser_degraded".to_owned()
    } else if browser_outcome.ok {
        "ok".to_owned()
    } else {
        browser_outcome.reason.clone()
    };

    DomainOutcome {
        domain: spec.domain.clone(),
        observed_ok,
        reason,
        http_elapsed_ms: Some(http_outcome.elapsed_ms),
        browser_elapsed_ms: Some(browser_outcome.elapsed_ms),
        status_code: http_outcome.status_code,
        details: serde_json::json!({ "http": http_details, "browser": browser_details }),
        browser_infra,
        browser_unavailable: false,
    }
}
