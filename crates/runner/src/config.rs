//! Runner configuration from the environment.

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_owned())
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => true,
            "0" | "false" | "no" | "n" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub registry_base_url: String,
    pub runner_token: String,
    pub artifacts_dir: String,
    pub tests_dir: String,
    pub poll_seconds: f64,
    pub concurrency: i64,
    pub trace_on_failure: bool,
    /// Interpreter for `playwright_python` sources.
    pub python_bin: String,
    /// Interpreter for `puppeteer_js` sources.
    pub node_bin: String,
}

impl RunnerConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let poll = std::env::var("E2E_RUNNER_POLL_SECONDS")
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .unwrap_or(5.0);
        let concurrency = std::env::var("E2E_RUNNER_CONCURRENCY")
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .unwrap_or(1);
        Self {
            registry_base_url: env_str("E2E_REGISTRY_BASE_URL", "http://127.0.0.1:8111"),
            runner_token: env_str("E2E_REGISTRY_RUNNER_TOKEN", ""),
            artifacts_dir: env_str("E2E_ARTIFACTS_DIR", "/data/e2e-artifacts"),
            tests_dir: env_str("E2E_TESTS_DIR", "/data/e2e-tests"),
            poll_seconds: poll.max(0.5),
            concurrency: concurrency.clamp(1, 10),
            trace_on_failure: env_bool("E2E_RUNNER_TRACE_ON_FAILURE", false),
            python_bin: env_str("E2E_SANDBOX_PYTHON", "python3"),
            node_bin: env_str("E2E_SANDBOX_NODE", "node"),
        }
    }
}
