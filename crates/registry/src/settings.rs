//! Registry settings, sourced from the environment.

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_owned())
}

fn env_opt(name: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_owned())
        .unwrap_or_default()
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

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_csv(name: &str) -> Vec<String> {
    std::env::var(name)
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// All registry configuration. Cheap to clone; built once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: String,
    pub artifacts_dir: String,
    pub tests_dir: String,

    /// Admin endpoints only (create tenants / api keys).
    pub admin_token: String,
    /// Read-only status endpoints (monitoring heartbeats).
    pub monitor_token: String,
    /// Runner claim/complete endpoints.
    pub runner_token: String,

    pub alerts_enabled: bool,
    pub telegram_bot_token: String,
    pub telegram_chat_id: String,

    pub dispatch_enabled: bool,
    pub dispatch_base_url: String,
    pub dispatch_token: String,
    pub dispatch_model: String,

    /// Used to build stable links in alert messages.
    pub public_base_url: String,

    pub runner_lock_timeout_seconds: u64,

    pub max_upload_bytes: u64,
    pub strict_base_url_policy: bool,
    pub base_url_allowed_hosts: Vec<String>,
    pub base_url_allow_monitored_domains: bool,

    pub monitor_state_path: String,
    pub monitor_config_path: String,
    pub dashboard_require_auth: bool,
    pub dashboard_max_points: usize,
}

impl Settings {
    /// Load from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let public_base_url = env_opt("E2E_REGISTRY_PUBLIC_BASE_URL");
        // Strict mode defaults on for the production deployment, which is
        // recognizable by its public hostname.
        let strict_default = public_base_url
            .to_lowercase()
            .contains("monitoring.pitchai.net");
        Self {
            db_path: env_str("E2E_REGISTRY_DB_PATH", "/data/e2e-registry.db"),
            artifacts_dir: env_str("E2E_ARTIFACTS_DIR", "/data/e2e-artifacts"),
            tests_dir: env_str("E2E_TESTS_DIR", "/data/e2e-tests"),
            admin_token: env_opt("E2E_REGISTRY_ADMIN_TOKEN"),
            monitor_token: env_opt("E2E_REGISTRY_MONITOR_TOKEN"),
            runner_token: env_opt("E2E_REGISTRY_RUNNER_TOKEN"),
            alerts_enabled: env_bool("E2E_REGISTRY_ALERTS_ENABLED", true),
            telegram_bot_token: {
                let specific = env_opt("E2E_TELEGRAM_BOT_TOKEN");
                if specific.is_empty() {
                    env_opt("TELEGRAM_BOT_TOKEN")
                } else {
                    specific
                }
            },
            telegram_chat_id: {
                let specific = env_opt("E2E_TELEGRAM_CHAT_ID");
                if specific.is_empty() {
                    env_opt("TELEGRAM_CHAT_ID")
                } else {
                    specific
                }
            },
            dispatch_enabled: env_bool("E2E_REGISTRY_DISPATCH_ENABLED", false),
            dispatch_base_url: env_str("PITCHAI_DISPATCH_BASE_URL", "https://dispatch.pitchai.net"),
            dispatch_token: env_opt("PITCHAI_DISPATCH_TOKEN"),
            dispatch_model: env_opt("PITCHAI_DISPATCH_MODEL"),
            public_base_url,
            runner_lock_timeout_seconds: env_u64("E2E_REGISTRY_RUNNER_LOCK_TIMEOUT_SECONDS", 600),
            max_upload_bytes: env_u64("E2E_REGISTRY_MAX_UPLOAD_BYTES", 512_000),
            strict_base_url_policy: env_bool("E2E_REGISTRY_STRICT_BASE_URL_POLICY", strict_default),
            base_url_allowed_hosts: env_csv("E2E_REGISTRY_ALLOWED_BASE_URL_HOSTS"),
            base_url_allow_monitored_domains: env_bool("E2E_REGISTRY_ALLOW_MONITORED_DOMAINS", true),
            monitor_state_path: env_str("SERVICE_MONITOR_STATE_PATH", "/monitor_state/state.json"),
            monitor_config_path: env_str("SERVICE_MONITOR_CONFIG_PATH", "/app/config.yaml"),
            dashboard_require_auth: env_bool("MONITOR_DASHBOARD_REQUIRE_AUTH", true),
            dashboard_max_points: usize::try_from(env_u64("MONITOR_DASHBOARD_MAX_POINTS", 1_500))
                .unwrap_or(1_500),
        }
    }

    /// Build a public link for alert messages; relative when no public
    /// base is configured.
    #[must_use]
    pub fn public_url(&self, path: &str) -> String {
        let base = self.public_base_url.trim_end_matches('/');
        if base.is_empty() {
            return path.to_owned();
        }
        let path = if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("/{path}")
        };
        format!("{base}{path}")
    }
}
