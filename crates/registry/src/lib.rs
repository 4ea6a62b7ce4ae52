pub mod alerts;
pub mod api;
pub mod auth;
pub mod dashboard;
pub mod error;
pub mod settings;
pub mod stepflow;
pub mod store;
pub mod ui;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

pub use error::RegistryError;
pub use settings::Settings;
pub use store::Store;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub settings: Arc<Settings>,
    pub templates: Arc<minijinja::Environment<'static>>,
    pub http: reqwest::Client,
    /// Monitored-domain allowlist, loaded once from the monitor config.
    pub monitored_domains: Arc<Vec<String>>,
}

impl AppState {
    #[must_use]
    pub fn new(store: Store, settings: Settings) -> Self {
        let monitored_domains = stepflow::monitored_domains(&settings.monitor_config_path);
        Self {
            store,
            settings: Arc::new(settings),
            templates: Arc::new(ui::build_templates()),
            http: reqwest::Client::new(),
            monitored_domains: Arc::new(monitored_domains),
        }
    }
}

/// Build the Axum router with the REST API, the tenant UI and the monitor
/// dashboard.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        // Admin
        .route("/api/v1/admin/tenants", post(api::create_tenant))
        .route("/api/v1/admin/api_keys", post(api::create_api_key))
        // Tenant-scoped tests
        .route("/api/v1/tests", post(api::create_test).get(api::list_tests))
        .route("/api/v1/tests/upload", post(api::upload_test))
        .route("/api/v1/tests/{test_id}", get(api::get_test).patch(api::patch_test))
        .route("/api/v1/tests/{test_id}/disable", post(api::disable_test))
        .route("/api/v1/tests/{test_id}/enable", post(api::enable_test))
        .route("/api/v1/tests/{test_id}/run", post(api::run_now))
        .route("/api/v1/tests/{test_id}/runs", get(api::list_runs))
        .route("/api/v1/runs/{run_id}", get(api::get_run))
        .route("/api/v1/runs/{run_id}/artifacts/{name}", get(api::download_artifact))
        // Status
        .route("/api/v1/status/summary", get(api::status_summary))
        // Runner protocol
        .route("/api/v1/runner/claim", post(api::runner_claim))
        .route("/api/v1/runner/runs/{run_id}/complete", post(api::runner_complete))
        // Tenant UI
        .route("/ui/login", get(ui::login_page).post(ui::login_submit))
        .route("/ui/logout", get(ui::logout))
        .route("/ui/tests", get(ui::tests_page))
        .route("/ui/tests/{test_id}", get(ui::test_detail))
        .route("/ui/tests/{test_id}/run", post(ui::run_now))
        .route("/ui/tests/{test_id}/disable", post(ui::disable_test))
        .route("/ui/tests/{test_id}/enable", post(ui::enable_test))
        .route("/ui/upload", get(ui::upload_page).post(ui::upload_submit))
        .route("/ui/runs/{run_id}", get(ui::run_detail))
        // Monitor dashboard
        .route("/dashboard", get(dashboard::page))
        .route("/dashboard/login", get(dashboard::login_page).post(dashboard::login_submit))
        .route("/dashboard/api/state", get(dashboard::state_json))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
