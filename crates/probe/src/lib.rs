pub mod api_contract;
pub mod browser;
pub mod containers;
pub mod dns;
pub mod docker;
pub mod error;
pub mod host;
pub mod http;
pub mod infra;
pub mod nginx;
pub mod steps;
pub mod synthetic;
pub mod tls;
pub mod web_vitals;

pub use api_contract::{ApiContractOutcome, run_api_contract_check};
pub use browser::{BrowserCheckOutcome, BrowserOptions, BrowserSession, browser_check};
pub use containers::{ContainerHealthConfig, ContainerIssue, check_container_health};
pub use dns::{DnsCheckConfig, DnsCheckResult, check_dns};
pub use docker::DockerClient;
pub use error::ProbeError;
pub use host::{HostSnapshot, snapshot_host};
pub use http::{HttpCheckOutcome, build_http_client, http_get_check};
pub use infra::is_browser_infra_error;
pub use nginx::{AccessWindowStats, UpstreamErrorEvent, access_window_stats, recent_upstream_errors};
pub use steps::{StepContext, StepError, execute_step, execute_steps, expand_placeholders};
pub use synthetic::{SyntheticOutcome, run_synthetic_transaction};
pub use tls::{TlsCheckResult, check_tls_cert};
pub use web_vitals::{WebVitals, WebVitalsOutcome, measure_web_vitals};
