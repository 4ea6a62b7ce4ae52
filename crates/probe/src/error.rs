use thiserror::Error;

/// Errors surfaced by the probe layer.
///
/// Probe-level failures are normally captured inside the per-check outcome
/// structs; this type covers infrastructure faults (browser/driver, socket,
/// filesystem) that the caller may want to classify.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("browser error: {0}")]
    Browser(String),

    #[error("browser launch failed: {0}")]
    BrowserLaunch(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dns error: {0}")]
    Dns(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("docker error: {0}")]
    Docker(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<chromiumoxide::error::CdpError> for ProbeError {
    fn from(e: chromiumoxide::error::CdpError) -> Self {
        ProbeError::Browser(e.to_string())
    }
}

impl ProbeError {
    /// Whether this error should be treated as browser infrastructure
    /// degradation rather than a verdict about the target.
    #[must_use]
    pub fn is_browser_infra(&self) -> bool {
        match self {
            ProbeError::BrowserLaunch(_) => true,
            ProbeError::Browser(msg) => crate::infra::is_browser_infra_error(msg),
            _ => false,
        }
    }
}
