use thiserror::Error;

/// Errors that can stop the monitor from starting or persisting.
///
/// Per-probe failures never surface here; they are captured in cycle
/// outcomes so one domain can never unwind the loop.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
