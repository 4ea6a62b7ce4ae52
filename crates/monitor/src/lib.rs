pub mod alerts;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod signals;
pub mod state;

pub use config::{DomainEntry, MonitorConfig, load_config};
pub use error::MonitorError;
pub use scheduler::Monitor;
pub use state::{DispatchRecord, EventLogEntry, MonitorState, STATE_VERSION};
