//! Session and logging configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Options recognized when a session engine is started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Session id, used for logging and grouping.
    pub id: String,

    /// Opaque tracing context propagated from the caller. The engine stores
    /// it and attaches it to its root span; it does not interpret it.
    pub trace_ctx: Option<Value>,

    /// Extra key-value labels attached to engine telemetry.
    pub telemetry_label: Vec<(String, String)>,

    /// Selects the filter tee variant for non-simulcast tracks, letting an
    /// external display-manager policy throttle individual receivers.
    pub display_manager: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            trace_ctx: None,
            telemetry_label: Vec::new(),
            display_manager: false,
        }
    }
}

impl SessionOptions {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

/// Logging configuration consumed by [`crate::logging::init_logging`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter: trace, debug, info, warn, error.
    pub level: String,

    /// Output format: "json" for production, anything else for pretty.
    pub format: String,

    /// Optional log file; stdout when absent.
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}
