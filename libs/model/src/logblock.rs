//! Stage log models

use serde::{Deserialize, Serialize};

/// Severity of a stage log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogSeverity {
    Info,
    Success,
    Error,
}

/// A single line of a stage transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogBlock {
    /// Monotonic within one stage
    pub index: u64,
    pub log: String,
    pub severity: LogSeverity,
    /// Unix seconds
    pub created_at: i64,
}

impl LogBlock {
    pub fn new(index: u64, log: impl Into<String>, severity: LogSeverity) -> Self {
        Self {
            index,
            log: log.into(),
            severity,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}
