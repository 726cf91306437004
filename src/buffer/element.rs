//! Buffered telemetry item.

use serde::{Deserialize, Serialize};

use crate::active::FetchedValue;

/// One produced telemetry item.
///
/// Immutable once appended; consumers take ownership when draining.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferElement {
    /// Host the value belongs to.
    pub host: String,
    /// Canonical metric key.
    pub key: String,
    /// Produced value.
    pub value: String,
    /// Timestamp reported by the source, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Origin label (event log source).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Severity ordinal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<u32>,
    /// Log offset following this value.
    #[serde(default)]
    pub last_log_size: u64,
    /// Production time, epoch seconds.
    pub clock: i64,
    /// Source-specific sequence number, zero when not applicable.
    #[serde(default)]
    pub log_event_id: u64,
}

impl BufferElement {
    /// Create a plain value element.
    pub fn new(
        host: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
        clock: i64,
    ) -> Self {
        Self {
            host: host.into(),
            key: key.into(),
            value: value.into(),
            timestamp: None,
            source: None,
            severity: None,
            last_log_size: 0,
            clock,
            log_event_id: 0,
        }
    }

    /// Build an element from a fetched value.
    pub fn from_fetched(host: &str, key: &str, fetched: FetchedValue, clock: i64) -> Self {
        Self {
            host: host.to_string(),
            key: key.to_string(),
            value: fetched.value,
            timestamp: fetched.timestamp,
            source: fetched.source,
            severity: fetched.severity,
            last_log_size: fetched.last_log_size.unwrap_or(0),
            clock,
            log_event_id: fetched.log_event_id,
        }
    }
}
