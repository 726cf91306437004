//! Connector error types.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Connector errors.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// TCP connection could not be established.
    #[error("connect to '{address}' failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    /// TLS handshake failed.
    #[error("TLS handshake with '{address}' failed: {source}")]
    Handshake {
        address: String,
        #[source]
        source: io::Error,
    },

    /// I/O error on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Operation did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// TLS material could not be loaded.
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// Endpoint address is unusable.
    #[error("invalid endpoint address '{0}'")]
    InvalidAddress(String),

    /// Item exceeds the size limit.
    #[error("item of {size} bytes exceeds limit of {max} bytes")]
    ItemTooLarge { size: usize, max: usize },

    /// Item could not be encoded.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Endpoint key filter is not a valid regex.
    #[error("invalid key filter: {0}")]
    KeyFilter(#[from] regex::Error),
}

impl ConnectorError {
    /// Whether the operation may succeed when retried.
    ///
    /// Network failures are retryable; payload and configuration errors
    /// are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Handshake { .. } | Self::Io(_) | Self::Timeout(_)
        )
    }
}
