//! Server transport capability and the built-in JSON line implementation.

use std::io;
use std::net::IpAddr;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::buffer::BufferElement;

/// Request type sent with every batch.
const AGENT_DATA_REQUEST: &str = "agent data";
/// Response value of an accepted batch.
const RESPONSE_SUCCESS: &str = "success";

/// Transmission errors.
#[derive(Debug, Error)]
pub enum SendError {
    /// Connection could not be established.
    #[error("connect to '{address}' failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    /// I/O error on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Send did not complete in time.
    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    /// Response could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server refused the batch.
    #[error("rejected by server: {0}")]
    Rejected(String),

    /// Batch could not be encoded.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// No server address is configured.
    #[error("no server address available")]
    NoAddress,
}

impl SendError {
    /// Whether retrying the same batch cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::Serialize(_))
    }
}

/// Redirect instruction returned by a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    /// New server address; absent when the server only revokes a redirect.
    #[serde(default)]
    pub address: Option<String>,
    /// Redirect revision; older revisions are ignored.
    #[serde(default)]
    pub revision: u64,
    /// Drop the current redirect and return to the configured addresses.
    #[serde(default)]
    pub reset: bool,
}

/// Server acknowledgement of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendAck {
    /// Number of leading items accepted.
    pub accepted: usize,
    /// Redirect to follow for subsequent sends.
    pub redirect: Option<Redirect>,
}

impl SendAck {
    /// Every item accepted, no redirect.
    pub fn all(accepted: usize) -> Self {
        Self {
            accepted,
            redirect: None,
        }
    }
}

/// Capability that transmits a batch to a monitoring server.
#[async_trait::async_trait]
pub trait ServerTransport: Send + Sync + 'static {
    /// Send `batch` to `address`.
    ///
    /// On success the acknowledgement reports how many leading items the
    /// server accepted.
    async fn send(&self, address: &str, batch: &[BufferElement]) -> Result<SendAck, SendError>;
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    request: &'static str,
    host: &'a str,
    data: &'a [BufferElement],
    clock: i64,
}

#[derive(Debug, Deserialize)]
struct Response {
    response: String,
    #[serde(default)]
    info: Option<String>,
    #[serde(default)]
    accepted: Option<usize>,
    #[serde(default)]
    redirect: Option<Redirect>,
}

/// Newline-delimited JSON over TCP.
///
/// Each send opens a connection, writes one request line and reads one
/// response line.
#[derive(Debug, Clone)]
pub struct JsonLineTransport {
    hostname: String,
    source_ip: Option<IpAddr>,
}

impl JsonLineTransport {
    /// Create a transport sending on behalf of `hostname`.
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            source_ip: None,
        }
    }

    /// Bind outbound connections to `ip`.
    pub fn with_source_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.source_ip = ip;
        self
    }
}

#[async_trait::async_trait]
impl ServerTransport for JsonLineTransport {
    async fn send(&self, address: &str, batch: &[BufferElement]) -> Result<SendAck, SendError> {
        let mut line = serde_json::to_vec(&Request {
            request: AGENT_DATA_REQUEST,
            host: &self.hostname,
            data: batch,
            clock: Utc::now().timestamp(),
        })?;
        line.push(b'\n');

        let stream = crate::net::connect_from(address, self.source_ip)
            .await
            .map_err(|source| SendError::Connect {
                address: address.to_string(),
                source,
            })?;
        let (reader, mut writer) = stream.into_split();

        writer.write_all(&line).await?;
        writer.flush().await?;

        let mut response = String::new();
        if BufReader::new(reader).read_line(&mut response).await? == 0 {
            return Err(SendError::Protocol("connection closed before response".to_string()));
        }

        let response: Response = serde_json::from_str(response.trim_end())
            .map_err(|e| SendError::Protocol(format!("invalid response: {e}")))?;

        if response.response != RESPONSE_SUCCESS {
            return Err(SendError::Rejected(
                response.info.unwrap_or(response.response),
            ));
        }

        Ok(SendAck {
            accepted: response.accepted.unwrap_or(batch.len()).min(batch.len()),
            redirect: response.redirect,
        })
    }
}
