//! Built-in metric sources.
//!
//! - `agent.ping`: always `1`
//! - `agent.hostname`: configured host name
//! - `agent.version`: agent version
//! - `log[file,<regexp>,<encoding>,<maxlines>]`: new lines of a text file

use std::io::SeekFrom;

use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::active::{FetchError, FetchOutput, FetchRequest, FetchedValue, KeyError, MetricSource};

/// Largest chunk read from a log file per fetch (1 MiB).
const DEFAULT_MAX_READ_BYTES: usize = 1024 * 1024;

/// Sources answered by the agent itself.
#[derive(Debug, Clone)]
pub struct BuiltinSource {
    hostname: String,
    max_read_bytes: usize,
}

impl BuiltinSource {
    /// Create the built-in source set.
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
        }
    }

    /// Set the largest chunk read from a log file per fetch.
    pub fn with_max_read_bytes(mut self, bytes: usize) -> Self {
        self.max_read_bytes = bytes.max(1);
        self
    }

    async fn tail_log(&self, request: &FetchRequest) -> Result<FetchOutput, FetchError> {
        let key = &request.key;
        let path = key.param(0).ok_or_else(|| KeyError::InvalidParam {
            index: 1,
            reason: "missing file name".to_string(),
        })?;
        let pattern = key
            .param(1)
            .map(Regex::new)
            .transpose()
            .map_err(|e| KeyError::InvalidParam {
                index: 2,
                reason: e.to_string(),
            })?;

        let mut file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();

        let mut offset = request.last_log_size;
        if size < offset {
            tracing::debug!(path, size, offset, "Log file shrank, reading from start");
            offset = 0;
        }
        if size == offset {
            return Ok(FetchOutput::with_consumed_to(Vec::new(), offset));
        }

        file.seek(SeekFrom::Start(offset)).await?;
        let to_read = (size - offset).min(self.max_read_bytes as u64) as usize;
        let mut buf = vec![0u8; to_read];
        file.read_exact(&mut buf).await?;

        let max_lines = request.max_lines.unwrap_or(usize::MAX);
        let mut values = Vec::new();
        let mut pos = 0usize;

        while values.len() < max_lines {
            let (line_end, next) = match buf[pos..].iter().position(|b| *b == b'\n') {
                Some(nl) => (pos + nl, pos + nl + 1),
                // A line longer than the read chunk is emitted in pieces.
                None if pos == 0 && to_read == self.max_read_bytes => {
                    let cut = utf8_cut(&buf);
                    (cut, cut)
                }
                None => break,
            };

            let line = String::from_utf8_lossy(&buf[pos..line_end]);
            let line = line.trim_end_matches('\r');
            pos = next;

            if pattern.as_ref().is_none_or(|re| re.is_match(line)) {
                values.push(FetchedValue::new(line).with_last_log_size(offset + pos as u64));
            }
        }

        Ok(FetchOutput::with_consumed_to(values, offset + pos as u64))
    }
}

/// Length of `buf` without a trailing, incomplete UTF-8 sequence.
///
/// Invalid data, or a chunk holding nothing but a partial character, is
/// returned whole so the reader still advances.
fn utf8_cut(buf: &[u8]) -> usize {
    match std::str::from_utf8(buf) {
        Err(e) if e.error_len().is_none() && e.valid_up_to() > 0 => e.valid_up_to(),
        _ => buf.len(),
    }
}

#[async_trait::async_trait]
impl MetricSource for BuiltinSource {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchOutput, FetchError> {
        match request.key.name() {
            "agent.ping" => Ok(vec![FetchedValue::new("1")].into()),
            "agent.hostname" => Ok(vec![FetchedValue::new(self.hostname.clone())].into()),
            "agent.version" => Ok(vec![FetchedValue::new(env!("CARGO_PKG_VERSION"))].into()),
            "log" => self.tail_log(request).await,
            _ => Err(FetchError::Unsupported(request.key.to_string())),
        }
    }
}
