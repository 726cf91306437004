//! Moves buffered items to connector endpoint queues.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::buffer::ResultBuffer;
use crate::connector::EndpointSet;

/// Single drainer of the result buffer in connector mode.
#[derive(Debug)]
pub struct Router {
    buffer: Arc<ResultBuffer>,
    endpoints: Arc<EndpointSet>,
    interval: Duration,
    unmatched: AtomicU64,
}

impl Router {
    /// Create a router draining `buffer` at least every `interval`.
    pub fn new(buffer: Arc<ResultBuffer>, endpoints: Arc<EndpointSet>, interval: Duration) -> Self {
        Self {
            buffer,
            endpoints,
            interval,
            unmatched: AtomicU64::new(0),
        }
    }

    /// Route everything currently buffered. Returns the number routed.
    pub fn route_pending(&self) -> usize {
        let items = self.buffer.drain(usize::MAX);
        if items.is_empty() {
            return 0;
        }

        let total = items.len();
        let mut routed = 0;
        for element in items {
            if self.endpoints.route(element) {
                routed += 1;
            }
        }

        let unmatched = total - routed;
        if unmatched > 0 {
            let count = self.unmatched.fetch_add(unmatched as u64, Ordering::Relaxed) + unmatched as u64;
            tracing::debug!(unmatched, total_unmatched = count, "Dropped items matching no connector");
        }
        if routed > 0 {
            self.endpoints.notify_ready();
        }
        routed
    }

    /// Items dropped because no endpoint accepted their key.
    pub fn unmatched(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    /// Run until `cancel` fires, then route once more.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(endpoints = self.endpoints.endpoints().len(), "Connector router started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.buffer.notified() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }
            self.route_pending();
        }

        self.route_pending();
        tracing::info!(unmatched = self.unmatched(), "Connector router stopped");
    }
}
