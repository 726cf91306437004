//! Connector endpoints and their item queues.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use regex::Regex;
use tokio::sync::Notify;

use crate::buffer::{BufferElement, ResultBuffer};
use crate::config::EndpointConfig;
use crate::connector::ConnectorError;

/// One connector destination with its bounded queue.
#[derive(Debug)]
pub struct Endpoint {
    name: String,
    address: String,
    filter: Option<Regex>,
    queue: ResultBuffer,
    max_senders: usize,
    batch_size: usize,
    senders: AtomicUsize,
}

impl Endpoint {
    /// Build an endpoint from configuration.
    pub fn from_config(config: &EndpointConfig) -> Result<Self, ConnectorError> {
        let filter = config.key_filter.as_deref().map(Regex::new).transpose()?;
        Ok(Self {
            name: config.name.clone(),
            address: config.address.clone(),
            filter,
            queue: ResultBuffer::new(config.queue_capacity),
            max_senders: config.max_senders.max(1),
            batch_size: config.batch_size.max(1),
            senders: AtomicUsize::new(0),
        })
    }

    /// Endpoint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Destination address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Items waiting for this endpoint.
    pub fn queue(&self) -> &ResultBuffer {
        &self.queue
    }

    /// Items per send.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Whether items with `key` go to this endpoint.
    pub fn accepts(&self, key: &str) -> bool {
        self.filter.as_ref().is_none_or(|re| re.is_match(key))
    }

    /// Workers currently sending to this endpoint.
    pub fn active_senders(&self) -> usize {
        self.senders.load(Ordering::Acquire)
    }

    fn try_acquire(&self) -> bool {
        self.senders
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_senders).then_some(n + 1)
            })
            .is_ok()
    }
}

/// All configured endpoints, shared by the router and the workers.
#[derive(Debug)]
pub struct EndpointSet {
    endpoints: Vec<Arc<Endpoint>>,
    ready: Notify,
    cursor: AtomicUsize,
}

impl EndpointSet {
    /// Build the set from configuration, in configured order.
    pub fn from_config(configs: &[EndpointConfig]) -> Result<Self, ConnectorError> {
        let endpoints = configs
            .iter()
            .map(|c| Endpoint::from_config(c).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            endpoints,
            ready: Notify::new(),
            cursor: AtomicUsize::new(0),
        })
    }

    /// Endpoints in configured order.
    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    /// Queue `element` on the first endpoint whose filter accepts its key.
    ///
    /// Returns `false` when no endpoint accepts it.
    pub fn route(&self, element: BufferElement) -> bool {
        match self.endpoints.iter().find(|e| e.accepts(&element.key)) {
            Some(endpoint) => {
                endpoint.queue.append(element);
                true
            }
            None => false,
        }
    }

    /// Total items queued across endpoints.
    pub fn pending(&self) -> usize {
        self.endpoints.iter().map(|e| e.queue.len()).sum()
    }

    /// Whether nothing is queued and no batch is in flight.
    pub fn is_idle(&self) -> bool {
        self.endpoints
            .iter()
            .all(|e| e.queue.is_empty() && e.active_senders() == 0)
    }

    /// Discard everything still queued, counting it as dropped.
    pub fn discard_pending(&self) -> usize {
        self.endpoints.iter().map(|e| e.queue.discard_all()).sum()
    }

    /// Items dropped across endpoint queues.
    pub fn dropped(&self) -> u64 {
        self.endpoints.iter().map(|e| e.queue.dropped()).sum()
    }

    /// Wake idle workers.
    pub fn notify_ready(&self) {
        self.ready.notify_waiters();
    }

    /// Wait for [`notify_ready`](Self::notify_ready).
    pub fn ready(&self) -> tokio::sync::futures::Notified<'_> {
        self.ready.notified()
    }

    /// Lease an endpoint that has queued items and a free sender slot.
    ///
    /// Endpoints are scanned round-robin so one busy endpoint does not
    /// starve the others. The slot is released when the lease is dropped.
    pub fn lease(self: &Arc<Self>) -> Option<EndpointLease> {
        let n = self.endpoints.len();
        if n == 0 {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        (0..n)
            .map(|i| &self.endpoints[(start + i) % n])
            .find(|e| !e.queue.is_empty() && e.try_acquire())
            .map(|endpoint| EndpointLease {
                endpoint: Arc::clone(endpoint),
                set: Arc::clone(self),
            })
    }
}

/// Exclusive sender slot on an endpoint.
#[derive(Debug)]
pub struct EndpointLease {
    endpoint: Arc<Endpoint>,
    set: Arc<EndpointSet>,
}

impl EndpointLease {
    /// Leased endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Drop for EndpointLease {
    fn drop(&mut self) {
        self.endpoint.senders.fetch_sub(1, Ordering::AcqRel);
        if !self.endpoint.queue.is_empty() {
            self.set.notify_ready();
        }
    }
}
