//! Forwarding to connector endpoints.
//!
//! In connector mode the [`Router`] drains the result buffer into per-endpoint
//! queues. A pool of workers, sized by the [`ConnectorManager`] from an
//! injected [`WorkerCountFn`], sends queued items as NDJSON over TLS (or plain
//! TCP) connections opened through a [`ConnectorTransport`].

mod endpoint;
mod error;
mod manager;
mod router;
mod transport;
mod worker;

pub use endpoint::{Endpoint, EndpointLease, EndpointSet};
pub use error::ConnectorError;
pub use manager::{ConnectorManager, WorkerCountFn};
pub use router::Router;
pub use transport::{ConnectorStream, ConnectorTransport, TlsTransport};
pub use worker::{ConnectorWorkerConfig, WorkerState};
