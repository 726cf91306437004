//! Argus - Active Check Telemetry Agent
//!
//! This crate provides the collection-and-forwarding core of the Argus agent.
//! It can be embedded as a library, or run as a standalone binary with the
//! `argus` executable.
//!
//! # Architecture
//!
//! - **Active checks**: metric registry, rate-limited fetcher and the scheduler loop
//! - **Buffer**: bounded result buffer shared by producers and drainers
//! - **Sender**: drains the buffer to the monitoring server
//! - **Connectors**: worker pool forwarding buffered items to external endpoints over TLS
//!
//! # Example
//!
//! ```rust,no_run
//! use argus::{AgentBuilder, AppConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load("configs/agent.yaml")?;
//! let handles = AgentBuilder::new(config).build()?;
//!
//! tokio::signal::ctrl_c().await?;
//! handles.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod active;
pub mod agent;
pub mod backoff;
pub mod buffer;
pub mod config;
pub mod connector;
mod net;
pub mod sender;

pub use active::{
    ActiveMetric, BuiltinSource, FetchError, FetchOutput, FetchRequest, FetchedValue, MetricKey, MetricRegistry,
    MetricSource, MetricSpec, MetricStatus, RateLimitedFetcher, Scheduler,
};
pub use agent::{AgentBuilder, AgentError, AgentHandles};
pub use backoff::ExponentialBackoff;
pub use buffer::{BufferElement, ResultBuffer};
pub use config::{AppConfig, ConfigError, ForwardMode};
pub use connector::{
    ConnectorError, ConnectorManager, ConnectorStream, ConnectorTransport, ConnectorWorkerConfig, EndpointSet, Router,
    TlsTransport, WorkerCountFn, WorkerState,
};
pub use sender::{
    AddressPool, JsonLineTransport, Redirect, SendAck, SendError, SendResult, Sender, SenderConfig, ServerTransport,
};
