//! Agent wiring.
//!
//! [`AgentBuilder`] assembles the registry, the result buffer, the scheduler
//! and the forwarding side selected by [`ForwardMode`], spawns them as tokio
//! tasks and returns [`AgentHandles`] for reload and shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::active::{BuiltinSource, MetricRegistry, MetricSource, MetricSpec, RateLimitedFetcher, Scheduler, SharedRegistry};
use crate::buffer::ResultBuffer;
use crate::config::{AppConfig, ConfigError, ForwardMode};
use crate::connector::{
    ConnectorError, ConnectorManager, ConnectorTransport, ConnectorWorkerConfig, EndpointSet, Router, TlsTransport,
    WorkerCountFn,
};
use crate::sender::{AddressPool, JsonLineTransport, Sender, SenderConfig, ServerTransport};

/// Agent startup errors.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Connector setup failed.
    #[error("connector error: {0}")]
    Connector(#[from] ConnectorError),
}

/// Builder for a running agent.
pub struct AgentBuilder {
    config: AppConfig,
    source: Option<Arc<dyn MetricSource>>,
    server_transport: Option<Arc<dyn ServerTransport>>,
    connector_transport: Option<Arc<dyn ConnectorTransport>>,
    worker_count: Option<WorkerCountFn>,
}

impl std::fmt::Debug for AgentBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AgentBuilder {
    /// Create a builder using the built-in source and transports.
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            source: None,
            server_transport: None,
            connector_transport: None,
            worker_count: None,
        }
    }

    /// Set the metric source (default: [`BuiltinSource`]).
    pub fn source(mut self, source: Arc<dyn MetricSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the server transport (default: [`JsonLineTransport`]).
    pub fn server_transport(mut self, transport: Arc<dyn ServerTransport>) -> Self {
        self.server_transport = Some(transport);
        self
    }

    /// Set the connector transport (default: [`TlsTransport`]).
    pub fn connector_transport(mut self, transport: Arc<dyn ConnectorTransport>) -> Self {
        self.connector_transport = Some(transport);
        self
    }

    /// Set the desired worker count query.
    ///
    /// By default the count starts at `connectors.workers` and follows
    /// [`AgentHandles::set_worker_count`].
    pub fn worker_count_fn(mut self, worker_count: WorkerCountFn) -> Self {
        self.worker_count = Some(worker_count);
        self
    }

    /// Validate the configuration, spawn every task and return handles.
    ///
    /// Must be called within a tokio runtime.
    pub fn build(self) -> Result<AgentHandles, AgentError> {
        let config = self.config;
        config.validate()?;
        let agent = &config.agent;

        let mut registry = MetricRegistry::new();
        registry.load(&config.metrics, Utc::now().timestamp())?;
        let registry = registry.shared();

        let buffer = Arc::new(ResultBuffer::new(agent.buffer_size).with_threshold(agent.effective_send_threshold()));

        let source = self
            .source
            .unwrap_or_else(|| Arc::new(BuiltinSource::new(agent.hostname.clone())));
        let fetcher = RateLimitedFetcher::new(source, agent.max_lines_per_second, agent.fetch_timeout);
        let scheduler = Scheduler::new(Arc::clone(&registry), fetcher, Arc::clone(&buffer), agent.hostname.clone());
        let reload = scheduler.reload_handle();

        let desired_workers = Arc::new(AtomicUsize::new(config.connectors.workers));
        let mut stages = Vec::new();
        let mut manager_wake = None;

        match agent.forward {
            ForwardMode::Server => {
                let transport: Arc<dyn ServerTransport> = self.server_transport.unwrap_or_else(|| {
                    Arc::new(JsonLineTransport::new(agent.hostname.clone()).with_source_ip(agent.source_ip))
                });
                let sender = Sender::new(
                    Arc::clone(&buffer),
                    transport,
                    AddressPool::new(config.server.addresses.iter().cloned()),
                    SenderConfig::from_config(agent, &config.server),
                );
                let grace = agent.shutdown_timeout;
                stages.push(Stage::spawn("sender", move |cancel| sender.run(cancel, grace)));
            }
            ForwardMode::Connectors => {
                let worker_config = ConnectorWorkerConfig::from_config(agent, &config.connectors);
                let transport: Arc<dyn ConnectorTransport> = match self.connector_transport {
                    Some(transport) => transport,
                    None => Arc::new(TlsTransport::new(&worker_config)?),
                };
                let endpoints = Arc::new(EndpointSet::from_config(&config.connectors.endpoints)?);

                let worker_count = self.worker_count.unwrap_or_else(|| {
                    let desired = Arc::clone(&desired_workers);
                    Arc::new(move || desired.load(Ordering::Relaxed))
                });
                let manager = ConnectorManager::new(
                    Arc::clone(&endpoints),
                    transport,
                    worker_config,
                    worker_count,
                    config.connectors.evaluate_interval,
                );
                manager_wake = Some(manager.wake_handle());

                // The router stops before the manager so its final routing
                // is still sent by the workers.
                let router = Router::new(Arc::clone(&buffer), endpoints, agent.buffer_send);
                let grace = agent.shutdown_timeout;
                stages.push(Stage::spawn("router", |cancel| router.run(cancel)));
                stages.push(Stage::spawn("connector manager", move |cancel| manager.run(cancel, grace)));
            }
        }
        stages.insert(0, Stage::spawn("scheduler", |cancel| scheduler.run(cancel)));

        tracing::info!(
            hostname = %agent.hostname,
            forward = %agent.forward,
            metrics = config.metrics.len(),
            buffer_size = agent.buffer_size,
            "Agent started"
        );

        Ok(AgentHandles {
            registry,
            buffer,
            reload,
            desired_workers,
            manager_wake,
            stages,
        })
    }
}

/// Handles to a running agent.
pub struct AgentHandles {
    /// Metric registry shared with the scheduler.
    pub registry: SharedRegistry,
    /// Result buffer shared with the forwarding side.
    pub buffer: Arc<ResultBuffer>,
    reload: Arc<Notify>,
    desired_workers: Arc<AtomicUsize>,
    manager_wake: Option<Arc<Notify>>,
    stages: Vec<Stage>,
}

/// A spawned task with its own stop token.
struct Stage {
    name: &'static str,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Stage {
    fn spawn<F, Fut>(name: &'static str, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(cancel.clone()));
        Self { name, cancel, task }
    }
}

impl std::fmt::Debug for AgentHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandles")
            .field("buffered", &self.buffer.len())
            .field("desired_workers", &self.desired_workers.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl AgentHandles {
    /// Replace the active metric set.
    ///
    /// On error the previous set stays active.
    pub fn reload_metrics(&self, specs: &[MetricSpec]) -> Result<(), ConfigError> {
        self.registry.write().load(specs, Utc::now().timestamp())?;
        self.reload.notify_one();
        Ok(())
    }

    /// Apply the reloadable parts of a new configuration.
    ///
    /// Metrics and the connector worker count are updated; everything else
    /// needs a restart.
    pub fn reload(&self, config: &AppConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.reload_metrics(&config.metrics)?;
        self.set_worker_count(config.connectors.workers);
        Ok(())
    }

    /// Change the desired connector worker count.
    ///
    /// Has no effect when a custom worker count query was installed, other
    /// than triggering a re-evaluation.
    pub fn set_worker_count(&self, count: usize) {
        self.desired_workers.store(count, Ordering::Relaxed);
        if let Some(wake) = &self.manager_wake {
            wake.notify_one();
        }
    }

    /// Stop the agent.
    ///
    /// Tasks stop one after another: the scheduler, then the router in
    /// connector mode, then the sender or connector manager. Each waits for
    /// the previous one, so items produced late are still flushed within the
    /// shutdown timeout.
    pub async fn shutdown(mut self) {
        self.stop().await;
        tracing::info!(
            remaining = self.buffer.len(),
            dropped = self.buffer.dropped(),
            "Agent stopped"
        );
    }

    async fn stop(&mut self) {
        for stage in self.stages.drain(..) {
            stage.cancel.cancel();
            if let Err(e) = stage.task.await {
                tracing::error!(task = stage.name, error = %e, "Agent task failed");
            }
        }
    }
}

impl Drop for AgentHandles {
    fn drop(&mut self) {
        // Tasks observe the tokens and wind down on their own.
        for stage in &self.stages {
            stage.cancel.cancel();
        }
    }
}
