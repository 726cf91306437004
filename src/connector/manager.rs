//! Connector worker pool supervision.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connector::worker::ConnectorWorker;
use crate::connector::{ConnectorTransport, ConnectorWorkerConfig, EndpointSet, WorkerState};

/// Poll interval while waiting for endpoint queues to drain.
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Query for the desired number of connector workers.
pub type WorkerCountFn = Arc<dyn Fn() -> usize + Send + Sync>;

struct WorkerHandle {
    id: usize,
    stop: CancellationToken,
    state: watch::Receiver<WorkerState>,
    join: JoinHandle<()>,
}

/// Keeps the number of running connector workers equal to the desired count.
///
/// The manager holds no telemetry itself. Scaling down cancels the newest
/// workers, which finish their in-flight send before exiting.
pub struct ConnectorManager {
    endpoints: Arc<EndpointSet>,
    transport: Arc<dyn ConnectorTransport>,
    config: ConnectorWorkerConfig,
    worker_count: WorkerCountFn,
    evaluate_interval: Duration,
    wake: Arc<Notify>,
    workers: Vec<WorkerHandle>,
    stopping: Vec<WorkerHandle>,
    next_id: usize,
}

impl std::fmt::Debug for ConnectorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorManager")
            .field("workers", &self.workers.len())
            .field("stopping", &self.stopping.len())
            .field("evaluate_interval", &self.evaluate_interval)
            .finish_non_exhaustive()
    }
}

impl ConnectorManager {
    /// Create a manager; no worker runs until the first evaluation.
    pub fn new(
        endpoints: Arc<EndpointSet>,
        transport: Arc<dyn ConnectorTransport>,
        config: ConnectorWorkerConfig,
        worker_count: WorkerCountFn,
        evaluate_interval: Duration,
    ) -> Self {
        Self {
            endpoints,
            transport,
            config,
            worker_count,
            evaluate_interval,
            wake: Arc::new(Notify::new()),
            workers: Vec::new(),
            stopping: Vec::new(),
            next_id: 0,
        }
    }

    /// Handle that triggers an immediate re-evaluation.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Running workers, excluding those asked to stop.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Current state of every running worker, oldest first.
    pub fn worker_states(&self) -> Vec<(usize, WorkerState)> {
        self.workers.iter().map(|w| (w.id, *w.state.borrow())).collect()
    }

    /// Reap exited workers and resize the pool. Returns the desired count.
    pub fn evaluate(&mut self) -> usize {
        self.reap();

        let desired = (self.worker_count)();
        let current = self.workers.len();

        if desired > current {
            for _ in current..desired {
                self.spawn_worker();
            }
            tracing::info!(from = current, to = desired, "Connector workers scaled up");
        } else if desired < current {
            for worker in self.workers.drain(desired..).rev() {
                tracing::debug!(worker = worker.id, "Stopping connector worker");
                worker.stop.cancel();
                self.stopping.push(worker);
            }
            tracing::info!(from = current, to = desired, "Connector workers scaled down");
        }

        desired
    }

    /// Run until `cancel` fires, then stop every worker within `grace`.
    pub async fn run(mut self, cancel: CancellationToken, grace: Duration) {
        tracing::info!(
            endpoints = self.endpoints.endpoints().len(),
            evaluate_interval = ?self.evaluate_interval,
            "Connector manager started"
        );

        loop {
            self.evaluate();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.evaluate_interval) => {}
            }
        }

        self.shutdown(grace).await;
    }

    /// Flush the endpoint queues and stop every worker, all within `grace`.
    ///
    /// Running workers first keep sending until every queue is empty and no
    /// batch is in flight. Then all workers are stopped; each finishes the
    /// batch it holds. Workers still running at the deadline are aborted and
    /// items still queued are counted as dropped. Returns whether all workers
    /// exited in time.
    pub async fn shutdown(&mut self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;

        self.reap();
        if !self.workers.is_empty() && !drain(&self.endpoints, deadline).await {
            tracing::warn!(
                pending = self.endpoints.pending(),
                "Connector queues not drained before shutdown deadline"
            );
        }

        let mut handles: Vec<WorkerHandle> = self.workers.drain(..).collect();
        handles.append(&mut self.stopping);
        for worker in &handles {
            worker.stop.cancel();
        }

        let count = handles.len();
        let mut clean = true;

        for worker in handles {
            let abort = worker.join.abort_handle();
            match tokio::time::timeout_at(deadline, worker.join).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(worker = worker.id, error = %e, "Connector worker failed"),
                Err(_) => {
                    tracing::warn!(worker = worker.id, "Connector worker did not stop in time, aborting");
                    abort.abort();
                    clean = false;
                }
            }
        }

        let discarded = self.endpoints.discard_pending();
        if discarded > 0 {
            tracing::warn!(discarded, "Discarded connector items still queued at shutdown");
        }
        tracing::info!(
            workers = count,
            clean,
            dropped = self.endpoints.dropped(),
            "Connector manager stopped"
        );
        clean
    }

    fn spawn_worker(&mut self) {
        let id = self.next_id;
        self.next_id += 1;

        let (worker, state) = ConnectorWorker::new(
            id,
            Arc::clone(&self.endpoints),
            Arc::clone(&self.transport),
            self.config.clone(),
        );
        let stop = CancellationToken::new();
        let join = tokio::spawn(worker.run(stop.clone()));

        self.workers.push(WorkerHandle { id, stop, state, join });
    }

    fn reap(&mut self) {
        self.stopping.retain(|w| !w.join.is_finished());

        let before = self.workers.len();
        self.workers.retain(|w| !w.join.is_finished());
        let exited = before - self.workers.len();
        if exited > 0 {
            tracing::warn!(exited, "Connector workers exited unexpectedly");
        }
    }
}

/// Wait until the endpoints are idle or `deadline` passes.
async fn drain(endpoints: &EndpointSet, deadline: tokio::time::Instant) -> bool {
    let pending = endpoints.pending();
    if pending > 0 {
        tracing::debug!(pending, "Draining connector queues");
    }

    loop {
        if endpoints.is_idle() {
            return true;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep_until((now + DRAIN_POLL).min(deadline)).await;
    }
}
