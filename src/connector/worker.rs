//! Connector worker.

use std::collections::HashMap;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use strum_macros::{AsRefStr, Display, EnumString};
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backoff::ExponentialBackoff;
use crate::buffer::BufferElement;
use crate::config::{AgentConfig, ConnectorsConfig, TlsConfig};
use crate::connector::{ConnectorError, ConnectorStream, ConnectorTransport, Endpoint, EndpointLease, EndpointSet};

/// Backstop poll interval while idle.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum WorkerState {
    /// Waiting for queued items.
    Idle,
    /// Opening a connection.
    Connecting,
    /// Writing a batch.
    Sending,
    /// Waiting after a transient failure.
    Backoff,
    /// Stopping.
    Terminating,
}

/// Launch parameters shared by every worker.
#[derive(Debug, Clone)]
pub struct ConnectorWorkerConfig {
    /// Address outbound connections are bound to.
    pub source_ip: Option<IpAddr>,
    /// TLS material; plain TCP when absent.
    pub tls: Option<TlsConfig>,
    /// Connect and send timeout.
    pub timeout: Duration,
    /// First retry delay.
    pub backoff_initial: Duration,
    /// Largest retry delay.
    pub backoff_max: Duration,
    /// Largest encoded item.
    pub max_item_bytes: usize,
}

impl Default for ConnectorWorkerConfig {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default(), &ConnectorsConfig::default())
    }
}

impl ConnectorWorkerConfig {
    /// Build from the agent and connector sections.
    pub fn from_config(agent: &AgentConfig, connectors: &ConnectorsConfig) -> Self {
        Self {
            source_ip: agent.source_ip,
            tls: connectors.tls.clone(),
            timeout: connectors.timeout,
            backoff_initial: connectors.backoff_initial,
            backoff_max: connectors.backoff_max,
            max_item_bytes: connectors.max_item_bytes,
        }
    }
}

/// Encode items as NDJSON, dropping any that cannot be sent.
///
/// Returns the payload and the items it carries.
pub(crate) fn encode_batch(
    items: Vec<BufferElement>,
    max_item_bytes: usize,
) -> (Vec<u8>, Vec<BufferElement>) {
    let mut payload = Vec::new();
    let mut kept = Vec::with_capacity(items.len());

    for item in items {
        let line = serde_json::to_vec(&item).map_err(ConnectorError::from).and_then(|line| {
            if line.len() > max_item_bytes {
                Err(ConnectorError::ItemTooLarge {
                    size: line.len(),
                    max: max_item_bytes,
                })
            } else {
                Ok(line)
            }
        });

        match line {
            Ok(line) => {
                payload.extend_from_slice(&line);
                payload.push(b'\n');
                kept.push(item);
            }
            Err(e) => tracing::warn!(key = %item.key, error = %e, "Dropping item"),
        }
    }

    (payload, kept)
}

/// Drains endpoint queues over its own connections.
pub(crate) struct ConnectorWorker {
    id: usize,
    endpoints: Arc<EndpointSet>,
    transport: Arc<dyn ConnectorTransport>,
    config: ConnectorWorkerConfig,
    connections: HashMap<String, Box<dyn ConnectorStream>>,
    backoff: ExponentialBackoff,
    state: watch::Sender<WorkerState>,
}

impl ConnectorWorker {
    pub(crate) fn new(
        id: usize,
        endpoints: Arc<EndpointSet>,
        transport: Arc<dyn ConnectorTransport>,
        config: ConnectorWorkerConfig,
    ) -> (Self, watch::Receiver<WorkerState>) {
        let (state, rx) = watch::channel(WorkerState::Idle);
        let backoff = ExponentialBackoff::new(config.backoff_initial, config.backoff_max);
        let worker = Self {
            id,
            endpoints,
            transport,
            config,
            connections: HashMap::new(),
            backoff,
            state,
        };
        (worker, rx)
    }

    /// Run until `stop` fires.
    ///
    /// The stop signal is honoured only between sends, so a batch already
    /// taken from a queue is finished (or fails on its own timeout) first.
    pub(crate) async fn run(mut self, stop: CancellationToken) {
        tracing::debug!(worker = self.id, "Connector worker started");
        let endpoints = Arc::clone(&self.endpoints);

        loop {
            self.set_state(WorkerState::Idle);
            let Some(lease) = wait_for_lease(&endpoints, &stop).await else {
                break;
            };

            let result = self.send_batch(&lease).await;
            drop(lease);

            match result {
                Ok(_) => self.backoff.reset(),
                // The batch was dropped; retrying cannot help.
                Err(e) if !e.is_retryable() => {}
                Err(e) => {
                    let wait = self.backoff.next_wait();
                    self.set_state(WorkerState::Backoff);
                    tracing::warn!(
                        worker = self.id,
                        error = %e,
                        attempts = self.backoff.attempts(),
                        wait = ?wait,
                        "Connector send failed, backing off"
                    );
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }

        self.set_state(WorkerState::Terminating);
        for (endpoint, mut connection) in self.connections.drain() {
            if let Err(e) = connection.shutdown().await {
                tracing::trace!(worker = self.id, endpoint = %endpoint, error = %e, "Connection shutdown failed");
            }
        }
        tracing::debug!(worker = self.id, "Connector worker stopped");
    }

    /// Send one batch from the leased endpoint.
    ///
    /// Items that cannot be encoded are dropped. On a retryable error the
    /// batch goes back to the queue head; on any other error it is dropped.
    /// Either way the endpoint connection is discarded.
    async fn send_batch(&mut self, lease: &EndpointLease) -> Result<usize, ConnectorError> {
        let endpoint = lease.endpoint();
        let drained = endpoint.queue().drain(endpoint.batch_size());
        let taken = drained.len();
        let (payload, items) = encode_batch(drained, self.config.max_item_bytes);
        endpoint.queue().record_dropped(taken - items.len());
        if items.is_empty() {
            return Ok(0);
        }

        match self.deliver(endpoint, &payload).await {
            Ok(()) => {
                tracing::trace!(worker = self.id, endpoint = endpoint.name(), count = items.len(), "Batch sent");
                Ok(items.len())
            }
            Err(e) => {
                self.connections.remove(endpoint.name());
                if e.is_retryable() {
                    endpoint.queue().requeue_front(items);
                } else {
                    endpoint.queue().record_dropped(items.len());
                    tracing::error!(
                        worker = self.id,
                        endpoint = endpoint.name(),
                        count = items.len(),
                        error = %e,
                        "Dropping batch after permanent connector error"
                    );
                }
                Err(e)
            }
        }
    }

    async fn deliver(&mut self, endpoint: &Endpoint, payload: &[u8]) -> Result<(), ConnectorError> {
        self.ensure_connected(endpoint).await?;

        self.set_state(WorkerState::Sending);
        let timeout = self.config.timeout;
        let Some(connection) = self.connections.get_mut(endpoint.name()) else {
            return Err(ConnectorError::InvalidAddress(endpoint.address().to_string()));
        };
        tokio::time::timeout(timeout, async {
            connection.write_all(payload).await?;
            connection.flush().await
        })
        .await
        .map_err(|_| ConnectorError::Timeout(timeout))?
        .map_err(ConnectorError::from)
    }

    /// Reuse the cached connection if the peer still has it open.
    async fn ensure_connected(&mut self, endpoint: &Endpoint) -> Result<(), ConnectorError> {
        if let Some(connection) = self.connections.get_mut(endpoint.name()) {
            if peer_open(&mut **connection).await {
                return Ok(());
            }
            tracing::debug!(worker = self.id, endpoint = endpoint.name(), "Connector peer closed, reconnecting");
            self.connections.remove(endpoint.name());
        }

        self.set_state(WorkerState::Connecting);
        let connection = self.transport.connect(endpoint.address()).await?;
        tracing::debug!(worker = self.id, endpoint = endpoint.name(), "Connector connected");
        self.connections.insert(endpoint.name().to_string(), connection);
        Ok(())
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }
}

async fn wait_for_lease(endpoints: &Arc<EndpointSet>, stop: &CancellationToken) -> Option<EndpointLease> {
    loop {
        if stop.is_cancelled() {
            return None;
        }

        let ready = endpoints.ready();
        tokio::pin!(ready);
        ready.as_mut().enable();

        if let Some(lease) = endpoints.lease() {
            return Some(lease);
        }

        tokio::select! {
            _ = stop.cancelled() => return None,
            _ = ready => {}
            _ = tokio::time::sleep(IDLE_POLL) => {}
        }
    }
}

/// Whether the peer has not closed its side of `connection`.
///
/// Polls one read without waiting: nothing to read means open, EOF or an
/// error means closed. The protocol is one-way, so unsolicited bytes are
/// discarded.
async fn peer_open(connection: &mut dyn ConnectorStream) -> bool {
    std::future::poll_fn(|cx| {
        let mut byte = [0u8; 1];
        let mut buf = ReadBuf::new(&mut byte);
        Poll::Ready(match Pin::new(&mut *connection).poll_read(cx, &mut buf) {
            Poll::Pending => true,
            Poll::Ready(Ok(())) => !buf.filled().is_empty(),
            Poll::Ready(Err(_)) => false,
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    use crate::config::EndpointConfig;

    /// In-memory stream appending writes to a shared log.
    ///
    /// Reads stay pending until the peer is marked closed, then report EOF.
    struct Recorder {
        written: Arc<Mutex<Vec<u8>>>,
        closed: Arc<AtomicBool>,
    }

    impl AsyncRead for Recorder {
        fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            if self.closed.load(Ordering::Relaxed) {
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            }
        }
    }

    impl AsyncWrite for Recorder {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            self.written.lock().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Fails the scripted number of connects, then records writes.
    struct FlakyTransport {
        failures: Mutex<usize>,
        attempts: Mutex<VecDeque<tokio::time::Instant>>,
        written: Arc<Mutex<Vec<u8>>>,
        peers: Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl FlakyTransport {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(failures),
                attempts: Mutex::default(),
                written: Arc::default(),
                peers: Mutex::default(),
            })
        }

        fn lines(&self) -> Vec<String> {
            String::from_utf8(self.written.lock().clone())
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        }

        async fn wait_for_lines(&self, count: usize) {
            for _ in 0..100 {
                if self.lines().len() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    #[async_trait::async_trait]
    impl ConnectorTransport for FlakyTransport {
        async fn connect(&self, address: &str) -> Result<Box<dyn ConnectorStream>, ConnectorError> {
            self.attempts.lock().push_back(tokio::time::Instant::now());
            {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(ConnectorError::Connect {
                        address: address.to_string(),
                        source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
                    });
                }
            }
            let closed = Arc::new(AtomicBool::new(false));
            self.peers.lock().push(Arc::clone(&closed));
            Ok(Box::new(Recorder {
                written: Arc::clone(&self.written),
                closed,
            }))
        }
    }

    /// Rejects every endpoint as misconfigured.
    struct Misconfigured {
        attempts: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ConnectorTransport for Misconfigured {
        async fn connect(&self, address: &str) -> Result<Box<dyn ConnectorStream>, ConnectorError> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            Err(ConnectorError::InvalidAddress(address.to_string()))
        }
    }

    fn config() -> ConnectorWorkerConfig {
        ConnectorWorkerConfig {
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(4),
            max_item_bytes: 256,
            ..ConnectorWorkerConfig::default()
        }
    }

    fn endpoints() -> Arc<EndpointSet> {
        Arc::new(EndpointSet::from_config(&[EndpointConfig::new("main", "collector:6514")]).unwrap())
    }

    fn element(value: &str) -> BufferElement {
        BufferElement::new("web-01", "agent.ping", value, 0)
    }

    #[test]
    fn test_encode_drops_oversized() {
        let big = "x".repeat(300);
        let (payload, kept) = encode_batch(vec![element("1"), element(&big), element("2")], 256);

        assert_eq!(kept.len(), 2);
        let text = String::from_utf8(payload).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_run_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let (worker, _state) = ConnectorWorker::new(0, endpoints(), FlakyTransport::new(0), config());
        let run = worker.run(CancellationToken::new());
        assert_send(&run);
    }

    #[tokio::test]
    async fn test_sends_queued_items() {
        let endpoints = endpoints();
        let transport = FlakyTransport::new(0);
        let (worker, state) = ConnectorWorker::new(0, Arc::clone(&endpoints), transport.clone(), config());
        let stop = CancellationToken::new();
        let handle = tokio::spawn(worker.run(stop.clone()));

        endpoints.route(element("1"));
        endpoints.route(element("2"));
        endpoints.notify_ready();

        transport.wait_for_lines(2).await;
        assert_eq!(transport.lines().len(), 2);
        assert!(transport.lines()[0].contains("\"value\":\"1\""));

        stop.cancel();
        handle.await.unwrap();
        assert_eq!(*state.borrow(), WorkerState::Terminating);
        assert_eq!(endpoints.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_and_items_survive() {
        let endpoints = endpoints();
        let transport = FlakyTransport::new(4);
        let (worker, _state) = ConnectorWorker::new(0, Arc::clone(&endpoints), transport.clone(), config());
        let stop = CancellationToken::new();

        endpoints.route(element("a"));
        endpoints.route(element("b"));
        let handle = tokio::spawn(worker.run(stop.clone()));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.lines().len(), 2);
        assert!(transport.lines()[0].contains("\"value\":\"a\""));

        let attempts: Vec<_> = transport.attempts.lock().iter().copied().collect();
        assert_eq!(attempts.len(), 5);
        let gaps: Vec<_> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(4),
            ]
        );

        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_backoff_skips_connect() {
        let endpoints = endpoints();
        let transport = FlakyTransport::new(usize::MAX);
        let (worker, state) = ConnectorWorker::new(0, Arc::clone(&endpoints), transport.clone(), config());
        let stop = CancellationToken::new();

        endpoints.route(element("a"));
        let handle = tokio::spawn(worker.run(stop.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*state.borrow(), WorkerState::Backoff);

        stop.cancel();
        handle.await.unwrap();
        assert_eq!(transport.attempts.lock().len(), 1);
        assert_eq!(endpoints.pending(), 1);
    }

    #[tokio::test]
    async fn test_reuses_connection_until_peer_closes() {
        let endpoints = endpoints();
        let transport = FlakyTransport::new(0);
        let (worker, _state) = ConnectorWorker::new(0, Arc::clone(&endpoints), transport.clone(), config());
        let stop = CancellationToken::new();
        let handle = tokio::spawn(worker.run(stop.clone()));

        endpoints.route(element("1"));
        endpoints.notify_ready();
        transport.wait_for_lines(1).await;

        endpoints.route(element("2"));
        endpoints.notify_ready();
        transport.wait_for_lines(2).await;
        assert_eq!(transport.attempts.lock().len(), 1);

        // Peer half-closes; the next batch must go over a fresh connection.
        transport.peers.lock()[0].store(true, Ordering::Relaxed);
        endpoints.route(element("3"));
        endpoints.notify_ready();
        transport.wait_for_lines(3).await;

        assert_eq!(transport.lines().len(), 3);
        assert_eq!(transport.attempts.lock().len(), 2);

        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_drops_batch_without_backoff() {
        let endpoints = endpoints();
        let transport = Arc::new(Misconfigured {
            attempts: AtomicUsize::new(0),
        });
        let (worker, state) = ConnectorWorker::new(0, Arc::clone(&endpoints), transport.clone(), config());
        let stop = CancellationToken::new();

        endpoints.route(element("a"));
        endpoints.route(element(&"x".repeat(300)));
        let handle = tokio::spawn(worker.run(stop.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(endpoints.pending(), 0);
        // One oversized item, one item lost to the permanent error.
        assert_eq!(endpoints.dropped(), 2);
        assert_eq!(*state.borrow(), WorkerState::Idle);

        endpoints.route(element("b"));
        endpoints.notify_ready();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(endpoints.pending(), 0);
        assert_eq!(transport.attempts.load(Ordering::Relaxed), 2);

        stop.cancel();
        handle.await.unwrap();
    }
}
