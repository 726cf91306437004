//! Sender loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::ExponentialBackoff;
use crate::buffer::ResultBuffer;
use crate::config::{AgentConfig, ServerConfig};
use crate::sender::{AddressPool, SendAck, SendError, ServerTransport};

/// Outcome of one flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Nothing to send.
    Empty,
    /// Whole batch accepted.
    Sent { accepted: usize },
    /// Leading items accepted, the rest returned to the buffer head.
    Partial { accepted: usize, requeued: usize },
    /// Transient failure, the whole batch returned to the buffer head.
    Failed { requeued: usize },
    /// Server refused the batch, items dropped.
    Rejected { dropped: usize },
}

/// Sender tuning.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Largest batch per send.
    pub max_batch: usize,
    /// Longest time data may wait after the last successful send.
    pub buffer_send: Duration,
    /// Timeout of one send.
    pub timeout: Duration,
    /// First retry delay after a failure.
    pub backoff_initial: Duration,
    /// Largest retry delay.
    pub backoff_max: Duration,
}

impl SenderConfig {
    /// Build from the agent and server sections.
    pub fn from_config(agent: &AgentConfig, server: &ServerConfig) -> Self {
        Self {
            max_batch: agent.max_batch,
            buffer_send: agent.buffer_send,
            timeout: server.timeout,
            backoff_initial: server.backoff_initial,
            backoff_max: server.backoff_max,
        }
    }
}

/// Drains the result buffer to the monitoring server.
pub struct Sender {
    buffer: Arc<ResultBuffer>,
    transport: Arc<dyn ServerTransport>,
    pool: AddressPool,
    config: SenderConfig,
    backoff: ExponentialBackoff,
    last_send: Instant,
    retry_at: Option<Instant>,
    resend_now: bool,
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("pool", &self.pool.to_string())
            .field("config", &self.config)
            .field("retry_at", &self.retry_at)
            .finish_non_exhaustive()
    }
}

impl Sender {
    /// Create a sender.
    pub fn new(
        buffer: Arc<ResultBuffer>,
        transport: Arc<dyn ServerTransport>,
        pool: AddressPool,
        config: SenderConfig,
    ) -> Self {
        let backoff = ExponentialBackoff::new(config.backoff_initial, config.backoff_max);
        Self {
            buffer,
            transport,
            pool,
            config,
            backoff,
            last_send: Instant::now(),
            retry_at: None,
            resend_now: false,
        }
    }

    /// Address pool, including any redirect received.
    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    /// Time before the next attempt is allowed, if a failure armed the backoff.
    pub fn retry_in(&self) -> Option<Duration> {
        self.retry_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Send one batch of up to `max_batch` items.
    ///
    /// Accepted items are discarded. Unaccepted items go back to the buffer
    /// head in their original order; after a redirect they are resent
    /// without waiting. A transient failure rotates to the next server
    /// address and arms the backoff; a rejected batch is dropped.
    pub async fn flush(&mut self) -> SendResult {
        self.resend_now = false;
        let mut batch = self.buffer.drain(self.config.max_batch.max(1));
        if batch.is_empty() {
            return SendResult::Empty;
        }
        let total = batch.len();

        let result = match self.pool.current() {
            Some(address) => {
                let address = address.to_string();
                tokio::time::timeout(self.config.timeout, self.transport.send(&address, &batch))
                    .await
                    .unwrap_or_else(|_| Err(SendError::Timeout(self.config.timeout)))
                    .inspect_err(|e| tracing::warn!(address = %address, count = total, error = %e, "Send failed"))
            }
            None => Err(SendError::NoAddress),
        };

        match result {
            Ok(SendAck { accepted, redirect }) => {
                let accepted = accepted.min(total);
                self.last_send = Instant::now();
                self.retry_at = None;
                self.backoff.reset();

                let redirected = redirect.is_some();
                if let Some(redirect) = redirect {
                    self.follow_redirect(redirect);
                }

                if accepted == total {
                    tracing::debug!(accepted, buffered = self.buffer.len(), "Batch sent");
                    return SendResult::Sent { accepted };
                }

                let rest = batch.split_off(accepted);
                let requeued = rest.len();
                self.buffer.requeue_front(rest);
                if redirected {
                    self.resend_now = true;
                } else if accepted == 0 {
                    // Nothing taken, wait before resending the same batch.
                    self.arm_backoff();
                }
                tracing::debug!(accepted, requeued, "Batch partially accepted");
                SendResult::Partial { accepted, requeued }
            }
            Err(e) if e.is_permanent() => {
                self.last_send = Instant::now();
                tracing::error!(dropped = total, error = %e, "Batch rejected, dropping");
                SendResult::Rejected { dropped: total }
            }
            Err(_) => {
                self.buffer.requeue_front(batch);
                self.pool.next();
                self.arm_backoff();
                SendResult::Failed { requeued: total }
            }
        }
    }

    /// Run until `cancel` fires, then flush what is left within `shutdown_timeout`.
    pub async fn run(mut self, cancel: CancellationToken, shutdown_timeout: Duration) {
        tracing::info!(servers = %self.pool, "Sender started");

        loop {
            let wait = self.next_wakeup(Instant::now());
            let backing_off = self.retry_at.is_some();

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.buffer.notified(), if !backing_off => {}
                _ = tokio::time::sleep(wait) => {}
            }

            while self.should_send(Instant::now()) {
                if !matches!(self.flush().await, SendResult::Sent { .. }) {
                    break;
                }
            }
        }

        self.shutdown(shutdown_timeout).await;
        tracing::info!(remaining = self.buffer.len(), dropped = self.buffer.dropped(), "Sender stopped");
    }

    /// Final flush, bounded by `timeout`. Backoff is ignored.
    async fn shutdown(&mut self, timeout: Duration) {
        let drained = tokio::time::timeout(timeout, async {
            while !self.buffer.is_empty() {
                match self.flush().await {
                    SendResult::Sent { .. } | SendResult::Rejected { .. } => {}
                    SendResult::Partial { accepted, .. } if accepted > 0 => {}
                    _ => break,
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(remaining = self.buffer.len(), "Final flush timed out");
        }
    }

    fn should_send(&self, now: Instant) -> bool {
        if self.retry_at.is_some_and(|at| now < at) || self.buffer.is_empty() {
            return false;
        }
        self.resend_now
            || self.buffer.len() >= self.buffer.threshold()
            || now.duration_since(self.last_send) >= self.config.buffer_send
            || self.retry_at.is_some()
    }

    fn next_wakeup(&self, now: Instant) -> Duration {
        if self.resend_now {
            return Duration::ZERO;
        }
        if let Some(at) = self.retry_at {
            return at.saturating_duration_since(now);
        }
        let due = self.last_send + self.config.buffer_send;
        if due > now {
            due - now
        } else {
            self.config.buffer_send
        }
    }

    fn arm_backoff(&mut self) {
        let wait = self.backoff.next_wait();
        self.retry_at = Some(Instant::now() + wait);
        tracing::debug!(
            attempts = self.backoff.attempts(),
            wait = ?wait,
            next = ?self.pool.current(),
            "Send backoff armed"
        );
    }

    fn follow_redirect(&mut self, redirect: crate::sender::Redirect) {
        if redirect.reset {
            tracing::info!("Server revoked redirect");
            self.pool.reset();
            return;
        }
        let Some(address) = redirect.address else {
            return;
        };
        if self.pool.add_redirect(address.clone(), redirect.revision) {
            tracing::info!(address = %address, revision = redirect.revision, "Following server redirect");
        } else {
            tracing::debug!(address = %address, revision = redirect.revision, "Ignoring stale redirect");
        }
    }
}
