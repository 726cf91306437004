//! Active check control loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::active::{RateLimitedFetcher, SharedRegistry};
use crate::buffer::{BufferElement, ResultBuffer};

/// Shortest sleep between ticks.
pub const MIN_TICK: Duration = Duration::from_secs(1);

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Metrics that were due.
    pub due: usize,
    /// Values appended to the buffer.
    pub produced: usize,
    /// Metrics whose fetch failed.
    pub failed: usize,
}

/// Single loop that runs due metrics and feeds the result buffer.
///
/// The same metric is never fetched concurrently with itself: metrics are
/// processed one after another within a tick, earliest next check first.
pub struct Scheduler {
    registry: SharedRegistry,
    fetcher: RateLimitedFetcher,
    buffer: Arc<ResultBuffer>,
    hostname: String,
    reload: Arc<Notify>,
    generation: u64,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("hostname", &self.hostname)
            .field("generation", &self.generation)
            .field("fetcher", &self.fetcher)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create a scheduler over a shared registry.
    pub fn new(
        registry: SharedRegistry,
        fetcher: RateLimitedFetcher,
        buffer: Arc<ResultBuffer>,
        hostname: impl Into<String>,
    ) -> Self {
        let generation = registry.read().generation();
        Self {
            registry,
            fetcher,
            buffer,
            hostname: hostname.into(),
            reload: Arc::new(Notify::new()),
            generation,
        }
    }

    /// Handle used to wake the loop after a registry reload.
    pub fn reload_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.reload)
    }

    /// Run every metric due at `now` (epoch seconds).
    ///
    /// Next checks are computed from `now`, not from the time the fetch
    /// finished, so slow sources do not make the schedule drift. A failed
    /// fetch still advances the next check by one interval and keeps the
    /// stored log offset.
    pub async fn tick(&mut self, now: i64) -> TickReport {
        let due = {
            let registry = self.registry.read();
            if registry.generation() != self.generation {
                self.generation = registry.generation();
                self.fetcher.retain_keys(|key| registry.get(key).is_some());
            }
            registry.list_due(now)
        };

        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };

        for metric in due {
            let key = metric.key.as_str();
            let last_log_size = match self.fetcher.fetch(&metric).await {
                Ok(fetched) => {
                    let clock = Utc::now().timestamp();
                    report.produced += fetched.values.len();
                    for value in fetched.values {
                        self.buffer
                            .append(BufferElement::from_fetched(&self.hostname, key, value, clock));
                    }
                    fetched.last_log_size
                }
                Err(e) => {
                    tracing::warn!(key, error = %e, "Metric fetch failed");
                    report.failed += 1;
                    metric.last_log_size
                }
            };

            self.registry.write().mark_checked(key, now, last_log_size);
        }

        report
    }

    /// Run until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(hostname = %self.hostname, "Scheduler started");

        loop {
            let now = Utc::now().timestamp();
            let report = self.tick(now).await;
            if report.due > 0 {
                tracing::debug!(
                    due = report.due,
                    produced = report.produced,
                    failed = report.failed,
                    buffered = self.buffer.len(),
                    "Scheduler tick"
                );
            }

            let delay = {
                let registry = self.registry.read();
                let current = Utc::now();
                tick_delay(
                    current.timestamp(),
                    current.timestamp_subsec_millis(),
                    registry.next_due(),
                    registry.min_refresh(),
                )
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.reload.notified() => {
                    tracing::debug!("Scheduler woken by reload");
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!("Scheduler stopped");
    }
}

/// Time until the next tick.
///
/// Sleeps until the second boundary at which the earliest metric becomes
/// due, at least until the next boundary and at most the smallest refresh
/// interval. Ticks therefore happen at most once per [`MIN_TICK`].
fn tick_delay(now: i64, subsec_millis: u32, next_due: Option<i64>, min_refresh: Option<u32>) -> Duration {
    let max = i64::from(min_refresh.unwrap_or(1).max(1));
    let seconds = next_due.map_or(1, |due| due - now).clamp(1, max) as u64;
    let into_second = Duration::from_millis(u64::from(subsec_millis.min(999)));

    (MIN_TICK * seconds as u32).saturating_sub(into_second)
}
