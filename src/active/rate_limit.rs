//! Rolling one-second line window.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(1);

/// Tracks lines emitted by one metric during the last second.
#[derive(Debug, Default)]
pub struct LineWindow {
    emitted: VecDeque<(Instant, usize)>,
    total: usize,
}

impl LineWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines that may still be emitted at `now` under `limit`.
    pub fn allowance(&mut self, limit: u32, now: Instant) -> usize {
        self.expire(now);
        (limit as usize).saturating_sub(self.total)
    }

    /// Record `lines` emitted at `now`.
    pub fn record(&mut self, lines: usize, now: Instant) {
        if lines == 0 {
            return;
        }
        self.emitted.push_back((now, lines));
        self.total += lines;
    }

    /// Lines emitted within the window ending at `now`.
    pub fn in_window(&mut self, now: Instant) -> usize {
        self.expire(now);
        self.total
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(at, lines)) = self.emitted.front() {
            if now.saturating_duration_since(at) < WINDOW {
                break;
            }
            self.emitted.pop_front();
            self.total -= lines;
        }
    }
}
