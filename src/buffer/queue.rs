//! Bounded FIFO with oldest-drop overflow.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::buffer::BufferElement;

/// Bounded, insertion-ordered buffer of [`BufferElement`]s.
///
/// When full, an append evicts the oldest element. Every operation runs in a
/// single critical section, so concurrent appends and drains never observe a
/// partially updated buffer. Evictions are counted in [`dropped`](Self::dropped).
#[derive(Debug)]
pub struct ResultBuffer {
    items: Mutex<VecDeque<BufferElement>>,
    capacity: usize,
    threshold: usize,
    dropped: AtomicU64,
    ready: Notify,
}

impl ResultBuffer {
    /// Create a buffer holding at most `capacity` elements (at least 1).
    ///
    /// The drainer is notified once the buffer holds `capacity` elements;
    /// see [`with_threshold`](Self::with_threshold).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            threshold: capacity,
            dropped: AtomicU64::new(0),
            ready: Notify::new(),
        }
    }

    /// Notify the drainer once the buffer holds `threshold` elements.
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold.clamp(1, self.capacity);
        self
    }

    /// Append one element.
    ///
    /// Returns `false` when the buffer was full and its oldest element was
    /// dropped to make room.
    pub fn append(&self, element: BufferElement) -> bool {
        let (len, evicted) = {
            let mut items = self.items.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front().is_some()
            } else {
                false
            };
            items.push_back(element);
            (items.len(), evicted)
        };

        if evicted {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(capacity = self.capacity, dropped = total, "Buffer full, dropped oldest element");
        }
        if len >= self.threshold {
            self.ready.notify_one();
        }
        !evicted
    }

    /// Remove and return up to `max` elements from the front, in FIFO order.
    pub fn drain(&self, max: usize) -> Vec<BufferElement> {
        let mut items = self.items.lock();
        let n = max.min(items.len());
        items.drain(..n).collect()
    }

    /// Put elements back at the front, keeping their relative order.
    ///
    /// If this overflows the buffer, the oldest elements are evicted as with
    /// [`append`](Self::append). Returns the number of elements evicted.
    pub fn requeue_front(&self, elements: Vec<BufferElement>) -> usize {
        if elements.is_empty() {
            return 0;
        }

        let (len, evicted) = {
            let mut items = self.items.lock();
            for element in elements.into_iter().rev() {
                items.push_front(element);
            }
            let evicted = items.len().saturating_sub(self.capacity);
            items.drain(..evicted);
            (items.len(), evicted)
        };

        if evicted > 0 {
            let total = self.dropped.fetch_add(evicted as u64, Ordering::Relaxed) + evicted as u64;
            tracing::debug!(evicted, dropped = total, "Buffer overflow on requeue, dropped oldest elements");
        }
        if len >= self.threshold {
            self.ready.notify_one();
        }
        evicted
    }

    /// Count `n` elements taken out and then discarded by a consumer.
    pub fn record_dropped(&self, n: usize) {
        if n > 0 {
            self.dropped.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    /// Remove every element and count it as dropped. Returns how many.
    pub fn discard_all(&self) -> usize {
        let discarded = self.items.lock().drain(..).count();
        self.record_dropped(discarded);
        discarded
    }

    /// Number of buffered elements.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Maximum number of elements.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Size at which the drainer is notified.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Total number of elements evicted by overflow or discarded.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait until the send threshold is crossed.
    ///
    /// A crossing that happens while nobody waits is remembered, so the next
    /// call returns immediately.
    pub async fn notified(&self) {
        self.ready.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn element(value: &str) -> BufferElement {
        BufferElement::new("host", "key", value, 0)
    }

    fn values(items: &[BufferElement]) -> Vec<&str> {
        items.iter().map(|e| e.value.as_str()).collect()
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let buffer = ResultBuffer::new(3);
        assert!(buffer.append(element("A")));
        assert!(buffer.append(element("B")));
        assert!(buffer.append(element("C")));
        assert!(!buffer.append(element("D")));

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.dropped(), 1);
        assert_eq!(values(&buffer.drain(10)), vec!["B", "C", "D"]);
    }

    #[test]
    fn test_drain_is_fifo_and_bounded() {
        let buffer = ResultBuffer::new(10);
        for v in ["1", "2", "3", "4"] {
            buffer.append(element(v));
        }

        assert_eq!(values(&buffer.drain(3)), vec!["1", "2", "3"]);
        assert_eq!(values(&buffer.drain(3)), vec!["4"]);
        assert!(buffer.drain(3).is_empty());
    }

    #[test]
    fn test_requeue_front_preserves_order() {
        let buffer = ResultBuffer::new(10);
        for v in ["1", "2", "3", "4", "5"] {
            buffer.append(element(v));
        }
        let batch = buffer.drain(3);
        buffer.append(element("6"));

        // Items 2 and 3 were not acknowledged.
        assert_eq!(buffer.requeue_front(batch[1..].to_vec()), 0);
        assert_eq!(values(&buffer.drain(10)), vec!["2", "3", "4", "5", "6"]);
    }

    #[test]
    fn test_requeue_front_overflow_drops_oldest() {
        let buffer = ResultBuffer::new(3);
        for v in ["1", "2", "3"] {
            buffer.append(element(v));
        }
        let batch = buffer.drain(2);
        buffer.append(element("4"));
        buffer.append(element("5"));

        assert_eq!(buffer.requeue_front(batch), 2);
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(values(&buffer.drain(10)), vec!["3", "4", "5"]);
    }

    #[test]
    fn test_discard_all_counts_dropped() {
        let buffer = ResultBuffer::new(10);
        for v in ["1", "2", "3"] {
            buffer.append(element(v));
        }
        buffer.record_dropped(2);

        assert_eq!(buffer.discard_all(), 3);
        assert!(buffer.is_empty());
        assert_eq!(buffer.dropped(), 5);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let buffer = ResultBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
        buffer.append(element("A"));
        buffer.append(element("B"));
        assert_eq!(values(&buffer.drain(5)), vec!["B"]);
    }

    #[tokio::test]
    async fn test_notified_on_threshold() {
        let buffer = Arc::new(ResultBuffer::new(10).with_threshold(2));

        buffer.append(element("A"));
        let pending = tokio::time::timeout(Duration::from_millis(20), buffer.notified()).await;
        assert!(pending.is_err());

        buffer.append(element("B"));
        tokio::time::timeout(Duration::from_secs(1), buffer.notified())
            .await
            .unwrap();
    }

    #[test]
    fn test_concurrent_appends_and_drains_lose_nothing() {
        let buffer = Arc::new(ResultBuffer::new(10_000));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        buffer.append(element(&format!("{p}-{i}")));
                    }
                })
            })
            .collect();

        let mut drained = Vec::new();
        while producers.iter().any(|h| !h.is_finished()) {
            drained.extend(buffer.drain(64));
        }
        for handle in producers {
            handle.join().unwrap();
        }
        drained.extend(buffer.drain(usize::MAX));

        assert_eq!(drained.len(), 2000);
        assert_eq!(buffer.dropped(), 0);
        let mut unique: Vec<_> = drained.iter().map(|e| e.value.clone()).collect();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 2000);
    }
}
