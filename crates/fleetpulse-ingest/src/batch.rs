//! Batch Accumulation
//!
//! Collects entries between log reads so that one history write covers many
//! of them.
//!
//! ```text
//! read_new ──► push ──► ┌────────────────────────┐
//! read_new ──► push ──► │ BatchAccumulator       │ ──► drain ──► persist ──► ack
//! claim    ──► push ──► │  items: Vec<T>         │
//!                       │  opened_at: Instant    │
//!                       └────────────────────────┘
//! ```
//!
//! ## Flush Triggers
//!
//! A batch is due when ANY of these hold:
//! - **Size**: it holds `max_size` items
//! - **Time**: its oldest item has waited `max_age`
//! - **Manual**: the owner drains it (shutdown)
//!
//! The age clock starts at the first push, not at construction or at the
//! previous drain, so an idle worker never flushes an empty batch.

use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
pub struct BatchAccumulator<T> {
    items: Vec<T>,
    opened_at: Option<Instant>,
    max_size: usize,
    max_age: Duration,
}

impl<T> BatchAccumulator<T> {
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        let max_size = max_size.max(1);
        Self {
            items: Vec::with_capacity(max_size),
            opened_at: None,
            max_size,
            max_age,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.items.push(item);
        trace!(items = self.items.len(), "Appended to batch");
    }

    pub fn extend<I: IntoIterator<Item = T>>(&mut self, items: I) {
        for item in items {
            self.push(item);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Room left before the size trigger fires.
    pub fn remaining(&self) -> usize {
        self.max_size.saturating_sub(self.items.len())
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_size
    }

    pub fn should_flush(&self) -> bool {
        if self.is_full() {
            return true;
        }
        self.opened_at
            .map_or(false, |opened| opened.elapsed() >= self.max_age)
    }

    /// Time until the age trigger fires; `None` while empty.
    pub fn time_until_due(&self) -> Option<Duration> {
        self.opened_at
            .map(|opened| self.max_age.saturating_sub(opened.elapsed()))
    }

    pub fn drain(&mut self) -> Vec<T> {
        self.opened_at = None;
        std::mem::take(&mut self.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_on_size() {
        let mut batch = BatchAccumulator::new(3, Duration::from_secs(60));
        batch.push(1);
        batch.push(2);
        assert!(!batch.should_flush());
        assert_eq!(batch.remaining(), 1);
        batch.push(3);
        assert!(batch.should_flush());
        assert_eq!(batch.drain(), vec![1, 2, 3]);
        assert!(batch.is_empty());
        assert!(!batch.should_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_age() {
        let mut batch = BatchAccumulator::new(100, Duration::from_millis(500));
        assert_eq!(batch.time_until_due(), None);

        batch.push("a");
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!batch.should_flush());
        assert_eq!(batch.time_until_due(), Some(Duration::from_millis(300)));

        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(batch.should_flush());
        assert_eq!(batch.time_until_due(), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_age_starts_at_first_push() {
        let mut batch: BatchAccumulator<u8> = BatchAccumulator::new(100, Duration::from_millis(500));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!batch.should_flush());

        batch.push(1);
        assert!(!batch.should_flush());
        batch.drain();
        tokio::time::advance(Duration::from_secs(10)).await;
        batch.extend([2, 3]);
        assert!(!batch.should_flush());
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_zero_size_is_clamped() {
        let mut batch = BatchAccumulator::new(0, Duration::from_secs(1));
        batch.push(());
        assert!(batch.is_full());
    }
}
