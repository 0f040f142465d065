//! Atomic instruments behind [`GridMetrics`](super::GridMetrics).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Events observed since the node started. Never decreases.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Count one event.
    pub fn inc(&self) {
        self.inc_by(1);
    }

    /// Count `n` events at once.
    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Events counted so far.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Size of a set the node currently holds, overwritten on every change.
#[derive(Debug, Default)]
pub struct Gauge(AtomicUsize);

impl Gauge {
    /// Replace the recorded size.
    pub fn set(&self, len: usize) {
        self.0.store(len, Ordering::Relaxed);
    }

    /// Last recorded size.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruments() {
        let chunks = Counter::default();
        chunks.inc();
        chunks.inc_by(4);
        assert_eq!(chunks.get(), 5);

        let open = Gauge::default();
        open.set(3);
        open.set(1);
        assert_eq!(open.get(), 1);
    }
}
