use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Up/down counter for live populations (connections, subscriptions).
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Monotonic counter for message and byte totals.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// In-process traffic meters. Plain atomics; scraping them is out of scope.
#[derive(Debug, Default)]
pub struct Meters {
    pub connections: Gauge,
    pub subscriptions: Gauge,
    pub in_msgs: Counter,
    pub out_msgs: Counter,
    pub in_bytes: Counter,
    pub out_bytes: Counter,
}
