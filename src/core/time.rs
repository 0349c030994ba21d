use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Clock abstraction so key issue/expiry paths stay deterministic in tests.
pub trait Clock: Send + Sync {
    /// Seconds since the unix epoch, truncated to the 32-bit space the key
    /// codec encodes.
    fn unix_now(&self) -> u32;
}

/// System-backed clock used by the running broker.
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_now(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for expiry tests.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU32>,
}

impl ManualClock {
    pub fn at(now: u32) -> Self {
        Self {
            now: Arc::new(AtomicU32::new(now)),
        }
    }

    pub fn advance(&self, secs: u32) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn unix_now(&self) -> u32 {
        self.now.load(Ordering::SeqCst)
    }
}
