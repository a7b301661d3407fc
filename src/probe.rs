//! Single-slot holder for the latest RSSI estimate.
//!
//! The power chain overwrites the slot, the telemetry logger polls it. The value
//! lives in one atomic word so a reader can never see half of an update.

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};

#[derive(Debug, Clone, Default)]
pub struct RssiProbe {
    inner: Arc<Slot>,
}

#[derive(Debug, Default)]
struct Slot {
    /// Bits of an f32, zero bits being 0.0
    level: AtomicU32,
    updates: AtomicU64,
}

impl RssiProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the slot. Never blocks.
    pub fn publish(&self, value: f32) {
        self.inner.level.store(value.to_bits(), Ordering::Release);
        self.inner.updates.fetch_add(1, Ordering::Release);
    }

    /// Latest published value, or 0.0 before anything was published
    pub fn read(&self) -> f32 {
        f32::from_bits(self.inner.level.load(Ordering::Acquire))
    }

    /// How many values have been published so far
    pub fn updates(&self) -> u64 {
        self.inner.updates.load(Ordering::Acquire)
    }
}
