//! In this module, we implement the monitoring counters for the streaming pipeline.
//! Every thread bumps its own counters; the telemetry loop and shutdown path read
//! a snapshot and log it.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct PipelineStats {
    blocks_captured: AtomicU64,
    samples_captured: AtomicU64,
    capture_overflows: AtomicU64,
    audio_drops: AtomicU64,
    power_drops: AtomicU64,
    rssi_published: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub blocks_captured: u64,
    pub samples_captured: u64,
    /// Blocks the capture thread dropped because the ring buffer was full
    pub capture_overflows: u64,
    /// Channel blocks the audio branch missed
    pub audio_drops: u64,
    /// Channel blocks the power branch missed
    pub power_drops: u64,
    pub rssi_published: u64,
}

impl PipelineStats {
    pub fn captured(&self, samples: usize) {
        self.blocks_captured.fetch_add(1, Ordering::Relaxed);
        self.samples_captured
            .fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn capture_overflow(&self) {
        // Only warn on the first one, this can happen a lot under load
        if self.capture_overflows.fetch_add(1, Ordering::Relaxed) == 0 {
            warn!("Capture ring buffer full, dropping blocks");
        }
    }

    pub fn audio_drop(&self) {
        self.audio_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn power_drop(&self) {
        if self.power_drops.fetch_add(1, Ordering::Relaxed) == 0 {
            warn!("Power estimator fell behind, RSSI windows will be short of samples");
        }
    }

    pub fn rssi_published(&self, n: usize) {
        self.rssi_published.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            blocks_captured: self.blocks_captured.load(Ordering::Relaxed),
            samples_captured: self.samples_captured.load(Ordering::Relaxed),
            capture_overflows: self.capture_overflows.load(Ordering::Relaxed),
            audio_drops: self.audio_drops.load(Ordering::Relaxed),
            power_drops: self.power_drops.load(Ordering::Relaxed),
            rssi_published: self.rssi_published.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    pub fn log_debug(&self) {
        debug!(
            blocks = self.blocks_captured,
            overflows = self.capture_overflows,
            audio_drops = self.audio_drops,
            power_drops = self.power_drops,
            rssi = self.rssi_published,
            "Pipeline stats"
        );
    }

    pub fn log_summary(&self) {
        info!(
            samples = self.samples_captured,
            blocks = self.blocks_captured,
            overflows = self.capture_overflows,
            audio_drops = self.audio_drops,
            power_drops = self.power_drops,
            rssi = self.rssi_published,
            "Pipeline finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = PipelineStats::default();
        stats.captured(8192);
        stats.captured(100);
        stats.capture_overflow();
        stats.audio_drop();
        stats.rssi_published(2);
        let snap = stats.snapshot();
        assert_eq!(snap.blocks_captured, 2);
        assert_eq!(snap.samples_captured, 8292);
        assert_eq!(snap.capture_overflows, 1);
        assert_eq!(snap.audio_drops, 1);
        assert_eq!(snap.power_drops, 0);
        assert_eq!(snap.rssi_published, 2);
    }
}
