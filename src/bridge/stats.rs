use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Forwarding counters shared by both pumps
#[derive(Debug, Default)]
pub struct BridgeStats {
    to_network: AtomicU64,
    to_device: AtomicU64,
    filtered: AtomicU64,
    dropped: AtomicU64,
    partial_writes: AtomicU64,
    started_at: Mutex<Option<DateTime<Local>>>,
}

/// Point-in-time copy of [`BridgeStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub to_network: u64,
    pub to_device: u64,
    pub filtered: u64,
    pub dropped: u64,
    pub partial_writes: u64,
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zeroes the counters and stamps the start time.
    pub fn reset(&self) {
        for counter in [
            &self.to_network,
            &self.to_device,
            &self.filtered,
            &self.dropped,
            &self.partial_writes,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
        if let Ok(mut started) = self.started_at.lock() {
            *started = Some(Local::now());
        }
    }

    pub fn record_to_network(&self) {
        self.to_network.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_to_device(&self) {
        self.to_device.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partial_write(&self) {
        self.partial_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.started_at.lock().ok().and_then(|s| *s)
    }

    /// Time since the last start, in whole seconds.
    pub fn uptime_secs(&self) -> i64 {
        self.started_at()
            .map(|t| (Local::now() - t).num_seconds())
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            to_network: self.to_network.load(Ordering::Relaxed),
            to_device: self.to_device.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            partial_writes: self.partial_writes.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to network, {} to device, {} filtered, {} dropped, {} partial writes",
            self.to_network, self.to_device, self.filtered, self.dropped, self.partial_writes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_reset() {
        let stats = BridgeStats::new();
        assert!(stats.started_at().is_none());

        stats.record_to_network();
        stats.record_to_network();
        stats.record_partial_write();
        assert_eq!(stats.snapshot().to_network, 2);
        assert_eq!(stats.snapshot().partial_writes, 1);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
        assert!(stats.started_at().is_some());
        assert!(stats.uptime_secs() >= 0);
    }

    #[test]
    fn test_snapshot_display() {
        let stats = BridgeStats::new();
        stats.record_filtered();
        assert_eq!(
            stats.snapshot().to_string(),
            "0 to network, 0 to device, 1 filtered, 0 dropped, 0 partial writes"
        );
    }
}
