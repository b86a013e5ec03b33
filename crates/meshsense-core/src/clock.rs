//! Time synchronization
//!
//! Nodes wake and sleep independently, so there is no shared wall clock.
//! The gateway periodically fetches true network time from an external
//! source and floods it mesh-wide; every other node keeps a signed offset
//! from its own uptime. A node that has never heard a sync runs on raw
//! uptime — callers tolerate unsynchronized timestamps early in life.
//!
//! Syncs are unreliable by design: a missed one is corrected by the next,
//! bounding clock error to roughly the redistribution interval.

use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Per-node logical clock: local uptime plus a signed offset.
#[derive(Debug, Clone, Default)]
pub struct NetworkClock {
    offset_ms: i64,
    last_sync_timestamp: Option<u64>,
}

impl NetworkClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Approximate network time for a given local uptime.
    pub fn now(&self, uptime_ms: u64) -> u64 {
        (uptime_ms as i64).saturating_add(self.offset_ms).max(0) as u64
    }

    /// Whether at least one sync has been applied.
    pub fn is_synchronized(&self) -> bool {
        self.last_sync_timestamp.is_some()
    }

    /// Apply a received sync. The higher embedded timestamp wins;
    /// out-of-order syncs are discarded. Returns whether it was applied.
    pub fn apply_sync(&mut self, sync_timestamp_ms: u64, uptime_ms: u64) -> bool {
        if let Some(last) = self.last_sync_timestamp {
            if sync_timestamp_ms <= last {
                debug!(sync_timestamp_ms, last, "discarding out-of-order time sync");
                return false;
            }
        }
        self.offset_ms = sync_timestamp_ms as i64 - uptime_ms as i64;
        self.last_sync_timestamp = Some(sync_timestamp_ms);
        debug!(offset_ms = self.offset_ms, "applied time sync");
        true
    }

    /// Current offset, for diagnostics.
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }
}

/// External network-time source the gateway consults, e.g. an NTP client.
pub trait NetworkTimeSource {
    /// Current network time in milliseconds since the Unix epoch, or
    /// `None` if the source is temporarily unreachable.
    fn network_time_ms(&mut self) -> Option<u64>;
}

/// Time source backed by the host system clock.
#[derive(Debug, Default)]
pub struct SystemTimeSource;

impl NetworkTimeSource for SystemTimeSource {
    fn network_time_ms(&mut self) -> Option<u64> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_millis() as u64)
    }
}

/// Fixed-epoch source advancing with the caller's clock, for simulation.
#[derive(Debug, Clone)]
pub struct FixedTimeSource {
    epoch_ms: u64,
}

impl FixedTimeSource {
    pub fn new(epoch_ms: u64) -> Self {
        Self { epoch_ms }
    }

    /// Source reading for a given simulated uptime.
    pub fn at(&self, uptime_ms: u64) -> u64 {
        self.epoch_ms + uptime_ms
    }
}
