//! Traffic accounting for an active tunnel session.
//!
//! Samples arrive from the tunnel's execution context while reads come from
//! the command side, so accumulation is lock-free (a pair of atomics).
//! Counters are monotone within a session and reset when a new session
//! reaches the connected state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A single upload/download delta reported by the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSample {
    /// Bytes uploaded since the previous sample
    pub upload_delta: u64,
    /// Bytes downloaded since the previous sample
    pub download_delta: u64,
}

impl TrafficSample {
    /// Create a new sample
    pub fn new(upload_delta: u64, download_delta: u64) -> Self {
        Self {
            upload_delta,
            download_delta,
        }
    }
}

/// Point-in-time traffic totals for the current session.
#[derive(Debug, Clone, Copy)]
pub struct TrafficSnapshot {
    /// Total bytes uploaded this session
    pub uploaded_bytes: u64,
    /// Total bytes downloaded this session
    pub downloaded_bytes: u64,
    /// When this snapshot was taken
    pub sampled_at: Instant,
}

impl TrafficSnapshot {
    /// A snapshot with zeroed counters
    pub fn zero() -> Self {
        Self {
            uploaded_bytes: 0,
            downloaded_bytes: 0,
            sampled_at: Instant::now(),
        }
    }

    /// Total bytes in both directions
    pub fn total_bytes(&self) -> u64 {
        self.uploaded_bytes + self.downloaded_bytes
    }

    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "TX: {:.2}MB, RX: {:.2}MB",
            self.uploaded_bytes as f64 / (1024.0 * 1024.0),
            self.downloaded_bytes as f64 / (1024.0 * 1024.0),
        )
    }
}

/// Thread-safe upload/download accumulator.
///
/// `add` is called from the tunnel event pump; `current` and `reset` are
/// called from the command side.
#[derive(Debug, Default)]
pub struct TrafficCounter {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
}

impl TrafficCounter {
    /// Create a counter with zeroed totals
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero both counters (new session starting)
    pub fn reset(&self) {
        self.uploaded.store(0, Ordering::Relaxed);
        self.downloaded.store(0, Ordering::Relaxed);
    }

    /// Fold a sample's deltas into the totals
    pub fn add(&self, upload_delta: u64, download_delta: u64) {
        self.uploaded.fetch_add(upload_delta, Ordering::Relaxed);
        self.downloaded.fetch_add(download_delta, Ordering::Relaxed);
    }

    /// Take a snapshot of the current totals
    pub fn current(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            uploaded_bytes: self.uploaded.load(Ordering::Relaxed),
            downloaded_bytes: self.downloaded.load(Ordering::Relaxed),
            sampled_at: Instant::now(),
        }
    }
}
