//! Coordinator tuning knobs.

use std::time::Duration;

/// Session coordinator configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Minimum spacing between traffic-only snapshot publications.
    ///
    /// Samples are always folded into the counters; only the publication
    /// is coalesced. State transitions are never coalesced.
    pub traffic_publish_interval: Duration,
    /// Refresh the subscription on this interval, when set
    pub auto_refresh: Option<Duration>,
    /// Broadcast channel depth for observers
    pub broadcast_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            traffic_publish_interval: Duration::from_millis(250),
            auto_refresh: None,
            broadcast_capacity: 256,
        }
    }
}
