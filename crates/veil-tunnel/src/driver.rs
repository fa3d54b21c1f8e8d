//! Tunnel driver boundary.
//!
//! The driver owns the actual packet-forwarding process (TUN device,
//! userspace stack, child process - whatever the platform provides). The
//! session core only sees this trait: start with a config, receive traffic
//! samples while running, stop via the returned handle.

use crate::traffic::TrafficSample;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Parameters for starting the tunnel.
///
/// All fields are optional: a driver without a node routes through its
/// default outbound.
#[derive(Debug, Clone, Default)]
pub struct TunnelConfig {
    /// Identifier of the proxy node to route through
    pub node_id: Option<String>,
    /// Display name of the node (for logs only)
    pub node_name: Option<String>,
    /// Remote endpoint, `host:port`
    pub endpoint: Option<String>,
}

/// Handle to a running tunnel.
///
/// Owned exclusively by the session coordinator and consumed by
/// [`TunnelDriver::stop`].
#[derive(Debug)]
pub struct TunnelHandle {
    id: u64,
}

impl TunnelHandle {
    /// Create a handle with the given driver-assigned id
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    /// Driver-assigned id of this tunnel instance
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// A successfully started tunnel: the stop handle plus the inbound stream
/// of traffic samples. The stream closing while the session is still live
/// means the tunnel died underneath us.
pub struct StartedTunnel {
    /// Handle for stopping this tunnel
    pub handle: TunnelHandle,
    /// Traffic samples emitted while the tunnel runs
    pub samples: mpsc::Receiver<TrafficSample>,
}

/// Errors from starting the tunnel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StartError {
    #[error("invalid tunnel config: {0}")]
    InvalidConfig(String),

    #[error("tunnel failed to start: {0}")]
    Failed(String),

    #[error("tunnel start timed out")]
    Timeout,
}

/// The platform tunnel boundary.
#[async_trait]
pub trait TunnelDriver: Send + Sync {
    /// Start the tunnel. Resolves once the tunnel is forwarding traffic.
    async fn start(&self, config: TunnelConfig) -> Result<StartedTunnel, StartError>;

    /// Stop a running tunnel. Consumes the handle; resolves once the
    /// tunnel process has released its resources.
    async fn stop(&self, handle: TunnelHandle);
}

/// Driver that forwards nothing.
///
/// Starts instantly, emits no traffic, and keeps the sample stream open
/// until stopped. Used by the binary in development and by integration
/// tests that only care about lifecycle.
#[derive(Debug, Default)]
pub struct NullDriver {
    next_id: AtomicU64,
    running: Mutex<HashMap<u64, mpsc::Sender<TrafficSample>>>,
}

impl NullDriver {
    /// Create a new null driver
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tunnels currently running
    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }
}

#[async_trait]
impl TunnelDriver for NullDriver {
    async fn start(&self, config: TunnelConfig) -> Result<StartedTunnel, StartError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(64);

        // Keep the sender alive so the sample stream stays open until stop.
        self.running.lock().unwrap().insert(id, tx);

        info!(
            id,
            node = config.node_name.as_deref().unwrap_or("<default>"),
            "null tunnel started"
        );

        Ok(StartedTunnel {
            handle: TunnelHandle::new(id),
            samples: rx,
        })
    }

    async fn stop(&self, handle: TunnelHandle) {
        self.running.lock().unwrap().remove(&handle.id());
        debug!(id = handle.id(), "null tunnel stopped");
    }
}
