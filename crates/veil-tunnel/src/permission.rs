//! Platform permission gate.
//!
//! Before the first tunnel can start, the host platform has to grant the
//! VPN capability. The grant flow is a prompt whose result arrives later
//! and may be denied; the gate serializes it:
//!
//! - at most one prompt is outstanding at a time - concurrent `request`
//!   calls share the same pending round instead of double-prompting
//! - a grant latches: later requests resolve immediately
//! - a pending round can be cancelled (disconnect during the prompt, or
//!   coordinator shutdown); waiters then observe `Cancelled`

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of a permission round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    /// Capability granted; tunnels may start
    Granted,
    /// User or platform refused the capability
    Denied,
    /// The round was torn down before a decision arrived
    Cancelled,
}

/// The platform side of the grant flow: shows the prompt and waits for
/// the user's decision.
#[async_trait]
pub trait PermissionBackend: Send + Sync {
    async fn request(&self) -> PermissionDecision;
}

/// Backend that grants immediately.
///
/// Desktop builds have no platform prompt, so the capability is implicitly
/// granted.
#[derive(Debug, Default)]
pub struct AutoGrantBackend;

#[async_trait]
impl PermissionBackend for AutoGrantBackend {
    async fn request(&self) -> PermissionDecision {
        PermissionDecision::Granted
    }
}

struct Round {
    id: u64,
    rx: watch::Receiver<Option<PermissionDecision>>,
    task: JoinHandle<()>,
}

struct GateInner {
    backend: Arc<dyn PermissionBackend>,
    granted: AtomicBool,
    next_round: AtomicU64,
    inflight: Mutex<Option<Round>>,
}

impl GateInner {
    /// Deregister a finished round, but only if it is still the current one
    /// (it may have been cancelled and replaced in the meantime).
    fn clear_round(&self, id: u64) {
        let mut inflight = self.inflight.lock().unwrap();
        if inflight.as_ref().is_some_and(|round| round.id == id) {
            *inflight = None;
        }
    }
}

/// Serializes the platform permission handshake.
pub struct PermissionGate {
    inner: Arc<GateInner>,
}

impl PermissionGate {
    /// Create a gate over the given backend
    pub fn new(backend: Arc<dyn PermissionBackend>) -> Self {
        Self {
            inner: Arc::new(GateInner {
                backend,
                granted: AtomicBool::new(false),
                next_round: AtomicU64::new(0),
                inflight: Mutex::new(None),
            }),
        }
    }

    /// Has the capability already been granted?
    pub fn is_granted(&self) -> bool {
        self.inner.granted.load(Ordering::Relaxed)
    }

    /// Request the capability.
    ///
    /// Resolves immediately if already granted. Otherwise joins the
    /// in-flight round, or starts a new one if none is pending.
    pub async fn request(&self) -> PermissionDecision {
        if self.is_granted() {
            return PermissionDecision::Granted;
        }

        let mut rx = {
            let mut inflight = self.inner.inflight.lock().unwrap();
            match inflight.as_ref() {
                Some(round) => {
                    debug!("joining in-flight permission round");
                    round.rx.clone()
                }
                None => {
                    let id = self.inner.next_round.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    let inner = self.inner.clone();
                    let task = tokio::spawn(async move {
                        let decision = inner.backend.request().await;
                        if decision == PermissionDecision::Granted {
                            inner.granted.store(true, Ordering::Relaxed);
                            info!("vpn capability granted");
                        } else {
                            warn!(?decision, "vpn capability not granted");
                        }
                        let _ = tx.send(Some(decision));
                        inner.clear_round(id);
                    });
                    *inflight = Some(Round {
                        id,
                        rx: rx.clone(),
                        task,
                    });
                    rx
                }
            }
        };

        loop {
            if let Some(decision) = *rx.borrow() {
                return decision;
            }
            if rx.changed().await.is_err() {
                // Round aborted before a decision was sent.
                let last = *rx.borrow();
                return last.unwrap_or(PermissionDecision::Cancelled);
            }
        }
    }

    /// Tear down the in-flight round, if any.
    ///
    /// Waiters observe [`PermissionDecision::Cancelled`]. A no-op when
    /// nothing is pending.
    pub fn cancel_pending(&self) {
        if let Some(round) = self.inner.inflight.lock().unwrap().take() {
            debug!("cancelling pending permission round");
            round.task.abort();
        }
    }
}
