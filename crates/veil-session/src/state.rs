//! Connection state and the published session snapshot.

use std::time::{Duration, Instant};
use veil_subscription::{Node, NodeId, UserInfo};
use veil_tunnel::TrafficSnapshot;

/// The session's connection state.
///
/// Owned exclusively by the coordinator; only its transition function
/// mutates it. `Error` is never a resting state: it is published so the
/// failure is observable, then immediately followed by `Disconnected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No tunnel, no attempt in flight
    Disconnected,
    /// Waiting for the platform permission prompt
    AwaitingPermission,
    /// Permission granted, tunnel starting
    Connecting,
    /// Tunnel up and forwarding
    Connected,
    /// Tunnel stopping
    Disconnecting,
    /// An attempt or session failed; transient
    Error(String),
}

impl ConnectionState {
    /// Is the tunnel usable?
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Is an attempt or teardown in flight?
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            ConnectionState::AwaitingPermission
                | ConnectionState::Connecting
                | ConnectionState::Disconnecting
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::AwaitingPermission => write!(f, "awaiting-permission"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Immutable point-in-time view of the whole session.
///
/// Observers receive these in publication order; `revision` increases by
/// one per publication, so a stale snapshot can never masquerade as a
/// newer one.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Publication counter, strictly increasing
    pub revision: u64,
    /// Connection state at publication time
    pub state: ConnectionState,
    /// Traffic totals for the current session
    pub traffic: TrafficSnapshot,
    /// Account info (absent until the first successful refresh)
    pub user: Option<UserInfo>,
    /// Node list from the last successful refresh
    pub nodes: Vec<Node>,
    /// Currently selected node
    pub selected_node_id: Option<NodeId>,
    /// Node the running tunnel was started with
    pub active_node_id: Option<NodeId>,
    /// When the current session reached `Connected`
    pub connected_at: Option<Instant>,
    /// Most recent unsurfaced failure
    pub last_error: Option<String>,
}

impl SessionSnapshot {
    /// Does the active tunnel match the current selection?
    ///
    /// `false` means a reconnect is needed to apply the selection. Always
    /// `true` when no tunnel is active.
    pub fn selection_in_sync(&self) -> bool {
        match &self.active_node_id {
            None => true,
            Some(active) => self.selected_node_id.as_ref() == Some(active),
        }
    }

    /// How long the current session has been connected
    pub fn uptime(&self) -> Option<Duration> {
        self.connected_at.map(|at| at.elapsed())
    }
}
