//! veil-session - VPN Session Lifecycle Coordinator
//!
//! The single owner of connection state. Mediates the platform permission
//! grant, drives tunnel start/stop through the driver boundary, folds
//! asynchronous events (permission results, start/stop confirmations,
//! traffic samples, subscription refreshes) into one consistent view, and
//! publishes that view as immutable snapshots to any number of observers.
//!
//! # Architecture
//!
//! ```text
//!  commands                 events
//!  (connect, disconnect,    (permission result, tunnel started/stopped,
//!   refresh, select)         traffic samples, fetch results)
//!        │                        │
//!        ▼                        ▼
//!  ┌──────────────────────────────────────┐
//!  │  SessionCoordinator (single mutex)   │
//!  │  ConnectionState + epoch + revision  │
//!  └──────────────────┬───────────────────┘
//!                     │ broadcast
//!                     ▼
//!            SessionSnapshot stream (observe)
//! ```
//!
//! Commands return immediately; results manifest as later snapshots.

mod config;
mod coordinator;
mod error;
mod state;

pub use config::SessionConfig;
pub use coordinator::{Observer, SessionCoordinator};
pub use error::SessionError;
pub use state::{ConnectionState, SessionSnapshot};

// The platform boundary types observers and embedders need.
pub use veil_subscription::{Node, NodeId, NodeMetadata, SubscriptionPayload, UserInfo};
pub use veil_tunnel::{TrafficSample, TrafficSnapshot};
