//! veil-tunnel - Platform Tunnel Boundary
//!
//! Everything the session core needs from the host platform:
//!
//! - **Driver boundary**: the [`TunnelDriver`] trait abstracts the actual
//!   packet-forwarding process (start/stop plus a traffic sample stream).
//!   The real driver lives outside this workspace; [`NullDriver`] is the
//!   development stand-in.
//! - **Traffic accounting**: [`TrafficCounter`] accumulates upload/download
//!   byte counts arriving from the driver's execution context.
//! - **Permission gate**: [`PermissionGate`] wraps the platform's
//!   grant-VPN-capability handshake, collapsing concurrent prompts into one.

mod driver;
mod permission;
mod traffic;

pub use driver::{NullDriver, StartError, StartedTunnel, TunnelConfig, TunnelDriver, TunnelHandle};
pub use permission::{AutoGrantBackend, PermissionBackend, PermissionDecision, PermissionGate};
pub use traffic::{TrafficCounter, TrafficSample, TrafficSnapshot};
