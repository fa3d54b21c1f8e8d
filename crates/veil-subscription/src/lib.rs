//! veil-subscription - Subscription Boundary
//!
//! A subscription is a remotely hosted document describing the proxy nodes
//! an account may use plus the account's quota. This crate owns:
//!
//! - the node/user data model ([`Node`], [`UserInfo`])
//! - the wire payload and its JSON parsing
//! - [`SubscriptionFetcher`], the network boundary, with a hyper + rustls
//!   implementation ([`HttpFetcher`])
//! - [`SubscriptionStore`], the in-memory holder for the current URL,
//!   node list, account info and node selection
//!
//! The wire protocol itself is not owned here; the payload shape follows
//! the upstream panel's JSON and is replaced wholesale on every refresh.

mod fetch;
mod store;
mod types;

pub use fetch::{FetchError, FetcherConfig, HttpFetcher, SubscriptionFetcher};
pub use store::SubscriptionStore;
pub use types::{Node, NodeId, NodeMetadata, SubscriptionPayload, UserInfo, parse_payload};
