//! Subscription data model and wire payload.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Identifier of a proxy node within the subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Connection details for a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMetadata {
    /// Proxy protocol (shadowsocks, vmess, trojan, ...)
    pub protocol: String,
    /// Server host
    pub address: String,
    /// Server port
    pub port: u16,
    /// Geographic location, when the panel reports one
    pub location: Option<String>,
}

impl NodeMetadata {
    /// `host:port` endpoint string
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// A proxy node from the subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub display_name: String,
    pub metadata: NodeMetadata,
}

/// Account info attached to the subscription.
///
/// Replaced wholesale on every refresh, never merged field by field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub email: String,
    /// Bytes consumed against the quota (upload + download)
    pub used_bytes: u64,
    /// Total quota in bytes
    pub quota_bytes: u64,
    /// When the subscription expires, if the panel reports it
    pub expires_at: Option<SystemTime>,
}

impl UserInfo {
    /// Fraction of the quota consumed, in `0.0..=1.0`
    pub fn quota_used_fraction(&self) -> f64 {
        if self.quota_bytes == 0 {
            return 0.0;
        }
        (self.used_bytes as f64 / self.quota_bytes as f64).min(1.0)
    }

    /// Bytes left before the quota is exhausted
    pub fn remaining_bytes(&self) -> u64 {
        self.quota_bytes.saturating_sub(self.used_bytes)
    }
}

/// Everything one fetch returns: the node list plus account info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionPayload {
    pub nodes: Vec<Node>,
    pub user: UserInfo,
}

/// Wire shape of the subscription document.
///
/// `expire_time` is unix seconds; `upload`/`download`/`total` are bytes.
#[derive(Debug, Deserialize)]
struct WireDocument {
    servers: Vec<WireServer>,
    user: WireUser,
}

#[derive(Debug, Deserialize)]
struct WireServer {
    id: u64,
    name: String,
    #[serde(rename = "type")]
    protocol: String,
    host: String,
    port: u16,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    email: String,
    upload: u64,
    download: u64,
    total: u64,
    #[serde(default)]
    expire_time: Option<u64>,
}

impl From<WireServer> for Node {
    fn from(server: WireServer) -> Self {
        Node {
            id: NodeId(server.id.to_string()),
            display_name: server.name,
            metadata: NodeMetadata {
                protocol: server.protocol,
                address: server.host,
                port: server.port,
                location: server.location,
            },
        }
    }
}

impl From<WireUser> for UserInfo {
    fn from(user: WireUser) -> Self {
        UserInfo {
            email: user.email,
            used_bytes: user.upload + user.download,
            quota_bytes: user.total,
            // Zero means no expiry on the wire
            expires_at: user
                .expire_time
                .filter(|secs| *secs > 0)
                .map(|secs| UNIX_EPOCH + Duration::from_secs(secs)),
        }
    }
}

/// Parse a subscription document body into a payload.
pub fn parse_payload(body: &[u8]) -> Result<SubscriptionPayload, crate::FetchError> {
    let doc: WireDocument =
        serde_json::from_slice(body).map_err(|e| crate::FetchError::Parse(e.to_string()))?;

    Ok(SubscriptionPayload {
        nodes: doc.servers.into_iter().map(Node::from).collect(),
        user: doc.user.into(),
    })
}
