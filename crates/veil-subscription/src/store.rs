//! In-memory subscription state.
//!
//! Holds the current URL, node list, account info and node selection.
//! Refreshes replace the node list and account info wholesale; the
//! selection survives a refresh only if the selected node is still in the
//! new list.

use crate::types::{Node, NodeId, SubscriptionPayload, UserInfo};
use std::time::Instant;
use tracing::debug;
use url::Url;

/// Current subscription data. Plain state, no I/O.
#[derive(Debug, Default)]
pub struct SubscriptionStore {
    url: Option<Url>,
    nodes: Vec<Node>,
    user: Option<UserInfo>,
    selected: Option<NodeId>,
    last_refreshed: Option<Instant>,
}

impl SubscriptionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// The URL of the last applied refresh
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// Current node list, in subscription order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Current account info (absent until the first successful refresh)
    pub fn user(&self) -> Option<&UserInfo> {
        self.user.as_ref()
    }

    /// Currently selected node id
    pub fn selected(&self) -> Option<&NodeId> {
        self.selected.as_ref()
    }

    /// Look up a node by id
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|node| &node.id == id)
    }

    /// Does the current list contain this id?
    pub fn contains(&self, id: &NodeId) -> bool {
        self.node(id).is_some()
    }

    /// When the last successful refresh was applied
    pub fn last_refreshed(&self) -> Option<Instant> {
        self.last_refreshed
    }

    /// Apply a fetched payload, replacing nodes and account info wholesale.
    ///
    /// Drops the selection if the selected node is gone from the new list.
    pub fn apply(&mut self, url: Url, payload: SubscriptionPayload) {
        self.url = Some(url);
        self.nodes = payload.nodes;
        self.user = Some(payload.user);
        self.last_refreshed = Some(Instant::now());

        if let Some(selected) = self.selected.take() {
            if self.contains(&selected) {
                self.selected = Some(selected);
            } else {
                debug!(%selected, "selected node dropped by refresh");
            }
        }
    }

    /// Select a node. Returns false if the id is not in the current list,
    /// leaving the selection unchanged.
    pub fn select(&mut self, id: &NodeId) -> bool {
        if !self.contains(id) {
            return false;
        }
        self.selected = Some(id.clone());
        true
    }

    /// Clear the selection
    pub fn clear_selection(&mut self) {
        self.selected = None;
    }
}
