use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{ConnectionIdentity, ConnectionNode};

/// Kind of an entity discovered underneath a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChildKind {
    Database,
    UserGroup,
    User,
    Table,
    View,
    Procedure,
}

/// One discovered child, in discovery order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildDescriptor {
    pub kind: ChildKind,
    pub name: String,

    /// Cache key of the child itself.
    pub identity: ConnectionIdentity,
}

impl ChildDescriptor {
    pub fn new(kind: ChildKind, name: impl Into<String>, identity: ConnectionIdentity) -> Self {
        Self {
            kind,
            name: name.into(),
            identity,
        }
    }
}

/// Last known expand/collapse state of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpansionState {
    #[default]
    Collapsed,
    Expanded,
}

/// In-memory memo of schema-discovery results, keyed by identity.
///
/// Invalidation never cascades on its own. Whoever owns a subtree enumerates
/// it with `identities_within` and invalidates each entry.
#[derive(Debug, Default)]
pub struct MetadataCache {
    children: HashMap<ConnectionIdentity, Vec<ChildDescriptor>>,
    expansion: HashMap<ConnectionIdentity, ExpansionState>,
    nodes: HashMap<ConnectionIdentity, ConnectionNode>,
    default_expansion: ExpansionState,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache reporting `state` for identities never shown before.
    pub fn with_default_expansion(state: ExpansionState) -> Self {
        Self {
            default_expansion: state,
            ..Self::default()
        }
    }

    pub fn get_children(&self, identity: &ConnectionIdentity) -> Option<&[ChildDescriptor]> {
        self.children.get(identity).map(Vec::as_slice)
    }

    pub fn set_children(&mut self, identity: ConnectionIdentity, children: Vec<ChildDescriptor>) {
        self.children.insert(identity, children);
    }

    /// Drop the children and expansion state stored for exactly `identity`.
    ///
    /// Returns `true` if anything was removed.
    pub fn invalidate(&mut self, identity: &ConnectionIdentity) -> bool {
        let had_children = self.children.remove(identity).is_some();
        let had_state = self.expansion.remove(identity).is_some();
        had_children || had_state
    }

    pub fn get_expansion_state(&self, identity: &ConnectionIdentity) -> ExpansionState {
        self.expansion
            .get(identity)
            .copied()
            .unwrap_or(self.default_expansion)
    }

    pub fn set_expansion_state(&mut self, identity: ConnectionIdentity, state: ExpansionState) {
        self.expansion.insert(identity, state);
    }

    /// Every identity with cached data in the subtree rooted at `root`.
    pub fn identities_within(&self, root: &ConnectionIdentity) -> Vec<ConnectionIdentity> {
        let mut identities: Vec<ConnectionIdentity> = self
            .children
            .keys()
            .chain(self.expansion.keys())
            .filter(|identity| identity.is_within(root))
            .cloned()
            .collect();

        identities.sort();
        identities.dedup();
        identities
    }

    /// Remember a node so it can be found again from its identity.
    pub fn remember_node(&mut self, node: &ConnectionNode) {
        self.nodes.insert(node.identity(None), node.clone());
    }

    pub fn node(&self, identity: &ConnectionIdentity) -> Option<&ConnectionNode> {
        self.nodes.get(identity)
    }

    /// Any remembered node on `server`, preferring the server node itself.
    pub fn node_on_server(&self, server: &ConnectionIdentity) -> Option<&ConnectionNode> {
        self.nodes
            .get(server)
            .or_else(|| self.nodes.values().find(|node| &node.server_identity() == server))
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.expansion.is_empty()
    }

    /// Drop all discovery results and expansion state. Remembered nodes stay.
    pub fn clear(&mut self) {
        self.children.clear();
        self.expansion.clear();
    }
}
