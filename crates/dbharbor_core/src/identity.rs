use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ConnectionNode;

/// Separator between identity segments.
///
/// Shared with the query file naming scheme so an identity can be recovered
/// from a file name.
pub(crate) const SEPARATOR: char = '_';

/// Deterministic key for "the connection that serves this request".
///
/// Structural keys are `host_port_user` for a server and
/// `host_port_user_database` for a database on it. A session override
/// replaces the structural key verbatim, pinning a request to one specific
/// live connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionIdentity(String);

impl ConnectionIdentity {
    /// Full identity of a node, including its database when one is selected.
    pub fn of(node: &ConnectionNode, session_override: Option<&str>) -> Self {
        if let Some(session) = session_override.filter(|s| !s.is_empty()) {
            return Self(session.to_string());
        }

        match node.database.as_deref() {
            Some(database) if !database.is_empty() => {
                Self::server(node).child(database)
            }
            _ => Self::server(node),
        }
    }

    /// Identity of the server a node belongs to.
    pub fn server(node: &ConnectionNode) -> Self {
        Self::from_coordinates(&node.host, node.port, &node.user, None)
    }

    /// Key of the live-connection slot serving `node`.
    ///
    /// Requests that differ only in database share a slot, so switching
    /// database re-points the existing connection instead of opening another.
    pub fn slot(node: &ConnectionNode, session_override: Option<&str>) -> Self {
        match session_override.filter(|s| !s.is_empty()) {
            Some(session) => Self(session.to_string()),
            None => Self::server(node),
        }
    }

    pub fn from_coordinates(host: &str, port: u16, user: &str, database: Option<&str>) -> Self {
        let server = Self(format!("{host}{SEPARATOR}{port}{SEPARATOR}{user}"));
        match database {
            Some(database) if !database.is_empty() => server.child(database),
            _ => server,
        }
    }

    /// Identity of a descendant of this one.
    pub fn child(&self, segment: &str) -> Self {
        Self(format!("{}{}{}", self.0, SEPARATOR, segment))
    }

    /// True if `self` is `root` or lies in the subtree rooted at it.
    pub fn is_within(&self, root: &ConnectionIdentity) -> bool {
        match self.0.strip_prefix(root.0.as_str()) {
            Some("") => true,
            Some(rest) => rest.starts_with(SEPARATOR),
            None => false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionIdentity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ConnectionIdentity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DbKind;

    fn node() -> ConnectionNode {
        ConnectionNode::new(DbKind::MySQL, "localhost", 3306, "root")
    }

    #[test]
    fn structural_key_includes_database_when_present() {
        assert_eq!(node().identity(None).as_str(), "localhost_3306_root");
        assert_eq!(
            node().with_database("shop").identity(None).as_str(),
            "localhost_3306_root_shop"
        );
    }

    #[test]
    fn empty_database_is_treated_as_absent() {
        let mut n = node();
        n.database = Some(String::new());
        assert_eq!(n.identity(None), n.server_identity());
    }

    #[test]
    fn session_override_takes_precedence() {
        let n = node().with_database("shop");
        assert_eq!(n.identity(Some("pinned-1")).as_str(), "pinned-1");
        assert_eq!(ConnectionIdentity::slot(&n, Some("pinned-1")).as_str(), "pinned-1");
        assert_eq!(n.identity(Some("")), n.identity(None));
    }

    #[test]
    fn slot_ignores_database() {
        let a = node().with_database("a");
        let b = node().with_database("b");
        assert_eq!(
            ConnectionIdentity::slot(&a, None),
            ConnectionIdentity::slot(&b, None)
        );
        assert_ne!(a.identity(None), b.identity(None));
    }

    #[test]
    fn distinct_coordinates_give_distinct_keys() {
        let base = node().identity(None);
        assert_ne!(base, ConnectionNode::new(DbKind::MySQL, "localhost", 3307, "root").identity(None));
        assert_ne!(base, ConnectionNode::new(DbKind::MySQL, "localhost", 3306, "app").identity(None));
        assert_ne!(base, ConnectionNode::new(DbKind::MySQL, "remote", 3306, "root").identity(None));
    }

    #[test]
    fn subtree_membership_respects_segment_boundary() {
        let server = node().server_identity();
        let database = node().with_database("shop").identity(None);
        let views = database.child("VIEW_GROUP");

        assert!(server.is_within(&server));
        assert!(database.is_within(&server));
        assert!(views.is_within(&database));
        assert!(!server.is_within(&database));

        let other_user = ConnectionIdentity::from("localhost_3306_rootx");
        assert!(!other_user.is_within(&server));
    }
}
