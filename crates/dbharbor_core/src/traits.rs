use crate::{
    ConnectionIdentity, ConnectionNode, DatabaseInfo, DbError, DbKind, QueryRequest, QueryResult,
    SqlDialect,
};

/// Factory for creating database connections.
///
/// Registered in the `ConnectionManager` by `DbKind`. Each engine provides its
/// own driver together with the dialect used to build statements for it.
pub trait DbDriver: Send + Sync {
    /// Returns the database kind this driver handles.
    fn kind(&self) -> DbKind;

    /// Human-readable name (e.g., "MySQL").
    fn display_name(&self) -> &'static str {
        self.kind().display_name()
    }

    /// Statement builder for this engine.
    fn dialect(&self) -> &dyn SqlDialect;

    /// Open a connection to `node`.
    ///
    /// The node has already been routed through a tunnel when it needed one,
    /// so implementations connect to `node.host:node.port` directly and select
    /// `node.database` when present.
    fn connect(&self, node: &ConnectionNode) -> Result<Box<dyn Connection>, DbError>;
}

/// Live low-level connection.
///
/// Owned by the `ConnectionManager`; callers receive shared handles and never
/// close them themselves. Implementations must be `Send + Sync`.
pub trait Connection: Send + Sync {
    /// Cheap local liveness check. Must not block on the network.
    fn is_alive(&self) -> bool;

    /// Round-trip check, typically `SELECT 1`.
    fn ping(&self) -> Result<(), DbError>;

    /// Close the connection and release resources. Closing twice is not an error.
    fn close(&self) -> Result<(), DbError>;

    /// Execute a single statement.
    fn execute(&self, req: &QueryRequest) -> Result<QueryResult, DbError>;

    /// List all databases available on the server.
    ///
    /// The default implementation returns an empty list (suitable for SQLite).
    fn list_databases(&self) -> Result<Vec<DatabaseInfo>, DbError> {
        Ok(Vec::new())
    }

    /// Database the session currently has selected, as the transport sees it.
    ///
    /// `None` when the transport does not track its selection.
    fn current_database(&self) -> Option<String> {
        None
    }

    /// Returns the database kind for this connection.
    fn kind(&self) -> DbKind;
}

/// Local forwarding tunnels, keyed by connection identity.
pub trait TunnelService: Send + Sync {
    /// Ensure a forward exists for `identity` and return `node` rewritten to
    /// point at the local endpoint.
    ///
    /// A second call for an identity with an open tunnel reuses it.
    fn open(
        &self,
        identity: &ConnectionIdentity,
        node: &ConnectionNode,
    ) -> Result<ConnectionNode, DbError>;

    /// Tear down the forward for `identity`. No-op when none exists.
    fn close(&self, identity: &ConnectionIdentity) -> Result<(), DbError>;
}

/// Notification sink for a presentation layer.
pub trait TreeRefresh: Send + Sync {
    /// `None` means "everything may have changed".
    fn refresh(&self, identity: Option<&ConnectionIdentity>);
}

/// Source of the currently focused editable document.
pub trait ActiveDocument: Send + Sync {
    /// Path or file name of the focused document, if any.
    fn focused_document(&self) -> Option<String>;
}
