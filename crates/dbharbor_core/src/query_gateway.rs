use crate::{ConnectionManager, ConnectionNode, DbError, GetRequest, QueryRequest, QueryResult};
use log::{debug, warn};
use std::sync::Arc;

/// Runs statements on connections obtained from the manager.
pub struct QueryGateway {
    manager: Arc<ConnectionManager>,
}

impl QueryGateway {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Run `sql` once against `target`, or against the ambient node when no
    /// target is given. Statement failures are returned unchanged.
    pub fn execute(&self, target: Option<&ConnectionNode>, sql: &str) -> Result<QueryResult, DbError> {
        let node = match target {
            Some(node) => node.clone(),
            None => self
                .manager
                .get_last_connection_option(true)?
                .ok_or(DbError::NoActiveConnection)?,
        };

        let connection = self.manager.get_connection(&node, GetRequest::default())?;
        let request = QueryRequest::new(sql).with_database(node.database.clone());

        debug!("Executing on {}: {}", node.identity(None), sql);
        connection.execute(&request).inspect_err(|e| {
            warn!("Statement failed on {}: {}", node.identity(None), e);
        })
    }
}
