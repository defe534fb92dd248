use crate::{
    ChildDescriptor, ChildKind, ConnectionManager, ConnectionNode, DbError, GetRequest,
    QueryRequest, QueryResult,
};
use log::{debug, info};
use std::sync::Arc;

/// Name of the synthetic group listing server users.
pub const USER_GROUP: &str = "USER";

/// Cache segment holding the views of a database.
pub const VIEW_GROUP: &str = "VIEW_GROUP";

/// Schema discovery memoized in the manager's metadata cache.
pub struct SchemaBrowser {
    manager: Arc<ConnectionManager>,
}

impl SchemaBrowser {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Databases on `node`'s server, preceded by the user group.
    ///
    /// Served from cache unless `refresh` is set. The node's
    /// `include_databases` allow-list is applied case-insensitively.
    pub fn databases(
        &self,
        node: &ConnectionNode,
        refresh: bool,
    ) -> Result<Vec<ChildDescriptor>, DbError> {
        let server = node.server_identity();

        if !refresh && let Some(children) = self.manager.cached_children(&server) {
            debug!("Database list for {} served from cache", server);
            return Ok(children);
        }

        let server_node = node.for_database(None);
        let connection = self.manager.get_connection(&server_node, GetRequest::default())?;
        let databases = connection.list_databases()?;
        let allowed = node.included_databases();

        let mut children = vec![ChildDescriptor::new(
            ChildKind::UserGroup,
            USER_GROUP,
            server.child(USER_GROUP),
        )];

        children.extend(
            databases
                .into_iter()
                .filter(|db| {
                    allowed
                        .as_ref()
                        .is_none_or(|allowed| allowed.contains(&db.name.to_lowercase()))
                })
                .map(|db| {
                    let identity = server.child(&db.name);
                    ChildDescriptor::new(ChildKind::Database, db.name, identity)
                }),
        );

        info!("Discovered {} database(s) on {}", children.len() - 1, server);
        self.manager.set_cached_children(server, children.clone());
        Ok(children)
    }

    /// Views of the database `node` points at.
    pub fn views(
        &self,
        node: &ConnectionNode,
        refresh: bool,
    ) -> Result<Vec<ChildDescriptor>, DbError> {
        let database = node
            .database
            .as_deref()
            .filter(|db| !db.is_empty())
            .ok_or_else(|| DbError::NotSupported("Views require a database".to_string()))?;

        let group = node.identity(None).child(VIEW_GROUP);
        if !refresh && let Some(children) = self.manager.cached_children(&group) {
            return Ok(children);
        }

        let sql = self
            .manager
            .driver(node.kind)?
            .dialect()
            .show_views(database)
            .ok_or_else(|| {
                DbError::NotSupported(format!("{} has no view listing", node.kind.display_name()))
            })?;

        let result = self.run(node, sql)?;
        let children: Vec<ChildDescriptor> = result
            .column_strings(0)
            .into_iter()
            .map(|name| {
                let identity = group.child(&name);
                ChildDescriptor::new(ChildKind::View, name, identity)
            })
            .collect();

        debug!("Discovered {} view(s) in {}", children.len(), group);
        self.manager.set_cached_children(group, children.clone());
        Ok(children)
    }

    pub fn create_database(&self, node: &ConnectionNode, name: &str) -> Result<(), DbError> {
        let sql = self
            .manager
            .driver(node.kind)?
            .dialect()
            .create_database(name)
            .ok_or_else(|| DbError::NotSupported("CREATE DATABASE".to_string()))?;

        self.run(&node.for_database(None), sql)?;
        info!("Created database {} on {}", name, node.server_identity());

        let server = node.server_identity();
        self.manager.invalidate_subtree(&server);
        self.manager.notify_refresh(Some(&server));
        Ok(())
    }

    pub fn drop_database(&self, node: &ConnectionNode, name: &str) -> Result<(), DbError> {
        let sql = self
            .manager
            .driver(node.kind)?
            .dialect()
            .drop_database(name)
            .ok_or_else(|| DbError::NotSupported("DROP DATABASE".to_string()))?;

        self.run(&node.for_database(None), sql)?;
        info!("Dropped database {} on {}", name, node.server_identity());

        let server = node.server_identity();
        self.manager.invalidate_subtree(&server);
        self.manager.notify_refresh(Some(&server));
        Ok(())
    }

    /// Pick a database on `node`'s server and make it the active node.
    ///
    /// Without an explicit `database`, the server must expose exactly one.
    pub fn activate(
        &self,
        node: &ConnectionNode,
        database: Option<&str>,
    ) -> Result<ConnectionNode, DbError> {
        let chosen = match database.or(node.database.as_deref()) {
            Some(database) => database.to_string(),
            None => {
                let databases: Vec<ChildDescriptor> = self
                    .databases(node, false)?
                    .into_iter()
                    .filter(|child| child.kind == ChildKind::Database)
                    .collect();

                match databases.as_slice() {
                    [only] => only.name.clone(),
                    [] => {
                        return Err(DbError::NotSupported(format!(
                            "No databases on {}",
                            node.server_identity()
                        )));
                    }
                    _ => {
                        return Err(DbError::NotSupported(format!(
                            "{} has {} databases, choose one",
                            node.server_identity(),
                            databases.len()
                        )));
                    }
                }
            }
        };

        let target = node.for_database(Some(&chosen));
        self.manager.change_active(&target);
        Ok(target)
    }

    fn run(&self, node: &ConnectionNode, sql: String) -> Result<QueryResult, DbError> {
        let connection = self.manager.get_connection(node, GetRequest::default())?;
        connection.execute(&QueryRequest::new(sql).with_database(node.database.clone()))
    }
}
