mod app_config;
mod connection_manager;
mod error;
mod identity;
mod metadata_cache;
mod profile;
mod query;
mod query_file;
mod query_gateway;
mod schema;
mod schema_browser;
mod sql_dialect;
mod store;
mod traits;
mod value;

pub use app_config::{AppConfig, AppConfigStore, ManagerConfig};
pub use connection_manager::{ConnectionManager, GetRequest};
pub use error::DbError;
pub use identity::ConnectionIdentity;
pub use metadata_cache::{ChildDescriptor, ChildKind, ExpansionState, MetadataCache};
pub use profile::{ConnectionNode, ConnectionProfile, DbKind, SshAuthMethod, SshTunnelConfig};
pub use query::{ColumnMeta, QueryRequest, QueryResult, Row};
pub use query_file::{QueryFileCoordinates, parse_query_file_name, query_file_name};
pub use query_gateway::QueryGateway;
pub use schema::DatabaseInfo;
pub use schema_browser::{SchemaBrowser, USER_GROUP, VIEW_GROUP};
pub use sql_dialect::{DefaultSqlDialect, SqlDialect};
pub use store::ProfileStore;
pub use traits::{ActiveDocument, Connection, DbDriver, TreeRefresh, TunnelService};
pub use value::Value;

pub use chrono;
pub use secrecy;
