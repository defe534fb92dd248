use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::ConnectionIdentity;

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DbKind {
    MySQL,
    MariaDB,
    Postgres,
    SqlServer,
    SQLite,
}

impl DbKind {
    pub fn display_name(&self) -> &'static str {
        match self {
            DbKind::MySQL => "MySQL",
            DbKind::MariaDB => "MariaDB",
            DbKind::Postgres => "PostgreSQL",
            DbKind::SqlServer => "SQL Server",
            DbKind::SQLite => "SQLite",
        }
    }

    /// Lowercase token used as the first segment of query file names.
    pub fn mode(&self) -> &'static str {
        match self {
            DbKind::MySQL => "mysql",
            DbKind::MariaDB => "mariadb",
            DbKind::Postgres => "postgres",
            DbKind::SqlServer => "mssql",
            DbKind::SQLite => "sqlite",
        }
    }

    pub fn from_mode(mode: &str) -> Option<Self> {
        match mode.to_ascii_lowercase().as_str() {
            "mysql" => Some(DbKind::MySQL),
            "mariadb" => Some(DbKind::MariaDB),
            "postgres" | "pg" => Some(DbKind::Postgres),
            "mssql" => Some(DbKind::SqlServer),
            "sqlite" => Some(DbKind::SQLite),
            _ => None,
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            DbKind::MySQL | DbKind::MariaDB => 3306,
            DbKind::Postgres => 5432,
            DbKind::SqlServer => 1433,
            DbKind::SQLite => 0,
        }
    }
}

/// SSH authentication method.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SshAuthMethod {
    /// Authenticate using a private key file.
    PrivateKey {
        /// Path to the private key file. If `None`, uses SSH agent or default keys (~/.ssh/id_rsa).
        key_path: Option<PathBuf>,
    },

    /// Authenticate using a password.
    Password,
}

impl Default for SshAuthMethod {
    fn default() -> Self {
        SshAuthMethod::PrivateKey { key_path: None }
    }
}

/// SSH tunnel configuration for reaching a database through a bastion host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshTunnelConfig {
    /// SSH server hostname.
    pub host: String,

    /// SSH server port (typically 22).
    pub port: u16,

    /// SSH username.
    pub user: String,

    #[serde(default)]
    pub auth_method: SshAuthMethod,

    /// Fixed local port for the forward. `None` binds an ephemeral port.
    #[serde(default)]
    pub local_port: Option<u16>,
}

/// Coordinates of one logical connection target: a server, optionally
/// narrowed to a database.
///
/// This is plain data. The dialect and transport for a node are looked up
/// from the driver registered for its `kind`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionNode {
    pub kind: DbKind,
    pub host: String,
    pub port: u16,
    pub user: String,

    #[serde(skip)]
    pub password: Option<SecretString>,

    #[serde(default)]
    pub database: Option<String>,

    #[serde(default)]
    pub ssh: Option<SshTunnelConfig>,

    /// Comma-separated allow-list of databases shown for this server.
    #[serde(default)]
    pub include_databases: Option<String>,
}

impl Clone for ConnectionNode {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self
                .password
                .as_ref()
                .map(|p| SecretString::from(p.expose_secret().to_owned())),
            database: self.database.clone(),
            ssh: self.ssh.clone(),
            include_databases: self.include_databases.clone(),
        }
    }
}

impl ConnectionNode {
    pub fn new(kind: DbKind, host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
            user: user.into(),
            password: None,
            database: None,
            ssh: None,
            include_databases: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::from(password.into()));
        self
    }

    pub fn with_ssh(mut self, ssh: SshTunnelConfig) -> Self {
        self.ssh = Some(ssh);
        self
    }

    pub fn with_include_databases(mut self, include: impl Into<String>) -> Self {
        self.include_databases = Some(include.into());
        self
    }

    pub fn uses_ssh(&self) -> bool {
        self.ssh.is_some()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_ref().map(|p| p.expose_secret())
    }

    /// The same server with a different (or no) database selected.
    pub fn for_database(&self, database: Option<&str>) -> Self {
        let mut node = self.clone();
        node.database = database.map(str::to_string);
        node
    }

    /// Connection parameters routed through a local forward.
    ///
    /// The SSH descriptor is dropped from the copy so the transport connects
    /// to the local endpoint directly.
    pub fn tunneled(&self, local_port: u16) -> Self {
        let mut node = self.clone();
        node.host = "127.0.0.1".to_string();
        node.port = local_port;
        node.ssh = None;
        node
    }

    /// Identity of this node, honoring an explicit session override.
    pub fn identity(&self, session_override: Option<&str>) -> ConnectionIdentity {
        ConnectionIdentity::of(self, session_override)
    }

    /// Identity of the server this node belongs to (database omitted).
    pub fn server_identity(&self) -> ConnectionIdentity {
        ConnectionIdentity::server(self)
    }

    /// Databases allowed by `include_databases`, lowercased. `None` means all.
    pub fn included_databases(&self) -> Option<Vec<String>> {
        let raw = self.include_databases.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }

        Some(
            raw.split(',')
                .map(|name| name.trim().to_lowercase())
                .filter(|name| !name.is_empty())
                .collect(),
        )
    }
}

/// Saved connection profile.
///
/// Persisted to disk as JSON. Passwords are never written; `password_env`
/// names an environment variable the front end reads at connect time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub id: Uuid,

    /// User-defined name.
    pub name: String,

    pub node: ConnectionNode,

    #[serde(default)]
    pub password_env: Option<String>,
}

impl ConnectionProfile {
    pub fn new(name: impl Into<String>, node: ConnectionNode) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            node,
            password_env: None,
        }
    }

    /// The profile's node with its password resolved from the environment.
    pub fn resolved_node(&self) -> ConnectionNode {
        let mut node = self.node.clone();
        if let Some(var) = self.password_env.as_deref()
            && let Ok(value) = std::env::var(var)
        {
            node.password = Some(SecretString::from(value));
        }
        node
    }
}
