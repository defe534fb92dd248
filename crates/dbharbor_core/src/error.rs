use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("SSH tunnel failed: {0}")]
    TunnelFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("No active database connection found")]
    NoActiveConnection,

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl DbError {
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    pub fn tunnel_failed(message: impl Into<String>) -> Self {
        Self::TunnelFailed(message.into())
    }

    pub fn query_failed(message: impl Into<String>) -> Self {
        Self::QueryFailed(message.into())
    }

    /// Failures worth another connect attempt.
    ///
    /// Tunnel and configuration errors are not: repeating them cannot help.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::ConnectionFailed(_) | DbError::IoError(_))
    }
}
