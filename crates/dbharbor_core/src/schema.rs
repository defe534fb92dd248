use serde::{Deserialize, Serialize};

/// Information about a database on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,

    /// True if this is the currently selected database.
    pub is_current: bool,
}

impl DatabaseInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_current: false,
        }
    }
}
