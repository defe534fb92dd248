use crate::{DbError, ExpansionState};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub(crate) const APP_DIR: &str = "dbharbor";

/// Tuning for the `ConnectionManager`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Total connect attempts for one request, the first included.
    pub max_connect_attempts: u32,

    /// Only documents whose path contains this marker are treated as
    /// connection-bound query files.
    pub query_file_marker: Option<String>,

    pub default_expansion: ExpansionState,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_connect_attempts: 2,
            query_file_marker: None,
            default_expansion: ExpansionState::Collapsed,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub manager: ManagerConfig,
}

pub struct AppConfigStore {
    path: PathBuf,
}

impl AppConfigStore {
    pub fn new() -> Result<Self, DbError> {
        Ok(Self {
            path: app_dir()?.join("config.json"),
        })
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<AppConfig, DbError> {
        if !self.path.exists() {
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&self.path).map_err(DbError::IoError)?;
        let config: AppConfig =
            serde_json::from_str(&content).map_err(|e| DbError::InvalidProfile(e.to_string()))?;

        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `<config_dir>/dbharbor`, created on first use.
pub(crate) fn app_dir() -> Result<PathBuf, DbError> {
    let config_dir = dirs::config_dir().ok_or_else(|| {
        DbError::IoError(std::io::Error::other("Could not find config directory"))
    })?;

    let app_dir = config_dir.join(APP_DIR);
    fs::create_dir_all(&app_dir).map_err(DbError::IoError)?;

    Ok(app_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_allow_one_retry() {
        let config = ManagerConfig::default();
        assert_eq!(config.max_connect_attempts, 2);
        assert_eq!(config.default_expansion, ExpansionState::Collapsed);
        assert!(config.query_file_marker.is_none());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "manager": { "query_file_marker": ".queries" } }"#).unwrap();
        assert_eq!(config.manager.max_connect_attempts, 2);
        assert_eq!(config.manager.query_file_marker.as_deref(), Some(".queries"));
    }

    #[test]
    fn missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppConfigStore::at(dir.path().join("config.json"));
        assert_eq!(store.load().unwrap().manager, ManagerConfig::default());
    }
}
