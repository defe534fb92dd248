use crate::app_config::app_dir;
use crate::{ConnectionProfile, DbError};
use std::fs;
use std::path::{Path, PathBuf};

/// Saved connection profiles, stored as pretty JSON.
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new() -> Result<Self, DbError> {
        Ok(Self {
            path: app_dir()?.join("profiles.json"),
        })
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<Vec<ConnectionProfile>, DbError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path).map_err(DbError::IoError)?;
        let profiles: Vec<ConnectionProfile> =
            serde_json::from_str(&content).map_err(|e| DbError::InvalidProfile(e.to_string()))?;

        Ok(profiles)
    }

    pub fn save(&self, profiles: &[ConnectionProfile]) -> Result<(), DbError> {
        let content = serde_json::to_string_pretty(profiles)
            .map_err(|e| DbError::InvalidProfile(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }
        fs::write(&self.path, content).map_err(DbError::IoError)?;

        Ok(())
    }

    /// Look a profile up by name, case-insensitively.
    pub fn find(&self, name: &str) -> Result<Option<ConnectionProfile>, DbError> {
        Ok(self
            .load()?
            .into_iter()
            .find(|profile| profile.name.eq_ignore_ascii_case(name)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
