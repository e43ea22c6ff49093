use crate::shared::errors::RuntimeError;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_STATE_ROOT_DIR: &str = ".wardbus";
pub const DATABASE_FILE_NAME: &str = "wardbus.db";
pub const SETTINGS_FILE_NAME: &str = "config.yaml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join(DATABASE_FILE_NAME)
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE_NAME)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn shared_workspace(&self, scope_id: &str) -> PathBuf {
        crate::work::workspace::scope_workspace_dirs(&self.root, scope_id).0
    }

    pub fn attempts_dir(&self, scope_id: &str) -> PathBuf {
        crate::work::workspace::scope_workspace_dirs(&self.root, scope_id).1
    }

    pub fn required_directories(&self) -> Vec<PathBuf> {
        vec![
            self.root.clone(),
            self.logs_dir(),
            self.root.join("workspaces"),
        ]
    }
}

pub fn bootstrap_state_root(paths: &StatePaths) -> Result<(), RuntimeError> {
    for directory in paths.required_directories() {
        fs::create_dir_all(&directory).map_err(|source| RuntimeError::CreateDir {
            path: directory.display().to_string(),
            source,
        })?;
    }
    Ok(())
}

pub fn default_state_root_path() -> Result<PathBuf, RuntimeError> {
    let home = std::env::var_os("HOME").ok_or(RuntimeError::HomeDirectoryUnavailable)?;
    Ok(PathBuf::from(home).join(DEFAULT_STATE_ROOT_DIR))
}
