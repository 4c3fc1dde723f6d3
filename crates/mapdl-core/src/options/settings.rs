//! Per-user cached settings.
//!
//! The only cached value is the solver executable path. The file is written
//! atomically: serialize to a unique temp file, sync, then rename.

use crate::error::{MapdlError, Result};
use crate::platform::paths;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exec_file: Option<PathBuf>,
}

/// Cached launcher settings stored as JSON.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: Option<PathBuf>,
    data: SettingsFile,
}

impl SettingsStore {
    /// Load from the per-user settings file.
    ///
    /// A missing or unreadable file yields an empty store; the launcher then
    /// falls back to installation discovery.
    pub fn load() -> Self {
        match paths::settings_file() {
            Ok(path) => Self::load_from(path),
            Err(e) => {
                warn!("Settings unavailable: {}", e);
                Self::empty()
            }
        }
    }

    /// Load from an explicit path.
    pub fn load_from(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match read_settings(&path) {
            Ok(Some(data)) => data,
            Ok(None) => SettingsFile::default(),
            Err(e) => {
                warn!("Ignoring unreadable settings file {}: {}", path.display(), e);
                SettingsFile::default()
            }
        };
        Self {
            path: Some(path),
            data,
        }
    }

    /// A store that is never persisted.
    pub fn empty() -> Self {
        Self {
            path: None,
            data: SettingsFile::default(),
        }
    }

    /// Cached executable path, if any.
    pub fn exec_file(&self) -> Option<&Path> {
        self.data.exec_file.as_deref()
    }

    pub fn set_exec_file(&mut self, exec_file: impl Into<PathBuf>) {
        self.data.exec_file = Some(exec_file.into());
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Persist the store. A store without a path is a no-op.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_settings(path, &self.data)?;
        debug!("Saved settings to {}", path.display());
        Ok(())
    }
}

fn read_settings(path: &Path) -> Result<Option<SettingsFile>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(MapdlError::io_with_path(e, path)),
    };
    let data = serde_json::from_str(&contents).map_err(|e| MapdlError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;
    Ok(Some(data))
}

fn write_settings(path: &Path, data: &SettingsFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| MapdlError::io_with_path(e, parent))?;
    }

    let temp_path = path.with_extension(format!("json.{}.tmp", std::process::id()));
    let serialized = serde_json::to_string_pretty(data)?;

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| MapdlError::io_with_path(e, &temp_path))?;
        file.write_all(serialized.as_bytes())
            .map_err(|e| MapdlError::io_with_path(e, &temp_path))?;
        file.sync_all()
            .map_err(|e| MapdlError::io_with_path(e, &temp_path))?;
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        MapdlError::io_with_path(e, path)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = SettingsStore::load_from(temp.path().join("config.json"));
        assert!(store.exec_file().is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.json");

        let mut store = SettingsStore::load_from(&path);
        store.set_exec_file("/usr/ansys_inc/v222/ansys/bin/ansys222");
        store.save().unwrap();

        let reloaded = SettingsStore::load_from(&path);
        assert_eq!(
            reloaded.exec_file(),
            Some(Path::new("/usr/ansys_inc/v222/ansys/bin/ansys222"))
        );
    }

    #[test]
    fn test_corrupt_file_is_ignored() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, "{not json").unwrap();

        let store = SettingsStore::load_from(&path);
        assert!(store.exec_file().is_none());
    }

    #[test]
    fn test_empty_store_save_is_noop() {
        assert!(SettingsStore::empty().save().is_ok());
    }
}
