//! Platform-specific path utilities.
//!
//! - Per-user settings file for the cached executable path
//! - License client log (`licdebug`) directory
//! - Default Ansys licensing directory

use crate::error::{MapdlError, Result};
use std::path::PathBuf;

/// Directory name under the per-user config dir.
pub const SETTINGS_DIR_NAME: &str = "mapdl";
/// File name of the cached settings.
pub const SETTINGS_FILE_NAME: &str = "config.json";

/// Path of the per-user settings file.
///
/// # Platform Behavior
/// - **Linux**: `~/.config/mapdl/config.json`
/// - **Windows**: `%APPDATA%\mapdl\config.json`
/// - **macOS**: `~/Library/Application Support/mapdl/config.json`
pub fn settings_file() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().ok_or_else(|| MapdlError::Config {
        message: "Could not determine the user configuration directory".to_string(),
    })?;
    Ok(config_dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Directory where the license client writes its `licdebug` logs.
///
/// # Platform Behavior
/// - **Linux/macOS**: `$HOME/.ansys`
/// - **Windows**: `%TEMP%\.ansys`
pub fn licdebug_dir() -> Result<PathBuf> {
    #[cfg(windows)]
    {
        Ok(std::env::temp_dir().join(".ansys"))
    }

    #[cfg(not(windows))]
    {
        let home = dirs::home_dir().ok_or_else(|| MapdlError::Config {
            message: "Could not determine home directory".to_string(),
        })?;
        Ok(home.join(".ansys"))
    }
}

/// Default location of the Ansys licensing tools when `ANSYSLIC_DIR` is unset.
pub fn default_license_dir() -> PathBuf {
    #[cfg(windows)]
    {
        let program_files =
            std::env::var_os("ProgramFiles").unwrap_or_else(|| "C:\\Program Files".into());
        PathBuf::from(program_files)
            .join("ANSYS Inc")
            .join("Shared Files")
            .join("Licensing")
    }

    #[cfg(not(windows))]
    {
        PathBuf::from("/usr/ansys_inc/shared_files/licensing")
    }
}

/// The `ansysli_util` executable inside a licensing directory.
pub fn license_util(license_dir: &std::path::Path) -> PathBuf {
    #[cfg(windows)]
    {
        license_dir.join("winx64").join("ansysli_util.exe")
    }

    #[cfg(not(windows))]
    {
        license_dir.join("linx64").join("ansysli_util")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_file_name() {
        if let Ok(path) = settings_file() {
            assert!(path.ends_with("mapdl/config.json") || path.ends_with("mapdl\\config.json"));
        }
    }

    #[test]
    fn test_licdebug_dir_is_dot_ansys() {
        if let Ok(dir) = licdebug_dir() {
            assert_eq!(dir.file_name().and_then(|n| n.to_str()), Some(".ansys"));
        }
    }

    #[test]
    fn test_license_util_under_dir() {
        let util = license_util(std::path::Path::new("/lic"));
        assert!(util.starts_with("/lic"));
        assert!(util
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("ansysli_util"))
            .unwrap_or(false));
    }
}
