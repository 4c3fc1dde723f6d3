//! Run-directory arbitration: lock files, sentinel files and cleanup scripts.

use crate::config::LaunchDefaults;
use crate::error::{MapdlError, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info};

static POSIX_PID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-9 (\d+)").expect("cleanup pid regex must compile"));
static WINDOWS_PID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/pid (\d+)").expect("cleanup pid regex must compile"));

/// Path of the lock file for `jobname` in `dir`.
pub fn lock_file_path(dir: &Path, jobname: &str) -> PathBuf {
    dir.join(format!("{}.lock", jobname))
}

/// Refuse to start over an existing lock file unless `override_lock` is set,
/// in which case the file is removed.
pub fn check_lock_file(dir: &Path, jobname: &str, override_lock: bool) -> Result<()> {
    let lock = lock_file_path(dir, jobname);
    debug!("Checking for lock file {}", lock.display());
    if !lock.is_file() {
        return Ok(());
    }
    if !override_lock {
        return Err(MapdlError::LockFileExists { path: lock });
    }

    match std::fs::remove_file(&lock) {
        Ok(()) => {
            info!("Removed stale lock file {}", lock.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(MapdlError::LockFileExists { path: lock })
        }
        Err(e) => Err(MapdlError::io_with_path(e, lock)),
    }
}

/// Remove `{jobname}.lock` and `file.lock`.
///
/// Missing files are fine; any other failure is returned.
pub fn remove_lock_files(dir: &Path, jobname: &str) -> Result<()> {
    let mut names = vec![format!("{}.lock", jobname)];
    if jobname != "file" {
        names.push(LaunchDefaults::GLOBAL_LOCK_FILE.to_string());
    }

    for name in names {
        let path = dir.join(name);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(MapdlError::PermissionDenied(path));
            }
            Err(e) => return Err(MapdlError::io_with_path(e, path)),
        }
    }
    Ok(())
}

/// True once the solver has written an `.err` file in `dir`.
pub fn has_error_file(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .any(|entry| entry.file_name().to_string_lossy().contains(".err"))
        })
        .unwrap_or(false)
}

/// PIDs listed in the solver's `cleanup-ansys-*` scripts.
pub fn cleanup_script_pids(dir: &Path, windows: bool) -> Vec<u32> {
    let re: &Regex = if windows { &WINDOWS_PID_RE } else { &POSIX_PID_RE };
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut pids = BTreeSet::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.contains(LaunchDefaults::CLEANUP_SCRIPT_MARKER) {
            continue;
        }
        let Ok(raw) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        pids.extend(
            re.captures_iter(&raw)
                .filter_map(|c| c.get(1))
                .filter_map(|m| m.as_str().parse::<u32>().ok()),
        );
    }
    pids.into_iter().collect()
}

/// Write the batch input file a Windows solver starts from.
pub fn write_windows_input(dir: &Path) -> Result<PathBuf> {
    let path = dir.join(LaunchDefaults::WINDOWS_TMP_INPUT);
    std::fs::write(&path, "FINISH\r\n").map_err(|e| MapdlError::io_with_path(e, &path))?;
    debug!("Wrote temporary input file {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_file_blocks_without_override() {
        let dir = TempDir::new().unwrap();
        std::fs::write(lock_file_path(dir.path(), "job"), "").unwrap();

        let err = check_lock_file(dir.path(), "job", false).unwrap_err();
        assert!(matches!(err, MapdlError::LockFileExists { .. }));
        assert!(lock_file_path(dir.path(), "job").exists());
    }

    #[test]
    fn test_lock_file_removed_with_override() {
        let dir = TempDir::new().unwrap();
        std::fs::write(lock_file_path(dir.path(), "job"), "").unwrap();

        check_lock_file(dir.path(), "job", true).unwrap();
        assert!(!lock_file_path(dir.path(), "job").exists());
    }

    #[test]
    fn test_no_lock_file() {
        let dir = TempDir::new().unwrap();
        check_lock_file(dir.path(), "job", false).unwrap();
    }

    #[test]
    fn test_remove_lock_files_is_idempotent() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("job.lock"), "").unwrap();
        std::fs::write(dir.path().join("file.lock"), "").unwrap();

        remove_lock_files(dir.path(), "job").unwrap();
        assert!(!dir.path().join("job.lock").exists());
        assert!(!dir.path().join("file.lock").exists());
        remove_lock_files(dir.path(), "job").unwrap();
    }

    #[test]
    fn test_error_file_detection() {
        let dir = TempDir::new().unwrap();
        assert!(!has_error_file(dir.path()));
        std::fs::write(dir.path().join("file0.err"), "").unwrap();
        assert!(has_error_file(dir.path()));
    }

    #[test]
    fn test_cleanup_script_pids() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("cleanup-ansys-host-1234.sh"),
            "kill -9 1234\nkill -9 1250\nkill -9 1234\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("other.sh"), "kill -9 99\n").unwrap();

        assert_eq!(cleanup_script_pids(dir.path(), false), vec![1234, 1250]);
        assert!(cleanup_script_pids(dir.path(), true).is_empty());
    }

    #[test]
    fn test_windows_cleanup_script_pids() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("cleanup-ansys-host-77.bat"),
            "taskkill /f /pid 77\ntaskkill /f /pid 78\n",
        )
        .unwrap();
        assert_eq!(cleanup_script_pids(dir.path(), true), vec![77, 78]);
    }

    #[test]
    fn test_write_windows_input() {
        let dir = TempDir::new().unwrap();
        let path = write_windows_input(dir.path()).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "FINISH\r\n");
    }
}
