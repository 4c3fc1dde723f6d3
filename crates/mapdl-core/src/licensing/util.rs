//! License checkouts through the `ansysli_util` tool.

use super::ALLOWABLE_LICENSES;
use crate::config::{EnvVars, LicenseConfig};
use crate::error::{MapdlError, Result};
use crate::options::EnvSnapshot;
use crate::platform::paths;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

const NO_SUCH_FEATURE: &str = "No such feature exists";
const SERVER_DOWN: &str = "The server is down or is not responsive.";

/// The Ansys licensing directory.
///
/// `ANSYSLIC_DIR` is honoured unless `ANSYSLMD_LICENSE_FILE` is set, in
/// which case the default install location is used.
pub fn license_dir(env: &EnvSnapshot) -> Result<PathBuf> {
    let dir = if env.is_set(EnvVars::LICENSE_FILE) {
        None
    } else {
        env.get(EnvVars::LICENSE_DIR).map(PathBuf::from)
    };

    match dir {
        Some(dir) => Ok(dir),
        None => {
            let dir = paths::default_license_dir();
            if !dir.is_dir() {
                return Err(MapdlError::config(format!(
                    "Unable to locate the Ansys licensing directory at {}. Set {}",
                    dir.display(),
                    EnvVars::LICENSE_DIR
                )));
            }
            Ok(dir)
        }
    }
}

/// Run `ansysli_util -checkout <license>` and return its output.
///
/// With `server`, the check goes to that `host:port` only.
pub async fn checkout_license(
    license: &str,
    server: Option<(&str, u16)>,
    license_dir: &Path,
) -> Result<String> {
    let license = license.to_lowercase();
    if !ALLOWABLE_LICENSES.contains(&license.as_str()) {
        return Err(MapdlError::config(format!("Invalid license '{}'", license)));
    }

    let util = paths::license_util(license_dir);
    if !util.is_file() {
        return Err(MapdlError::ExecutableNotFound(util));
    }

    let mut cmd = Command::new(&util);
    cmd.args(["-checkout", &license]);
    if let Some((host, port)) = server {
        cmd.env("ANSYSLI_SERVERS", format!("{}:{}", host, port));
        cmd.env("ANS_FLEXLM_DISABLE_DEFLICPATH", "TRUE");
    }

    debug!("Checking out '{}' with {}", license, util.display());
    let output = cmd
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| MapdlError::SpawnFailed {
            command: util.display().to_string(),
            message: e.to_string(),
            source: Some(e),
        })?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(text)
}

/// Check that each license can be checked out.
///
/// `host` overrides the configured servers (port 2325).
pub async fn check_license_available(
    licenses: &[&str],
    host: Option<&str>,
    license_dir: &Path,
) -> Result<()> {
    for license in licenses {
        let server = host.map(|h| (h, LicenseConfig::CHECKOUT_PORT));
        let output = checkout_license(license, server, license_dir).await?;
        if output.contains(NO_SUCH_FEATURE) || output.contains(SERVER_DOWN) {
            return Err(MapdlError::LicenseUnavailable {
                license: license.to_string(),
                message: output.trim().to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_license_dir_from_env() {
        let env = EnvSnapshot::from_pairs([(EnvVars::LICENSE_DIR, "/opt/licensing")]);
        assert_eq!(license_dir(&env).unwrap(), PathBuf::from("/opt/licensing"));
    }

    #[tokio::test]
    async fn test_invalid_license_rejected() {
        let dir = TempDir::new().unwrap();
        let err = checkout_license("yoyoyo", None, dir.path()).await.unwrap_err();
        assert!(matches!(err, MapdlError::Config { .. }));
    }

    #[tokio::test]
    async fn test_missing_util() {
        let dir = TempDir::new().unwrap();
        let err = checkout_license("meba", None, dir.path()).await.unwrap_err();
        assert!(matches!(err, MapdlError::ExecutableNotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unavailable_feature() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let util = paths::license_util(dir.path());
        std::fs::create_dir_all(util.parent().unwrap()).unwrap();
        std::fs::write(&util, "#!/bin/sh\necho 'No such feature exists'\n").unwrap();
        std::fs::set_permissions(&util, std::fs::Permissions::from_mode(0o755)).unwrap();

        let err = check_license_available(&["mech_1"], None, dir.path()).await.unwrap_err();
        match err {
            MapdlError::LicenseUnavailable { license, .. } => assert_eq!(license, "mech_1"),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
