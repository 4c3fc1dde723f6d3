//! License server reachability.

use crate::config::{EnvVars, LicenseConfig};
use crate::error::{MapdlError, Result};
use crate::options::EnvSnapshot;
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// A `port@host` entry of `ANSYSLMD_LICENSE_FILE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseServer {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for LicenseServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.port, self.host)
    }
}

/// Parse `port@host[,port@host...]`; a missing port means 1055.
///
/// Entries may also be separated by `;` or `:` (Windows and POSIX path
/// list conventions).
pub fn parse_license_servers(value: &str) -> Vec<LicenseServer> {
    value
        .split([',', ';', ':'])
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.split_once('@') {
            Some((port, host)) if !host.trim().is_empty() => Some(LicenseServer {
                host: host.trim().to_string(),
                port: port.trim().parse().unwrap_or(LicenseConfig::DEFAULT_SERVER_PORT),
            }),
            Some(_) => None,
            None => Some(LicenseServer {
                host: entry.to_string(),
                port: LicenseConfig::DEFAULT_SERVER_PORT,
            }),
        })
        .collect()
}

async fn reachable(server: &LicenseServer, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((server.host.as_str(), server.port))).await,
        Ok(Ok(_))
    )
}

/// Check that a license server from `ANSYSLMD_LICENSE_FILE` accepts connections.
///
/// Returns the first reachable server, or `None` when the variable is unset
/// or points at a license file rather than servers.
pub async fn check_license_servers(env: &EnvSnapshot, timeout: Duration) -> Result<Option<LicenseServer>> {
    let Some(value) = env.get(EnvVars::LICENSE_FILE) else {
        debug!("{} is not set; skipping license server check", EnvVars::LICENSE_FILE);
        return Ok(None);
    };
    if Path::new(value).is_file() {
        debug!("{} names a license file; skipping license server check", EnvVars::LICENSE_FILE);
        return Ok(None);
    }

    let servers = parse_license_servers(value);
    for server in &servers {
        if reachable(server, timeout).await {
            info!("License server {} is reachable", server);
            return Ok(Some(server.clone()));
        }
        debug!("License server {} did not accept a connection", server);
    }

    Err(MapdlError::LicenseServerUnreachable {
        servers: servers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_servers() {
        let servers = parse_license_servers("1055@lic1, 2325@lic2.corp;lic3");
        assert_eq!(
            servers,
            vec![
                LicenseServer { host: "lic1".into(), port: 1055 },
                LicenseServer { host: "lic2.corp".into(), port: 2325 },
                LicenseServer { host: "lic3".into(), port: 1055 },
            ]
        );
    }

    #[test]
    fn test_parse_ignores_empty_entries() {
        assert!(parse_license_servers(" , ;").is_empty());
        assert!(parse_license_servers("1055@").is_empty());
    }

    #[tokio::test]
    async fn test_unset_variable_skips_check() {
        let env = EnvSnapshot::empty();
        assert_eq!(check_license_servers(&env, Duration::from_millis(100)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reachable_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let env = EnvSnapshot::from_pairs([(EnvVars::LICENSE_FILE, format!("{}@127.0.0.1", port))]);

        let server = check_license_servers(&env, Duration::from_secs(1)).await.unwrap();
        assert_eq!(server.map(|s| s.port), Some(port));
    }

    #[tokio::test]
    async fn test_unreachable_servers() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let env = EnvSnapshot::from_pairs([(EnvVars::LICENSE_FILE, format!("{}@127.0.0.1", port))]);

        let err = check_license_servers(&env, Duration::from_millis(500)).await.unwrap_err();
        assert!(matches!(err, MapdlError::LicenseServerUnreachable { .. }));
    }
}
