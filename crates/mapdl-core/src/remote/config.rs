//! Instance manager configuration file.
//!
//! The file named by `ANSYS_PLATFORM_INSTANCEMANAGEMENT_CONFIG` looks like:
//!
//! ```json
//! {
//!   "version": 1,
//!   "pim": {
//!     "uri": "dns:pim.example.com:443",
//!     "headers": [["authorization", "Bearer ..."]],
//!     "tls": true
//!   }
//! }
//! ```

use crate::error::{MapdlError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

const SUPPORTED_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigFile {
    version: u32,
    pim: InstanceManagerConfig,
}

/// Where the instance manager lives and how to talk to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceManagerConfig {
    pub uri: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub tls: bool,
}

impl InstanceManagerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| MapdlError::io_with_path(e, path))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(content)?;
        if file.version != SUPPORTED_VERSION {
            return Err(MapdlError::InstanceManager {
                message: format!(
                    "unsupported configuration version {} (expected {})",
                    file.version, SUPPORTED_VERSION
                ),
            });
        }
        if file.pim.uri.trim().is_empty() {
            return Err(MapdlError::InstanceManager {
                message: "configuration has an empty uri".into(),
            });
        }
        Ok(file.pim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_config() {
        let config = InstanceManagerConfig::parse(
            r#"{"version": 1, "pim": {"uri": "dns:pim:50001", "headers": [["a", "b"]], "tls": false}}"#,
        )
        .unwrap();
        assert_eq!(config.uri, "dns:pim:50001");
        assert_eq!(config.headers, vec![("a".to_string(), "b".to_string())]);
        assert!(!config.tls);
    }

    #[test]
    fn test_defaults_and_rejections() {
        let config = InstanceManagerConfig::parse(r#"{"version": 1, "pim": {"uri": "pim:1"}}"#).unwrap();
        assert!(config.headers.is_empty());

        assert!(matches!(
            InstanceManagerConfig::parse(r#"{"version": 2, "pim": {"uri": "pim:1"}}"#),
            Err(MapdlError::InstanceManager { .. })
        ));
        assert!(InstanceManagerConfig::parse(r#"{"version": 1, "pim": {"uri": " "}}"#).is_err());
        assert!(matches!(
            InstanceManagerConfig::parse("not json"),
            Err(MapdlError::Json { .. })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = InstanceManagerConfig::load(&dir.path().join("pim.json")).unwrap_err();
        assert!(err.is_not_found());
    }
}
