//! MAPDL release numbers.

use crate::error::{MapdlError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

/// Supported releases, newest first, with their marketing names.
pub const SUPPORTED_VERSIONS: [(u32, &str); 17] = [
    (252, "2025R2"),
    (251, "2025R1"),
    (242, "2024R2"),
    (241, "2024R1"),
    (232, "2023R2"),
    (231, "2023R1"),
    (222, "2022R2"),
    (221, "2022R1"),
    (212, "2021R2"),
    (211, "2021R1"),
    (202, "2020R2"),
    (201, "2020R1"),
    (195, "19.5"),
    (194, "19.4"),
    (193, "19.3"),
    (192, "19.2"),
    (191, "19.1"),
];

static EXEC_VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:v|ansys|mapdl)(\d{3})").expect("exec version regex must compile")
});

/// A solver release in its three digit form (`222` is 22.2, 2022R2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SolverVersion(u32);

impl SolverVersion {
    /// Build a version, checking it is supported.
    pub fn new(version: u32) -> Result<Self> {
        if SUPPORTED_VERSIONS.iter().any(|(v, _)| *v == version) {
            Ok(Self(version))
        } else {
            Err(unsupported(version.to_string()))
        }
    }

    /// Build a version without checking support. Used for values read
    /// from installed executables.
    pub(crate) fn unchecked(version: u32) -> Self {
        Self(version)
    }

    /// Parse user input.
    ///
    /// Accepts `latest` (returns `None`), `222`, `22.2` and `2022R2`.
    pub fn parse(input: &str) -> Result<Option<Self>> {
        let value = input.trim().to_uppercase();
        if value == "LATEST" {
            return Ok(None);
        }

        if let Ok(int) = value.parse::<u32>() {
            return Self::new(int).map(Some);
        }

        if let Some((v, _)) = SUPPORTED_VERSIONS
            .iter()
            .find(|(v, name)| *name == value || format!("{:.1}", *v as f64 / 10.0) == value)
        {
            return Ok(Some(Self(*v)));
        }

        Err(unsupported(input.trim().to_string()))
    }

    /// Version embedded in an executable path such as
    /// `/usr/ansys_inc/v222/ansys/bin/ansys222`.
    pub fn from_exec_path(path: &Path) -> Option<Self> {
        let text = path.to_string_lossy();
        EXEC_VERSION_RE
            .captures_iter(&text)
            .filter_map(|caps| caps[1].parse::<u32>().ok())
            .last()
            .map(Self)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Marketing name, e.g. `2022R2`.
    pub fn release_name(self) -> String {
        SUPPORTED_VERSIONS
            .iter()
            .find(|(v, _)| *v == self.0)
            .map(|(_, name)| name.to_string())
            .unwrap_or_else(|| self.to_string())
    }
}

impl fmt::Display for SolverVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0 / 10, self.0 % 10)
    }
}

fn unsupported(version: String) -> MapdlError {
    let supported: Vec<String> = SUPPORTED_VERSIONS
        .iter()
        .map(|(v, _)| v.to_string())
        .collect();
    MapdlError::UnsupportedVersion {
        version,
        message: format!("MAPDL version must be one of: {}", supported.join(", ")),
    }
}
