//! Discovery of installed solver releases.

use super::version::{SolverVersion, SUPPORTED_VERSIONS};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default installation roots on POSIX hosts.
const POSIX_INSTALL_ROOTS: [&str; 2] = ["/usr/ansys_inc", "/ansys_inc"];

/// An installed release.
#[derive(Debug, Clone, PartialEq)]
pub struct Installation {
    pub version: SolverVersion,
    /// The `v<XYZ>` directory.
    pub root: PathBuf,
    pub student: bool,
}

impl Installation {
    /// Path of the solver executable inside this installation.
    pub fn exec_file(&self) -> PathBuf {
        let v = self.version.as_u32();
        if cfg!(windows) {
            self.root
                .join("ansys")
                .join("bin")
                .join("winx64")
                .join(format!("ansys{}.exe", v))
        } else {
            self.root.join("ansys").join("bin").join(format!("ansys{}", v))
        }
    }
}

/// Scans installation roots for `v<XYZ>` directories.
#[derive(Debug, Clone, Default)]
pub struct InstallationScanner {
    roots: Vec<PathBuf>,
    // Explicit per-version roots (`AWP_ROOT<XYZ>`), checked first
    version_roots: Vec<(u32, PathBuf)>,
}

impl InstallationScanner {
    /// Scanner over the platform default locations.
    pub fn system() -> Self {
        let version_roots = SUPPORTED_VERSIONS
            .iter()
            .filter_map(|(v, _)| {
                std::env::var_os(format!("AWP_ROOT{}", v)).map(|p| (*v, PathBuf::from(p)))
            })
            .collect();

        let roots = if cfg!(windows) {
            std::env::var_os("PROGRAMFILES")
                .map(|pf| vec![PathBuf::from(pf).join("ANSYS Inc")])
                .unwrap_or_default()
        } else {
            POSIX_INSTALL_ROOTS.iter().map(PathBuf::from).collect()
        };

        Self {
            roots,
            version_roots,
        }
    }

    /// Scanner over explicit roots only.
    pub fn with_roots(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            version_roots: Vec::new(),
        }
    }

    /// Every installation found, newest first. Student installs sort after
    /// regular ones.
    pub fn installations(&self) -> Vec<Installation> {
        let mut found: Vec<Installation> = Vec::new();

        for (version, root) in &self.version_roots {
            if root.is_dir() {
                push_unique(
                    &mut found,
                    Installation {
                        version: SolverVersion::unchecked(*version),
                        root: root.clone(),
                        student: is_student_path(root),
                    },
                );
            }
        }

        for base in &self.roots {
            let Ok(entries) = std::fs::read_dir(base) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                if let Some(version) = version_dir(&path) {
                    push_unique(
                        &mut found,
                        Installation {
                            version,
                            student: is_student_path(&path),
                            root: path,
                        },
                    );
                }
            }
        }

        found.sort_by(|a, b| a.student.cmp(&b.student).then(b.version.cmp(&a.version)));
        debug!("Found {} installed release(s)", found.len());
        found
    }

    /// Executable of the requested release, or of the newest one.
    pub fn find(&self, version: Option<SolverVersion>) -> Option<PathBuf> {
        self.installations()
            .into_iter()
            .find(|inst| version.map(|v| v == inst.version).unwrap_or(true))
            .map(|inst| inst.exec_file())
    }
}

fn push_unique(found: &mut Vec<Installation>, inst: Installation) {
    if !found.iter().any(|f| f.root == inst.root) {
        found.push(inst);
    }
}

fn version_dir(path: &Path) -> Option<SolverVersion> {
    let name = path.file_name()?.to_str()?;
    let digits = name.strip_prefix('v').or_else(|| name.strip_prefix('V'))?;
    if digits.len() != 3 {
        return None;
    }
    digits.parse().ok().map(SolverVersion::unchecked)
}

fn is_student_path(path: &Path) -> bool {
    path.to_string_lossy().to_lowercase().contains("student")
}
