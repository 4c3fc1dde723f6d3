//! Platform abstraction layer for cross-platform compatibility.
//!
//! This module centralizes all platform-specific code to make it easy to find,
//! maintain, and extend. All `#[cfg]` blocks for OS-specific behavior should
//! live in this module rather than scattered throughout the codebase.
//!
//! # Architecture
//!
//! - `paths` - Per-user settings and license log directories
//! - `process` - Process management (liveness, signals, process table scans)

pub mod paths;
pub mod process;

pub use process::{
    is_process_alive, is_solver_process, kill_process, list_solver_processes,
    terminate_process_tree, SolverProcess,
};

use regex::Regex;
use std::process::Command;
use std::sync::LazyLock;
use tracing::debug;

/// Operating system a solver command line is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetPlatform {
    Posix,
    Windows,
}

impl TargetPlatform {
    /// The platform this binary runs on.
    pub fn current() -> Self {
        if cfg!(windows) {
            TargetPlatform::Windows
        } else {
            TargetPlatform::Posix
        }
    }

    pub fn is_windows(self) -> bool {
        self == TargetPlatform::Windows
    }
}

/// Returns the current platform name.
pub fn current_platform() -> &'static str {
    #[cfg(target_os = "linux")]
    {
        "linux"
    }
    #[cfg(target_os = "windows")]
    {
        "windows"
    }
    #[cfg(target_os = "macos")]
    {
        "macos"
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        "unknown"
    }
}

/// Returns true when running inside Windows Subsystem for Linux.
pub fn is_wsl() -> bool {
    if !cfg!(unix) {
        return false;
    }
    ["WSL_DISTRO_NAME", "WSL_INTEROP"]
        .iter()
        .any(|name| std::env::var(name).map(|v| !v.is_empty()).unwrap_or(false))
}

/// Returns true on Ubuntu hosts.
pub fn is_ubuntu() -> bool {
    if !cfg!(target_os = "linux") {
        return false;
    }
    match std::fs::read_to_string("/etc/os-release") {
        Ok(content) => os_release_is_ubuntu(&content),
        Err(e) => {
            debug!("Could not read /etc/os-release: {}", e);
            false
        }
    }
}

fn os_release_is_ubuntu(content: &str) -> bool {
    content.lines().any(|line| {
        line.strip_prefix("ID=")
            .map(|id| id.trim_matches('"').eq_ignore_ascii_case("ubuntu"))
            .unwrap_or(false)
    })
}

/// IP of the Windows host as seen from WSL, taken from the default route.
pub fn wsl_host_ip() -> Option<String> {
    let output = match Command::new("ip").arg("route").output() {
        Ok(o) => o,
        Err(e) => {
            debug!("Failed to run 'ip route': {}", e);
            return None;
        }
    };
    parse_ip_route(&String::from_utf8_lossy(&output.stdout))
}

static IPV4_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})").expect("ipv4 regex must compile")
});

fn parse_ip_route(output: &str) -> Option<String> {
    IPV4_RE.captures(output).map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_platform() {
        let platform = current_platform();
        assert!(["linux", "windows", "macos", "unknown"].contains(&platform));
    }

    #[test]
    fn test_target_platform_matches_host() {
        assert_eq!(TargetPlatform::current().is_windows(), cfg!(windows));
    }

    #[test]
    fn test_parse_ip_route() {
        let output = "default via 172.25.16.1 dev eth0 proto kernel\n\
                      172.25.16.0/20 dev eth0 proto kernel scope link src 172.25.21.7\n";
        assert_eq!(parse_ip_route(output).as_deref(), Some("172.25.16.1"));
        assert_eq!(parse_ip_route("no routes"), None);
    }

    #[test]
    fn test_os_release_is_ubuntu() {
        assert!(os_release_is_ubuntu("NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\n"));
        assert!(os_release_is_ubuntu("ID=\"ubuntu\"\n"));
        assert!(!os_release_is_ubuntu("ID=fedora\nID_LIKE=\"ubuntu\"\n"));
    }
}
