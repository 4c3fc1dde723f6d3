//! Lookup of the process listening on a TCP port.
//!
//! # Platform Behavior
//! - **Linux**: socket inodes from `/proc/net/tcp{,6}` matched against
//!   `/proc/<pid>/fd` links
//! - **macOS**: `lsof -nP -iTCP:<port> -sTCP:LISTEN -t`
//! - **Windows**: `netstat -ano -p TCP`

use crate::platform::process::{is_solver_process, process_identity};
use tracing::debug;

/// The process holding a port.
#[derive(Debug, Clone, PartialEq)]
pub struct PortOwner {
    pub pid: u32,
    pub name: String,
    pub cmdline: Vec<String>,
}

impl PortOwner {
    /// True when the owner is an MAPDL gRPC process.
    pub fn is_solver(&self) -> bool {
        is_solver_process(&self.name, &self.cmdline)
    }
}

/// Find the process listening on `port`, if it can be determined.
pub fn find_owner(port: u16) -> Option<PortOwner> {
    let pid = owner_pid(port)?;
    let (name, cmdline) = process_identity(pid)?;
    debug!("Port {} is held by '{}' (PID {})", port, name, pid);
    Some(PortOwner { pid, name, cmdline })
}

#[cfg(target_os = "linux")]
fn owner_pid(port: u16) -> Option<u32> {
    let mut inodes = Vec::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(content) = std::fs::read_to_string(table) {
            inodes.extend(listening_inodes(&content, port));
        }
    }
    if inodes.is_empty() {
        return None;
    }

    let targets: Vec<String> = inodes.iter().map(|i| format!("socket:[{}]", i)).collect();
    let proc_dir = std::fs::read_dir("/proc").ok()?;
    for entry in proc_dir.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // Other users' fd directories are unreadable; skip them
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            if let Ok(link) = std::fs::read_link(fd.path()) {
                let link = link.to_string_lossy();
                if targets.iter().any(|t| *t == link) {
                    return Some(pid);
                }
            }
        }
    }
    None
}

/// Inodes of sockets in LISTEN state bound to `port` in a `/proc/net/tcp` table.
#[cfg(any(target_os = "linux", test))]
fn listening_inodes(table: &str, port: u16) -> Vec<u64> {
    const LISTEN: &str = "0A";

    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let state = fields.get(3)?;
            let inode = fields.get(9)?;
            let (_, port_hex) = local.rsplit_once(':')?;
            let local_port = u16::from_str_radix(port_hex, 16).ok()?;
            if local_port == port && *state == LISTEN {
                inode.parse::<u64>().ok().filter(|i| *i != 0)
            } else {
                None
            }
        })
        .collect()
}

#[cfg(target_os = "macos")]
fn owner_pid(port: u16) -> Option<u32> {
    let output = std::process::Command::new("lsof")
        .args(["-nP", &format!("-iTCP:{}", port), "-sTCP:LISTEN", "-t"])
        .output()
        .ok()?;
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find_map(|l| l.trim().parse().ok())
}

#[cfg(windows)]
fn owner_pid(port: u16) -> Option<u32> {
    let output = std::process::Command::new("netstat")
        .args(["-ano", "-p", "TCP"])
        .output()
        .ok()?;
    netstat_owner(&String::from_utf8_lossy(&output.stdout), port)
}

/// PID of the LISTENING row whose local address ends in `:port`.
#[cfg(any(windows, test))]
fn netstat_owner(output: &str, port: u16) -> Option<u32> {
    let suffix = format!(":{}", port);
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [_proto, local, _remote, state, pid] if local.ends_with(&suffix) && *state == "LISTENING" => {
                pid.parse().ok()
            }
            _ => None,
        }
    })
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn owner_pid(_port: u16) -> Option<u32> {
    None
}
