//! Platform-specific process management.
//!
//! Liveness checks, forced termination, and scans of the process table for
//! running MAPDL solver processes.

// OpenProcess/CloseHandle on Windows are raw FFI calls.
#![cfg_attr(windows, allow(unsafe_code))]

use crate::error::{MapdlError, Result};
use std::path::PathBuf;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// Check if a process with the given PID is alive.
///
/// # Platform Behavior
/// - **Linux/macOS**: Uses `kill(pid, 0)` signal check
/// - **Windows**: Uses `OpenProcess` with `PROCESS_QUERY_LIMITED_INFORMATION`
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid as NixPid;

        // Signal 0 only checks that the process exists. EPERM means it exists
        // but belongs to someone else.
        matches!(kill(NixPid::from_raw(pid as i32), None), Ok(()) | Err(Errno::EPERM))
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Threading::{
            OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
        };

        // SAFETY: OpenProcess has no memory preconditions; a non-null handle is
        // owned by us and closed exactly once below.
        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if !handle.is_null() {
                CloseHandle(handle);
                true
            } else {
                false
            }
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        warn!("Process alive check not implemented for this platform");
        true
    }
}

/// How long [`kill_process`] waits for a killed process to disappear.
#[cfg(unix)]
const KILL_WAIT_MS: u64 = 2_000;

/// Kill a process immediately (SIGKILL / `taskkill /F`).
///
/// Returns `Ok(true)` when the process is gone, including when it had
/// already exited before the call. On Unix a killed child of this process
/// is reaped, and a zombie owned by another parent counts as gone.
pub fn kill_process(pid: u32) -> Result<bool> {
    if !is_process_alive(pid) {
        debug!("Process {} is not running", pid);
        return Ok(true);
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::sys::wait::{waitpid, WaitPidFlag};
        use nix::unistd::Pid as NixPid;
        use std::time::{Duration, Instant};

        let nix_pid = NixPid::from_raw(pid as i32);
        debug!("Sending SIGKILL to process {}", pid);
        match kill(nix_pid, Signal::SIGKILL) {
            Ok(()) => {}
            Err(nix::errno::Errno::ESRCH) => return Ok(true),
            Err(e) => {
                return Err(MapdlError::Internal(format!(
                    "Failed to kill process {}: {}",
                    pid, e
                )))
            }
        }
        // Delivery is asynchronous; our own children stay zombies until reaped
        let deadline = Instant::now() + Duration::from_millis(KILL_WAIT_MS);
        loop {
            let _ = waitpid(nix_pid, Some(WaitPidFlag::WNOHANG));
            if has_exited(pid) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                warn!("Process {} still running {}ms after SIGKILL", pid, KILL_WAIT_MS);
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[cfg(windows)]
    {
        taskkill(pid, false)
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(MapdlError::Internal(
            "Process termination not implemented for this platform".into(),
        ))
    }
}

#[cfg(windows)]
fn taskkill(pid: u32, tree: bool) -> Result<bool> {
    use std::process::Command;

    let pid_arg = pid.to_string();
    let mut args = vec!["/PID", pid_arg.as_str(), "/F"];
    if tree {
        args.push("/T");
    }
    debug!("Terminating process {} with taskkill", pid);

    let output = Command::new("taskkill")
        .args(&args)
        .output()
        .map_err(|e| MapdlError::Internal(format!("Failed to run taskkill: {}", e)))?;

    if output.status.success() {
        Ok(true)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // "not found" errors are OK - process already dead
        if stderr.contains("not found") || stderr.contains("not running") {
            Ok(true)
        } else {
            warn!("taskkill failed for {}: {}", pid, stderr);
            Ok(false)
        }
    }
}

/// Terminate a process and all of its descendants.
///
/// Children are killed before their parent so that none of them is
/// re-parented and left running.
///
/// # Platform Behavior
/// - **Linux/macOS**: SIGTERM to every process, then SIGKILL to survivors
///   after `timeout_ms`
/// - **Windows**: `taskkill /F /T`, which already handles the tree
pub fn terminate_process_tree(pid: u32, timeout_ms: u64) -> Result<bool> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid as NixPid;
        use std::time::{Duration, Instant};

        let mut pids = descendants(pid);
        pids.push(pid);

        for &p in &pids {
            if let Err(e) = kill(NixPid::from_raw(p as i32), Signal::SIGTERM) {
                if e != nix::errno::Errno::ESRCH {
                    warn!("Failed to send SIGTERM to {}: {}", p, e);
                }
            }
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        while Instant::now() < deadline {
            reap(&pids);
            if pids.iter().all(|&p| !is_process_alive(p)) {
                debug!("Process tree of {} terminated gracefully", pid);
                return Ok(true);
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        debug!("Process tree of {} still running, sending SIGKILL", pid);
        for &p in &pids {
            kill_process(p)?;
        }
        std::thread::sleep(Duration::from_millis(100));
        reap(&pids);
        Ok(!is_process_alive(pid))
    }

    #[cfg(windows)]
    {
        let _ = timeout_ms;
        taskkill(pid, true)
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = timeout_ms;
        kill_process(pid)
    }
}

#[cfg(unix)]
fn reap(pids: &[u32]) {
    use nix::sys::wait::{waitpid, WaitPidFlag};
    use nix::unistd::Pid as NixPid;

    for &p in pids {
        let _ = waitpid(NixPid::from_raw(p as i32), Some(WaitPidFlag::WNOHANG));
    }
}

/// True once `pid` no longer runs: absent, or a zombie waiting for its parent.
#[cfg(unix)]
fn has_exited(pid: u32) -> bool {
    if !is_process_alive(pid) {
        return true;
    }
    let sys_pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
    system
        .process(sys_pid)
        .map_or(true, |p| matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

/// All descendant PIDs of a process, deepest first.
pub fn descendants(pid: u32) -> Vec<u32> {
    let system = System::new_all();
    let mut found = Vec::new();
    collect_descendants(&system, Pid::from_u32(pid), &mut found);
    found.reverse();
    found
}

fn collect_descendants(system: &System, parent: Pid, pids: &mut Vec<u32>) {
    for (child_pid, child) in system.processes() {
        if child.parent() == Some(parent) {
            let child_u32 = child_pid.as_u32();
            if !pids.contains(&child_u32) {
                pids.push(child_u32);
                collect_descendants(system, *child_pid, pids);
            }
        }
    }
}

/// A running MAPDL solver process found in the process table.
#[derive(Debug, Clone)]
pub struct SolverProcess {
    pub pid: u32,
    pub name: String,
    pub cmdline: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub status: String,
    /// Number of descendant processes.
    pub children: usize,
}

impl SolverProcess {
    /// The gRPC port, taken from the argument following `-port`.
    pub fn grpc_port(&self) -> Option<u16> {
        self.cmdline
            .iter()
            .position(|arg| arg == "-port")
            .and_then(|i| self.cmdline.get(i + 1))
            .and_then(|p| p.parse().ok())
    }

    /// A launched MAPDL instance spawns at least two worker processes; the
    /// launcher scripts on top of it do not.
    pub fn is_instance(&self) -> bool {
        self.children >= 2
    }

    pub fn cmdline_string(&self) -> String {
        self.cmdline.join(" ")
    }
}

/// True for an MAPDL process started in gRPC mode.
pub fn is_solver_process(name: &str, cmdline: &[String]) -> bool {
    let name = name.to_lowercase();
    (name.starts_with("ansys") || name.starts_with("mapdl")) && cmdline.iter().any(|a| a == "-grpc")
}

/// Name and command line of a process, if it still exists.
pub fn process_identity(pid: u32) -> Option<(String, Vec<String>)> {
    let system = System::new_all();
    system.process(Pid::from_u32(pid)).map(|process| {
        (
            process.name().to_string_lossy().into_owned(),
            process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect(),
        )
    })
}

/// Every live MAPDL gRPC process on this machine.
pub fn list_solver_processes() -> Vec<SolverProcess> {
    let system = System::new_all();

    let mut found: Vec<SolverProcess> = system
        .processes()
        .iter()
        .filter_map(|(pid, process)| {
            let name = process.name().to_string_lossy().into_owned();
            let cmdline: Vec<String> = process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect();
            if !is_solver_process(&name, &cmdline) {
                return None;
            }
            if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
                return None;
            }

            let mut children = Vec::new();
            collect_descendants(&system, *pid, &mut children);

            Some(SolverProcess {
                pid: pid.as_u32(),
                name,
                cmdline,
                cwd: process.cwd().map(|p| p.to_path_buf()),
                status: process.status().to_string(),
                children: children.len(),
            })
        })
        .collect();

    found.sort_by_key(|p| p.pid);
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_process_alive_self() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_is_process_alive_nonexistent() {
        assert!(!is_process_alive(4_000_000_000));
        assert!(!is_process_alive(0));
    }

    #[test]
    fn test_kill_nonexistent() {
        assert!(kill_process(4_000_000_000).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_child_process() {
        let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert!(is_process_alive(pid));

        assert!(kill_process(pid).unwrap());
        assert!(!is_process_alive(pid));
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_reaps_child_without_sleeping() {
        for _ in 0..5 {
            let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
            let pid = child.id();
            assert!(kill_process(pid).unwrap());
            assert!(!is_process_alive(pid), "child {} left as a zombie", pid);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_process_tree() {
        let child = std::process::Command::new("sh")
            .args(["-c", "sleep 30 & sleep 30 & wait"])
            .spawn()
            .unwrap();
        let pid = child.id();
        std::thread::sleep(std::time::Duration::from_millis(200));

        assert!(terminate_process_tree(pid, 500).unwrap());
        assert!(!is_process_alive(pid));
    }

    #[test]
    fn test_is_solver_process() {
        let grpc = vec!["ansys222".to_string(), "-grpc".to_string()];
        assert!(is_solver_process("ANSYS222", &grpc));
        assert!(is_solver_process("mapdl", &grpc));
        assert!(!is_solver_process("python", &grpc));
        assert!(!is_solver_process("ansys222", &["ansys222".to_string()]));
    }

    #[test]
    fn test_solver_process_port() {
        let proc = SolverProcess {
            pid: 1,
            name: "ansys.exe".into(),
            cmdline: ["ansys", "-j", "file", "-port", "50053", "-grpc"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            cwd: None,
            status: "Run".into(),
            children: 3,
        };
        assert_eq!(proc.grpc_port(), Some(50053));
        assert!(proc.is_instance());
    }

    #[test]
    fn test_process_identity_self() {
        let (name, _) = process_identity(std::process::id()).unwrap();
        assert!(!name.is_empty());
    }
}
