//! Subcommand implementations.

use crate::args::{ListArgs, StartArgs, StopArgs};
use crate::console;
use anyhow::{bail, Result};
use mapdl_core::config::EnvVars;
use mapdl_core::platform::{self, SolverProcess};
use mapdl_core::{launch_mapdl_with, EnvSnapshot, LaunchOptions, LaunchServices};
use std::time::Duration;
use tracing::debug;

/// Grace period between SIGTERM and SIGKILL when stopping an instance.
const STOP_GRACE_MS: u64 = 2_000;

pub fn start_options(args: StartArgs) -> LaunchOptions {
    let mut opts = LaunchOptions::new()
        .with_start_instance(true)
        .with_just_launch(true)
        .with_override_lock(args.override_lock);
    if let Some(exec) = args.exec_file {
        opts = opts.with_exec_file(exec);
    }
    if let Some(dir) = args.run_location {
        opts = opts.with_run_location(dir);
    }
    if let Some(jobname) = args.jobname {
        opts = opts.with_jobname(jobname);
    }
    if let Some(nproc) = args.nproc {
        opts = opts.with_nproc(nproc);
    }
    if let Some(ram) = args.ram {
        opts = opts.with_ram(ram);
    }
    if let Some(port) = args.port {
        opts = opts.with_port(port);
    }
    if let Some(switches) = args.additional_switches {
        opts = opts.with_additional_switches(switches);
    }
    if let Some(secs) = args.start_timeout {
        opts = opts.with_start_timeout(Duration::from_secs(secs));
    }
    if let Some(license) = args.license_type {
        opts = opts.with_license_type(license);
    }
    if let Some(version) = args.version {
        opts = opts.with_version(version);
    }
    opts
}

pub async fn start(args: StartArgs) -> Result<()> {
    let opts = start_options(args);
    // A shell launch always starts a process, whatever the environment says
    let env = EnvSnapshot::from_process().without(EnvVars::START_INSTANCE);
    let services = LaunchServices::default().with_env(env);

    let session = launch_mapdl_with(&opts, services).await?;
    let ip = session.ip().to_string();
    let port = session.port();
    let pid = session
        .detach()
        .map_or_else(|| "unknown".to_string(), |pid| pid.to_string());

    console::success(&format!(
        "Launched an MAPDL instance (PID={}) at {}:{}",
        pid, ip, port
    ))
}

pub fn stop(args: StopArgs) -> Result<()> {
    let processes = platform::list_solver_processes();
    debug!("Found {} MAPDL processes", processes.len());

    if args.all {
        if processes.is_empty() {
            bail!("No Ansys instances are running.");
        }
        for process in &processes {
            terminate(process.pid)?;
        }
        return console::success("Ansys instances have been stopped.");
    }

    if let Some(pid) = args.pid {
        let Some((name, cmdline)) = platform::process::process_identity(pid) else {
            bail!("No process with PID {} was found.", pid);
        };
        if !platform::is_solver_process(&name, &cmdline) {
            bail!("PID {} ({}) is not an MAPDL instance.", pid, name);
        }
        terminate(pid)?;
        return console::success(&format!("The process with PID {} and its children have been stopped.", pid));
    }

    let on_port: Vec<&SolverProcess> = processes
        .iter()
        .filter(|p| p.grpc_port() == Some(args.port))
        .collect();
    if on_port.is_empty() {
        bail!("No Ansys instances running on port {}.", args.port);
    }
    for process in on_port {
        terminate(process.pid)?;
    }
    console::success(&format!("Ansys instances running on port {} have been stopped.", args.port))
}

fn terminate(pid: u32) -> Result<()> {
    if !platform::terminate_process_tree(pid, STOP_GRACE_MS)? {
        console::warn(&format!("Process {} did not stop.", pid))?;
    }
    Ok(())
}

pub fn list(args: ListArgs) -> Result<()> {
    let processes: Vec<SolverProcess> = platform::list_solver_processes()
        .into_iter()
        .filter(|p| !args.instances || p.is_instance())
        .collect();

    if processes.is_empty() {
        return console::warn("No MAPDL processes found.");
    }

    let show_cmd = args.long || args.cmd;
    let show_location = args.long || args.location;
    print!("{}", render_table(&processes, show_cmd, show_location));
    Ok(())
}

pub fn render_table(processes: &[SolverProcess], show_cmd: bool, show_location: bool) -> String {
    let mut header = vec!["Name", "Is Instance", "Status", "gRPC port", "PID"];
    if show_cmd {
        header.push("Command line");
    }
    if show_location {
        header.push("Working directory");
    }

    let rows: Vec<Vec<String>> = processes
        .iter()
        .map(|p| {
            let mut row = vec![
                p.name.clone(),
                p.is_instance().to_string(),
                p.status.clone(),
                p.grpc_port().map(|port| port.to_string()).unwrap_or_default(),
                p.pid.to_string(),
            ];
            if show_cmd {
                row.push(p.cmdline_string());
            }
            if show_location {
                row.push(
                    p.cwd
                        .as_ref()
                        .map(|dir| dir.display().to_string())
                        .unwrap_or_default(),
                );
            }
            row
        })
        .collect();

    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    let mut out = String::new();
    push_row(&mut out, header.iter().copied(), &widths);
    push_row(&mut out, rule.iter().map(String::as_str), &widths);
    for row in &rows {
        push_row(&mut out, row.iter().map(String::as_str), &widths);
    }
    out
}

fn push_row<'a>(out: &mut String, cells: impl Iterator<Item = &'a str>, widths: &[usize]) {
    let line: Vec<String> = cells
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell, width = width))
        .collect();
    out.push_str(line.join("  ").trim_end());
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn solver(pid: u32, port: &str, children: usize) -> SolverProcess {
        SolverProcess {
            pid,
            name: "ansys.exe".into(),
            cmdline: vec![
                "ansys.exe".into(),
                "-grpc".into(),
                "-port".into(),
                port.into(),
            ],
            cwd: Some(PathBuf::from("/tmp/run")),
            status: "Sleeping".into(),
            children,
        }
    }

    #[test]
    fn test_start_options_force_a_local_launch() {
        let opts = start_options(StartArgs {
            nproc: Some(4),
            port: Some(50060),
            start_timeout: Some(90),
            ..Default::default()
        });
        assert_eq!(opts.start_instance, Some(true));
        assert!(opts.just_launch);
        assert_eq!(opts.nproc, Some(4));
        assert_eq!(opts.port, Some(50060));
        assert_eq!(opts.start_timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_render_table_basic_columns() {
        let table = render_table(&[solver(4321, "50052", 3)], false, false);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Name"));
        assert!(lines[0].contains("gRPC port"));
        assert!(!lines[0].contains("Command line"));
        assert!(lines[2].contains("true"));
        assert!(lines[2].contains("50052"));
        assert!(lines[2].ends_with("4321"));
    }

    #[test]
    fn test_render_table_long_columns() {
        let table = render_table(&[solver(7, "50053", 0)], true, true);
        assert!(table.contains("Command line"));
        assert!(table.contains("Working directory"));
        assert!(table.contains("ansys.exe -grpc -port 50053"));
        assert!(table.contains("/tmp/run"));
        assert!(table.contains("false"));
    }
}
