//! Solver command lines.

use crate::config::LaunchDefaults;
use crate::options::{LaunchConfig, LaunchMode};
use crate::platform::TargetPlatform;
use std::path::{Path, PathBuf};

/// Inputs of a solver command line.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub exec_file: PathBuf,
    pub jobname: String,
    pub nproc: u32,
    /// Memory in gigabytes.
    pub ram: Option<f64>,
    pub port: u16,
    pub additional_switches: String,
    pub mode: LaunchMode,
}

impl CommandSpec {
    /// Take the command inputs from a resolved configuration.
    ///
    /// Returns `None` for configurations without an executable.
    pub fn from_config(config: &LaunchConfig) -> Option<Self> {
        Some(Self {
            exec_file: config.exec_file.clone()?,
            jobname: config.jobname.clone(),
            nproc: config.nproc,
            ram: config.ram,
            port: config.port,
            additional_switches: config.additional_switches.clone(),
            mode: config.mode,
        })
    }

    pub fn build(&self, platform: TargetPlatform) -> Vec<String> {
        build_command(self, platform)
    }
}

/// Build the argv that starts the solver.
///
/// gRPC: `exec -j <job> -np <n> [-m <MB>] [batch switches] <switches> -port <p> -grpc`,
/// where the batch switches (`-b -i .__tmp__.inp -o .__tmp__.out`) keep the
/// solver window hidden on Windows. Console: `exec -j <job> -np <n> <switches>`.
pub fn build_command(spec: &CommandSpec, platform: TargetPlatform) -> Vec<String> {
    let mut parts: Vec<String> = vec![
        "-j".into(),
        spec.jobname.clone(),
        "-np".into(),
        spec.nproc.to_string(),
    ];

    if spec.mode == LaunchMode::Console {
        parts.extend(split_switches(&spec.additional_switches));
        return with_exec(&spec.exec_file, parts);
    }

    if let Some(ram) = spec.ram {
        parts.push("-m".into());
        parts.push(ram_megabytes(ram).to_string());
    }

    if platform.is_windows() {
        parts.extend(
            [
                "-b",
                "-i",
                LaunchDefaults::WINDOWS_TMP_INPUT,
                "-o",
                LaunchDefaults::WINDOWS_TMP_OUTPUT,
            ]
            .map(String::from),
        );
    }

    parts.extend(split_switches(&spec.additional_switches));
    parts.push("-port".into());
    parts.push(spec.port.to_string());
    parts.push("-grpc".into());

    with_exec(&spec.exec_file, parts)
}

/// Gigabytes to the solver's megabyte workspace size.
pub fn ram_megabytes(ram: f64) -> i64 {
    (1024.0 * ram) as i64
}

fn split_switches(switches: &str) -> impl Iterator<Item = String> + '_ {
    switches.split_whitespace().map(String::from)
}

fn with_exec(exec_file: &Path, parts: Vec<String>) -> Vec<String> {
    let mut argv = Vec::with_capacity(parts.len() + 1);
    argv.push(exec_file.display().to_string());
    argv.extend(parts);
    argv
}

/// Render an argv as a single shell-like line for logs and errors.
pub fn display_command(argv: &[String]) -> String {
    argv.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> CommandSpec {
        CommandSpec {
            exec_file: PathBuf::from("/ansys_inc/v242/ansys/bin/ansys242"),
            jobname: "file".into(),
            nproc: 2,
            ram: None,
            port: 50052,
            additional_switches: String::new(),
            mode: LaunchMode::Grpc,
        }
    }

    #[test]
    fn test_posix_command() {
        let argv = build_command(&spec(), TargetPlatform::Posix);
        assert_eq!(
            argv,
            vec![
                "/ansys_inc/v242/ansys/bin/ansys242",
                "-j",
                "file",
                "-np",
                "2",
                "-port",
                "50052",
                "-grpc"
            ]
        );
    }

    #[test]
    fn test_ram_and_switches() {
        let mut spec = spec();
        spec.ram = Some(2.5);
        spec.additional_switches = " -smp  -p meba ".into();
        let argv = build_command(&spec, TargetPlatform::Posix);
        assert_eq!(
            &argv[1..],
            &["-j", "file", "-np", "2", "-m", "2560", "-smp", "-p", "meba", "-port", "50052", "-grpc"]
        );
    }

    #[test]
    fn test_windows_batch_switches() {
        let argv = build_command(&spec(), TargetPlatform::Windows);
        let b = argv.iter().position(|a| a == "-b").unwrap();
        assert_eq!(&argv[b..b + 5], &["-b", "-i", ".__tmp__.inp", "-o", ".__tmp__.out"]);
        assert_eq!(argv.last().unwrap(), "-grpc");
    }

    #[test]
    fn test_console_command() {
        let mut spec = spec();
        spec.mode = LaunchMode::Console;
        spec.ram = Some(1.0);
        spec.additional_switches = "-smp".into();
        let argv = build_command(&spec, TargetPlatform::Posix);
        assert_eq!(&argv[1..], &["-j", "file", "-np", "2", "-smp"]);
    }

    #[test]
    fn test_command_is_deterministic() {
        let spec = spec();
        assert_eq!(spec.build(TargetPlatform::Posix), spec.build(TargetPlatform::Posix));
    }
}
