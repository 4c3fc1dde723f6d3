use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mapdl", version, about = "Start, stop and list MAPDL instances", long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Launch an MAPDL instance in gRPC mode and leave it running.
    Start(StartArgs),
    /// Stop MAPDL instances by port, PID, or all of them.
    Stop(StopArgs),
    /// List the MAPDL processes running on this machine.
    List(ListArgs),
}

#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// MAPDL executable. Found from the installed versions when omitted.
    #[arg(long, value_name = "PATH")]
    pub exec_file: Option<PathBuf>,

    /// Working directory of the solver. A temporary directory when omitted.
    #[arg(long, value_name = "DIR")]
    pub run_location: Option<PathBuf>,

    /// Job name
    #[arg(long)]
    pub jobname: Option<String>,

    /// Number of processors
    #[arg(long)]
    pub nproc: Option<u32>,

    /// Memory in gigabytes
    #[arg(long)]
    pub ram: Option<f64>,

    /// gRPC port. The first free port from 50052 when omitted.
    #[arg(long)]
    pub port: Option<u16>,

    /// Extra command line switches passed to MAPDL verbatim
    #[arg(long, allow_hyphen_values = true)]
    pub additional_switches: Option<String>,

    /// Seconds to wait for the instance to start
    #[arg(long, value_name = "SECONDS")]
    pub start_timeout: Option<u64>,

    /// License type requested with `-p`
    #[arg(long)]
    pub license_type: Option<String>,

    /// MAPDL version, for example `222` or `22.2`
    #[arg(long)]
    pub version: Option<String>,

    /// Remove a lock file left in the run location
    #[arg(long = "override")]
    pub override_lock: bool,
}

#[derive(Args, Debug)]
pub struct StopArgs {
    /// Stop the instance listening on this port
    #[arg(long, default_value_t = 50052, conflicts_with_all = ["pid", "all"])]
    pub port: u16,

    /// Stop this process and its children
    #[arg(long, conflicts_with = "all")]
    pub pid: Option<u32>,

    /// Stop every MAPDL instance
    #[arg(long)]
    pub all: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only show solver instances, not the launcher processes around them
    #[arg(short, long)]
    pub instances: bool,

    /// Show the command line and working directory
    #[arg(short, long)]
    pub long: bool,

    /// Show the command line
    #[arg(short, long)]
    pub cmd: bool,

    /// Show the working directory
    #[arg(long)]
    pub location: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_flags_parse() {
        let cli = Cli::try_parse_from([
            "mapdl",
            "start",
            "--nproc",
            "4",
            "--port",
            "50060",
            "--additional-switches",
            "-smp",
            "--override",
        ])
        .unwrap();
        match cli.command {
            Command::Start(args) => {
                assert_eq!(args.nproc, Some(4));
                assert_eq!(args.port, Some(50060));
                assert_eq!(args.additional_switches.as_deref(), Some("-smp"));
                assert!(args.override_lock);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_stop_defaults_to_port_50052() {
        let cli = Cli::try_parse_from(["mapdl", "stop"]).unwrap();
        match cli.command {
            Command::Stop(args) => {
                assert_eq!(args.port, 50052);
                assert!(args.pid.is_none());
                assert!(!args.all);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_stop_pid_and_all_conflict() {
        assert!(Cli::try_parse_from(["mapdl", "stop", "--pid", "10", "--all"]).is_err());
    }

    #[test]
    fn test_debug_is_global() {
        let cli = Cli::try_parse_from(["mapdl", "list", "--debug", "--long"]).unwrap();
        assert!(cli.debug);
    }
}
