//! `mapdl` - start, stop and list MAPDL solver instances from a shell.

mod args;
mod commands;
mod console;

use anyhow::Result;
use args::{Cli, Command};
use clap::Parser;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let outcome = match cli.command {
        Command::Start(args) => commands::start(args).await,
        Command::Stop(args) => commands::stop(args),
        Command::List(args) => commands::list(args),
    };

    if let Err(e) = outcome {
        console::error(&format!("{:#}", e))?;
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::WARN };
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(level.as_str()),
    };
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
