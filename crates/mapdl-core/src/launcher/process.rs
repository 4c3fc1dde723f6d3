//! Spawning the solver and draining its output.

use super::command::display_command;
use crate::cancel::CancellationToken;
use crate::error::{MapdlError, Result};
use crate::options::ChildEnv;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Disables the solver's pop-up error dialogs.
const NO_DIAG_VAR: &str = "ANS_CMD_NODIAG";

/// The most recent lines captured from the solver's stdout and stderr, in
/// arrival order. Older lines are dropped once [`OutputLog::MAX_LINES`] is
/// reached.
#[derive(Debug, Clone, Default)]
pub struct OutputLog {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl OutputLog {
    pub const MAX_LINES: usize = 2_000;

    pub fn new() -> Self {
        Self::default()
    }

    fn lines(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lines();
        if lines.len() == Self::MAX_LINES {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Everything still held, one line per entry.
    pub fn text(&self) -> String {
        self.lines()
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }

    pub fn len(&self) -> usize {
        self.lines().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines().is_empty()
    }
}

/// How the child's standard streams are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    /// stdin closed; stdout and stderr drained into the [`OutputLog`].
    Drained,
    /// stdin and stdout kept for a console session; stderr drained.
    Interactive,
}

/// What to spawn and where.
#[derive(Debug, Clone)]
pub struct SpawnRequest<'a> {
    pub argv: &'a [String],
    pub run_location: &'a Path,
    pub jobname: &'a str,
    pub env: &'a ChildEnv,
    pub stdio: StdioMode,
    /// Also append every captured line to this file.
    pub output_file: Option<&'a Path>,
}

type SharedFile = Arc<tokio::sync::Mutex<tokio::fs::File>>;

/// A solver process owned by this launcher.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    run_location: PathBuf,
    jobname: String,
    command: String,
    output: OutputLog,
    console: Option<(ChildStdout, ChildStdin)>,
    drains: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl ProcessHandle {
    /// Start the process. Output draining starts immediately.
    pub fn spawn(request: SpawnRequest<'_>) -> Result<Self> {
        let (program, args) = request
            .argv
            .split_first()
            .ok_or_else(|| MapdlError::Internal("empty solver command line".into()))?;
        let command_line = display_command(request.argv);

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(request.run_location);
        request.env.apply(&mut cmd);
        if request.env.get(NO_DIAG_VAR).is_none() {
            cmd.env(NO_DIAG_VAR, "TRUE");
        }

        match request.stdio {
            StdioMode::Drained => cmd.stdin(Stdio::null()),
            StdioMode::Interactive => cmd.stdin(Stdio::piped()),
        };
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        info!(
            "Running an MAPDL instance\nLocation: {}\nCommand: {}",
            request.run_location.display(),
            command_line
        );

        let mut child = cmd.spawn().map_err(|e| MapdlError::SpawnFailed {
            command: command_line.clone(),
            message: e.to_string(),
            source: Some(e),
        })?;
        let pid = child
            .id()
            .ok_or_else(|| MapdlError::Internal("solver exited before its PID was read".into()))?;
        debug!("Solver started with PID {}", pid);

        let file = match request.output_file {
            Some(path) => {
                let file = std::fs::File::create(path).map_err(|e| MapdlError::io_with_path(e, path))?;
                Some(Arc::new(tokio::sync::Mutex::new(tokio::fs::File::from_std(file))))
            }
            None => None,
        };

        let output = OutputLog::new();
        let cancel = CancellationToken::new();
        let mut drains = Vec::new();

        let stdout = child.stdout.take();
        let stdin = child.stdin.take();
        let console = match (request.stdio, stdout, stdin) {
            (StdioMode::Interactive, Some(stdout), Some(stdin)) => Some((stdout, stdin)),
            (_, stdout, _) => {
                if let Some(stdout) = stdout {
                    drains.push(drain(stdout, "stdout", output.clone(), file.clone(), cancel.clone()));
                }
                None
            }
        };
        if let Some(stderr) = child.stderr.take() {
            drains.push(drain(stderr, "stderr", output.clone(), file, cancel.clone()));
        }

        Ok(Self {
            child,
            pid,
            run_location: request.run_location.to_path_buf(),
            jobname: request.jobname.to_string(),
            command: command_line,
            output,
            console,
            drains,
            cancel,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn run_location(&self) -> &Path {
        &self.run_location
    }

    pub fn jobname(&self) -> &str {
        &self.jobname
    }

    /// The command line, space separated.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn output(&self) -> &OutputLog {
        &self.output
    }

    /// True while the process has not exited.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// The console streams, once. `None` unless spawned [`StdioMode::Interactive`].
    pub fn take_console_io(&mut self) -> Option<(ChildStdout, ChildStdin)> {
        self.console.take()
    }

    /// Build a [`MapdlError::DidNotStart`] carrying this process's diagnostics.
    pub fn did_not_start(&self, reason: impl Into<String>) -> MapdlError {
        MapdlError::DidNotStart {
            reason: reason.into(),
            run_location: self.run_location.clone(),
            command: self.command.clone(),
            output: self.output.text(),
        }
    }

    /// Kill the process and stop the drain tasks.
    pub async fn kill(&mut self) -> Result<()> {
        if self.is_alive() {
            debug!("Killing solver process {}", self.pid);
            if let Err(e) = self.child.kill().await {
                if self.is_alive() {
                    return Err(MapdlError::Internal(format!(
                        "Failed to kill solver process {}: {}",
                        self.pid, e
                    )));
                }
            }
        }
        self.stop_drains().await;
        Ok(())
    }

    /// Cancel and join the drain tasks.
    pub async fn stop_drains(&mut self) {
        self.cancel.cancel();
        for task in self.drains.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Output drain task failed: {}", e);
                }
            }
        }
    }

    /// Let the drains read what is left in the pipes of an exited process.
    pub async fn collect_output(&mut self, grace: Duration) {
        for task in self.drains.drain(..) {
            if tokio::time::timeout(grace, task).await.is_err() {
                debug!("Output of process {} still open after {:?}", self.pid, grace);
            }
        }
        self.cancel.cancel();
    }

    /// Leave the process running after this handle is dropped.
    pub fn detach(mut self) -> u32 {
        self.drains.clear();
        self.pid
    }
}

fn drain<R>(
    reader: R,
    stream: &'static str,
    output: OutputLog,
    file: Option<SharedFile>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = lines.next_line() => next,
            };
            match next {
                Ok(Some(line)) => {
                    debug!("[{}] {}", stream, line);
                    if let Some(file) = &file {
                        let mut file = file.lock().await;
                        if let Err(e) = file.write_all(format!("{}\n", line).as_bytes()).await {
                            warn!("Failed to write solver output to file: {}", e);
                        }
                    }
                    output.push(line);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Error reading solver {}: {}", stream, e);
                    break;
                }
            }
        }
        if let Some(file) = &file {
            let _ = file.lock().await.flush().await;
        }
    })
}
