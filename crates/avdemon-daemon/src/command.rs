//! External command execution
//!
//! Every interaction with the Android tooling goes through a [`CommandRunner`].
//! The production implementation, [`SystemCommandRunner`], resolves the tool
//! (SDK first, then `PATH`), runs it with a hard deadline and returns the
//! combined stdout/stderr text together with a structured [`CommandStatus`].
//!
//! Tools report many failures only in their text, so callers look for an error marker
//! with [`CommandOutput::has_error_marker`]; process-level failures are in the status.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;

use avdemon_core::prelude::*;

use crate::sdk::{self, SdkLocator};

/// Deadline for foreground commands
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to keep reading after the child exits.
/// `adb` may fork its server, which inherits and holds our pipes open.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Failure marker searched for (case-insensitively) in command output
pub const ERROR_MARKER: &str = "error";

/// External executables the engine drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    /// The emulator runtime (`emulator`)
    Emulator,
    /// The device bridge (`adb`)
    Adb,
    /// The image manager (`avdmanager`)
    AvdManager,
    /// Process listing
    Ps,
    /// Signal delivery by pid
    Kill,
    /// Signal delivery by command-line pattern
    Pkill,
}

impl Tool {
    /// Name looked up on `PATH`
    pub fn command_name(&self) -> &'static str {
        match self {
            Tool::Emulator => "emulator",
            Tool::Adb => "adb",
            Tool::AvdManager => "avdmanager",
            Tool::Ps => "ps",
            Tool::Kill => "kill",
            Tool::Pkill => "pkill",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command_name())
    }
}

/// Whether the caller waits for the command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Wait for exit or the deadline, capturing output
    Foreground,
    /// Spawn, detach and return immediately with empty output
    Background,
}

/// What happened to the child process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    /// Exited on its own; `None` when terminated by a signal
    Exited(Option<i32>),
    /// Killed at the deadline; output may be incomplete
    TimedOut,
    /// Background launch succeeded
    Spawned { pid: Option<u32> },
    /// The OS refused to start the executable
    SpawnFailed,
    /// Neither the SDK nor `PATH` had the tool
    Unresolvable,
}

/// Captured output of one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Interleaved stdout and stderr
    pub text: String,
    pub status: CommandStatus,
}

impl CommandOutput {
    pub fn exited(text: impl Into<String>, code: Option<i32>) -> Self {
        Self {
            text: text.into(),
            status: CommandStatus::Exited(code),
        }
    }

    /// Exit code 0 with the given output
    pub fn ok(text: impl Into<String>) -> Self {
        Self::exited(text, Some(0))
    }

    pub fn timeout(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: CommandStatus::TimedOut,
        }
    }

    pub fn spawned(pid: Option<u32>) -> Self {
        Self {
            text: String::new(),
            status: CommandStatus::Spawned { pid },
        }
    }

    pub fn spawn_failed(error: impl fmt::Display) -> Self {
        Self {
            text: format!("Error: {}", error),
            status: CommandStatus::SpawnFailed,
        }
    }

    pub fn unresolvable(tool: Tool) -> Self {
        Self {
            text: format!("Error: {} not found", tool),
            status: CommandStatus::Unresolvable,
        }
    }

    /// Exit code 0, or a successful background launch
    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            CommandStatus::Exited(Some(0)) | CommandStatus::Spawned { .. }
        )
    }

    pub fn is_timed_out(&self) -> bool {
        self.status == CommandStatus::TimedOut
    }

    pub fn is_unresolvable(&self) -> bool {
        self.status == CommandStatus::Unresolvable
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            CommandStatus::Exited(code) => code,
            _ => None,
        }
    }

    /// Text-based failure check kept for compatibility with tools that
    /// report failures on stdout with a zero exit code (e.g. `adb emu`).
    pub fn has_error_marker(&self) -> bool {
        self.text.to_ascii_lowercase().contains(ERROR_MARKER)
    }

    /// Trimmed, non-empty lines
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.lines().map(str::trim).filter(|l| !l.is_empty())
    }
}

/// Runs external tools on behalf of the engine
#[trait_variant::make(CommandRunner: Send)]
pub trait LocalCommandRunner {
    /// Run `tool` with `args`. Never fails: problems are reported through
    /// [`CommandOutput::status`] and an `Error:` prefixed text.
    async fn run(&self, tool: Tool, args: &[&str], mode: RunMode) -> CommandOutput;
}

/// [`CommandRunner`] backed by real processes
#[derive(Clone)]
pub struct SystemCommandRunner {
    locator: Arc<dyn SdkLocator>,
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(locator: Arc<dyn SdkLocator>) -> Self {
        Self {
            locator,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Override the foreground deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve `tool` to an executable: SDK location first (must exist on
    /// disk), then `PATH`.
    pub fn resolve(&self, tool: Tool) -> Option<PathBuf> {
        if let Some(root) = self.locator.sdk_root() {
            for candidate in sdk::tool_candidates(&root, tool) {
                if candidate.is_file() {
                    return Some(candidate);
                }
                trace!("{} not at {}", tool, candidate.display());
            }
        }

        match which::which(tool.command_name()) {
            Ok(path) => Some(path),
            Err(e) => {
                debug!("{} not found on PATH: {}", tool, e);
                None
            }
        }
    }
}

impl CommandRunner for SystemCommandRunner {
    async fn run(&self, tool: Tool, args: &[&str], mode: RunMode) -> CommandOutput {
        let Some(program) = self.resolve(tool) else {
            warn!("Cannot run '{} {}': tool not found", tool, args.join(" "));
            return CommandOutput::unresolvable(tool);
        };

        match mode {
            RunMode::Foreground => run_foreground(&program, args, self.timeout).await,
            RunMode::Background => spawn_background(&program, args),
        }
    }
}

/// Run `program` and wait for it, killing it once `timeout` elapses.
///
/// Output produced before the deadline is always returned; a timeout is not
/// an error, only a hint that the text may be incomplete.
pub async fn run_foreground(program: &Path, args: &[&str], timeout: Duration) -> CommandOutput {
    debug!("Executing: {} {}", program.display(), args.join(" "));

    let spawned = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            warn!("Failed to spawn {}: {}", program.display(), e);
            return CommandOutput::spawn_failed(e);
        }
    };

    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_lines(stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_lines(stderr, line_tx.clone()));
    }
    drop(line_tx);

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut text = String::new();
    let mut streams_open = true;
    let mut exit: Option<Option<i32>> = None;

    loop {
        tokio::select! {
            line = line_rx.recv(), if streams_open => match line {
                Some(line) => text.push_str(&line),
                None => streams_open = false,
            },
            status = child.wait(), if exit.is_none() => {
                let code = match status {
                    Ok(status) => status.code(),
                    Err(e) => {
                        warn!("Error waiting for {}: {}", program.display(), e);
                        None
                    }
                };
                exit = Some(code);

                let drain_until = Instant::now() + EXIT_DRAIN_GRACE;
                if drain_until < deadline.deadline() {
                    deadline.as_mut().reset(drain_until);
                }
            },
            _ = &mut deadline => break,
        }

        if exit.is_some() && !streams_open {
            break;
        }
    }

    if let Some(code) = exit {
        trace!("{} exited with {:?}", program.display(), code);
        return CommandOutput::exited(text, code);
    }

    warn!(
        "{} did not finish within {:?}, terminating",
        program.display(),
        timeout
    );
    if let Err(e) = child.kill().await {
        error!("Failed to kill {}: {}", program.display(), e);
    }
    while let Ok(Some(line)) = tokio::time::timeout(EXIT_DRAIN_GRACE, line_rx.recv()).await {
        text.push_str(&line);
    }

    CommandOutput::timeout(text)
}

/// Launch `program` detached from the caller.
///
/// The child is reaped by a background task and placed in its own process
/// group so a Ctrl+C aimed at us does not take it down.
pub fn spawn_background(program: &Path, args: &[&str]) -> CommandOutput {
    info!("Launching in background: {} {}", program.display(), args.join(" "));

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    command.process_group(0);

    match command.spawn() {
        Ok(mut child) => {
            let pid = child.id();
            let name = program.display().to_string();
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => debug!("Background {} exited: {}", name, status),
                    Err(e) => debug!("Error waiting for background {}: {}", name, e),
                }
            });
            CommandOutput::spawned(pid)
        }
        Err(e) => {
            warn!("Failed to launch {}: {}", program.display(), e);
            CommandOutput::spawn_failed(e)
        }
    }
}

/// Forward raw lines (newline included) from a child stream
async fn pump_lines<S>(stream: S, tx: mpsc::UnboundedSender<String>)
where
    S: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                    break;
                }
            }
            Err(e) => {
                trace!("stream read error: {}", e);
                break;
            }
        }
    }
}
