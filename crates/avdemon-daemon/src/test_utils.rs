//! Test utilities for driving the engine without real Android tooling
//!
//! [`FakeRunner`] answers commands from a script that tests may change at any
//! point (e.g. "the emulator has now booted"), and records every call.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use crate::command::{CommandOutput, CommandRunner, RunMode, Tool};

/// One recorded invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub tool: Tool,
    pub args: Vec<String>,
    pub mode: RunMode,
}

impl RecordedCall {
    /// Arguments joined with single spaces
    pub fn command_line(&self) -> String {
        self.args.join(" ")
    }
}

/// Scripted [`CommandRunner`]
///
/// Lookup order: unresolvable tools, then the exact `(tool, args)` script, then
/// a tool-wide script, then an empty success (`Spawned` for background calls).
#[derive(Debug, Default)]
pub struct FakeRunner {
    exact: Mutex<HashMap<(Tool, String), CommandOutput>>,
    tool_wide: Mutex<HashMap<Tool, CommandOutput>>,
    missing: Mutex<HashSet<Tool>>,
    latency: Mutex<Duration>,
    tool_latency: Mutex<HashMap<Tool, Duration>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the answer for `tool` invoked with exactly `args`
    pub fn respond(&self, tool: Tool, args: &[&str], output: CommandOutput) {
        lock(&self.exact).insert((tool, args.join(" ")), output);
    }

    /// Script the answer for every invocation of `tool` without an exact script
    pub fn respond_any(&self, tool: Tool, output: CommandOutput) {
        lock(&self.tool_wide).insert(tool, output);
    }

    /// Remove an exact script
    pub fn forget(&self, tool: Tool, args: &[&str]) {
        lock(&self.exact).remove(&(tool, args.join(" ")));
    }

    /// Make `tool` behave as if it were missing from the SDK and `PATH`.
    ///
    /// Overrides every script for `tool`, exact ones included.
    pub fn make_unresolvable(&self, tool: Tool) {
        lock(&self.missing).insert(tool);
    }

    /// Undo [`make_unresolvable`](Self::make_unresolvable)
    pub fn make_resolvable(&self, tool: Tool) {
        lock(&self.missing).remove(&tool);
    }

    /// Delay every answer by `latency` (uses tokio time, so paused clocks apply)
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Delay answers from `tool` by `latency`, overriding [`set_latency`](Self::set_latency)
    pub fn set_tool_latency(&self, tool: Tool, latency: Duration) {
        lock(&self.tool_latency).insert(tool, latency);
    }

    /// Script `adb devices` to list the given `(serial, state)` pairs
    pub fn set_adb_devices(&self, endpoints: &[(&str, &str)]) {
        self.respond(
            Tool::Adb,
            &["devices"],
            CommandOutput::ok(adb_devices_output(endpoints)),
        );
    }

    /// Script a booted emulator endpoint that reports `name` via the console
    pub fn add_running_emulator(&self, serial: &str, name: &str) {
        self.respond(
            Tool::Adb,
            &["-s", serial, "emu", "avd", "name"],
            CommandOutput::ok(format!("{}\r\nOK\r\n", name)),
        );
    }

    /// Snapshot of all calls so far
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Number of calls of `tool` whose joined arguments equal `args`
    pub fn count(&self, tool: Tool, args: &[&str]) -> usize {
        let wanted = args.join(" ");
        lock(&self.calls)
            .iter()
            .filter(|c| c.tool == tool && c.command_line() == wanted)
            .count()
    }

    /// Number of calls of `tool` whose arguments start with `prefix`
    pub fn count_prefix(&self, tool: Tool, prefix: &[&str]) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.tool == tool && c.args.starts_with(&to_owned(prefix)))
            .count()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn answer(&self, tool: Tool, args: &[&str], mode: RunMode) -> CommandOutput {
        if lock(&self.missing).contains(&tool) {
            return CommandOutput::unresolvable(tool);
        }
        if let Some(output) = lock(&self.exact).get(&(tool, args.join(" "))) {
            return output.clone();
        }
        if let Some(output) = lock(&self.tool_wide).get(&tool) {
            return output.clone();
        }
        match mode {
            RunMode::Foreground => CommandOutput::ok(""),
            RunMode::Background => CommandOutput::spawned(None),
        }
    }
}

impl CommandRunner for FakeRunner {
    async fn run(&self, tool: Tool, args: &[&str], mode: RunMode) -> CommandOutput {
        lock(&self.calls).push(RecordedCall {
            tool,
            args: to_owned(args),
            mode,
        });

        let latency = lock(&self.tool_latency)
            .get(&tool)
            .copied()
            .unwrap_or_else(|| *lock(&self.latency));
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        self.answer(tool, args, mode)
    }
}

/// Render `adb devices` output for the given `(serial, state)` pairs
pub fn adb_devices_output(endpoints: &[(&str, &str)]) -> String {
    let mut out = String::from("List of devices attached\n");
    for (serial, state) in endpoints {
        out.push_str(&format!("{}\t{}\n", serial, state));
    }
    out.push('\n');
    out
}

fn to_owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
