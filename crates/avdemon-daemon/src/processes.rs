//! Emulator shutdown primitives
//!
//! Three independent ways to stop an image, from gentlest to bluntest:
//! the emulator console of its adb endpoint, signals to the pid found in the
//! process table, and `pkill` on the launch command line. The lifecycle
//! controller decides which to try and in what order.

use std::time::Duration;

use avdemon_core::prelude::*;

use crate::command::{CommandRunner, RunMode, Tool};

/// Pause between SIGTERM and SIGKILL
pub const TERM_GRACE: Duration = Duration::from_secs(1);

/// Result of one shutdown attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The attempt reported success
    Stopped,
    /// The tool ran but nothing was stopped
    NotStopped,
    /// The tool could not be found
    ToolMissing,
}

impl StopOutcome {
    pub fn is_stopped(&self) -> bool {
        *self == StopOutcome::Stopped
    }
}

/// Pids of emulator processes launched for `name`, from `ps aux` output.
///
/// A line matches when it carries `-avd <name>` or `@<name>`; the pid is the
/// second column.
pub fn find_image_pids(ps_output: &str, name: &str) -> Vec<u32> {
    let at_form = format!("@{}", name);

    ps_output
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let launched = tokens
                .windows(2)
                .any(|pair| pair[0] == "-avd" && pair[1] == name)
                || tokens.iter().any(|t| *t == at_form);
            if !launched {
                return None;
            }
            tokens.get(1).and_then(|pid| pid.parse().ok())
        })
        .collect()
}

/// `pkill -f` pattern matching the launch command line of `name`
pub fn pkill_pattern(name: &str) -> String {
    format!("emulator.*-avd.*{}", name.replace('.', r"\."))
}

/// Ask the emulator behind `serial` to exit, then power off the guest.
///
/// Success is judged on the console `kill` alone.
pub async fn stop_endpoint<R: CommandRunner + Sync>(runner: &R, serial: &str) -> StopOutcome {
    let kill = runner
        .run(Tool::Adb, &["-s", serial, "emu", "kill"], RunMode::Foreground)
        .await;
    if kill.is_unresolvable() {
        return StopOutcome::ToolMissing;
    }

    let poweroff = runner
        .run(Tool::Adb, &["-s", serial, "shell", "reboot", "-p"], RunMode::Foreground)
        .await;
    trace!("{} reboot -p: {:?}", serial, poweroff.status);

    if kill.has_error_marker() {
        debug!("emu kill on {} failed: {}", serial, kill.text.trim());
        StopOutcome::NotStopped
    } else {
        StopOutcome::Stopped
    }
}

/// Find the image's processes and signal them: TERM, a short grace, then KILL
pub async fn kill_image_processes<R: CommandRunner + Sync>(runner: &R, name: &str) -> StopOutcome {
    let ps = runner.run(Tool::Ps, &["aux"], RunMode::Foreground).await;
    if ps.is_unresolvable() {
        return StopOutcome::ToolMissing;
    }

    let pids = find_image_pids(&ps.text, name);
    if pids.is_empty() {
        debug!("No process found for {}", name);
        return StopOutcome::NotStopped;
    }

    let mut signalled = false;
    for pid in &pids {
        let pid = pid.to_string();
        let term = runner
            .run(Tool::Kill, &["-TERM", pid.as_str()], RunMode::Foreground)
            .await;
        if term.is_unresolvable() {
            return StopOutcome::ToolMissing;
        }
        signalled |= term.is_success();
    }

    tokio::time::sleep(TERM_GRACE).await;

    for pid in &pids {
        let pid = pid.to_string();
        let kill = runner
            .run(Tool::Kill, &["-KILL", pid.as_str()], RunMode::Foreground)
            .await;
        signalled |= kill.is_success();
    }

    info!("Signalled {} process(es) for {}", pids.len(), name);
    if signalled {
        StopOutcome::Stopped
    } else {
        StopOutcome::NotStopped
    }
}

/// Kill by command-line pattern; succeeds only when pkill matched something
pub async fn pkill_image<R: CommandRunner + Sync>(runner: &R, name: &str) -> StopOutcome {
    let pattern = pkill_pattern(name);
    let output = runner
        .run(Tool::Pkill, &["-f", pattern.as_str()], RunMode::Foreground)
        .await;

    if output.is_unresolvable() {
        StopOutcome::ToolMissing
    } else if output.exit_code() == Some(0) {
        StopOutcome::Stopped
    } else {
        StopOutcome::NotStopped
    }
}
