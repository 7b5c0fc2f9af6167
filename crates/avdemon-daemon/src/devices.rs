//! Running-emulator detection using `adb devices`
//!
//! Every booted emulator shows up as an `emulator-<port>` endpoint. The AVD
//! behind an endpoint is resolved by asking, in order, the emulator console
//! and two system properties.

use std::collections::HashSet;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use avdemon_core::prelude::*;
use avdemon_core::types::is_valid_avd_name;

use crate::command::{CommandRunner, RunMode, Tool};

/// Serial prefix adb gives emulator endpoints
pub const EMULATOR_SERIAL_PREFIX: &str = "emulator-";

/// Endpoint state meaning "booted and reachable"
pub const ONLINE_STATE: &str = "device";

/// Ordered strategies for mapping an endpoint to its AVD name
const NAME_QUERIES: &[&[&str]] = &[
    &["emu", "avd", "name"],
    &["shell", "getprop", "ro.boot.qemu.avd_name"],
    &["shell", "getprop", "ro.kernel.qemu.avd_name"],
];

/// A line of `adb devices`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// e.g. "emulator-5554"
    pub serial: String,
    /// e.g. "device", "offline", "unauthorized"
    pub state: String,
}

impl Endpoint {
    /// Booted emulator that can be queried
    pub fn is_online_emulator(&self) -> bool {
        self.serial.starts_with(EMULATOR_SERIAL_PREFIX) && self.state == ONLINE_STATE
    }
}

/// A running emulator endpoint with its resolved AVD name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningEmulator {
    pub serial: String,
    pub name: String,
}

/// Parse `adb devices` (also tolerates the `-l` long format)
pub fn parse_adb_devices(output: &str) -> Vec<Endpoint> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("List of devices"))
        // "* daemon not running; starting now at tcp:5037"
        .filter(|line| !line.starts_with('*'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            Some(Endpoint {
                serial: serial.to_string(),
                state: state.to_string(),
            })
        })
        .collect()
}

/// Extract an AVD name from a resolution query's output.
///
/// The console answers `<name>\r\nOK`; getprop answers `<name>` or nothing.
/// Sentinels (`OK`, `null`, `KO: ...`) and `error: ...` lines never produce a
/// name; names that merely start with those letters still do.
pub fn parse_resolved_name(output: &str) -> Option<String> {
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line == "OK" {
            continue;
        }
        if line.eq_ignore_ascii_case("null")
            || line == "KO"
            || line.starts_with("KO:")
            || line.to_ascii_lowercase().starts_with("error:")
        {
            return None;
        }
        if is_valid_avd_name(line) {
            return Some(line.to_string());
        }
    }
    None
}

/// List the online emulator endpoints, or `None` when adb cannot be found
pub async fn list_endpoints<R: CommandRunner + Sync>(runner: &R) -> Option<Vec<Endpoint>> {
    let output = runner.run(Tool::Adb, &["devices"], RunMode::Foreground).await;

    if output.is_unresolvable() {
        debug!("adb not found; reporting no running emulators");
        return None;
    }
    if output.is_timed_out() {
        warn!("adb devices timed out; using partial output");
    }

    let endpoints = parse_adb_devices(&output.text);
    for endpoint in endpoints.iter().filter(|e| !e.is_online_emulator()) {
        trace!("Skipping endpoint {} ({})", endpoint.serial, endpoint.state);
    }
    Some(
        endpoints
            .into_iter()
            .filter(Endpoint::is_online_emulator)
            .collect(),
    )
}

/// Resolve the AVD name behind `serial`, trying each query in order
pub async fn resolve_endpoint<R: CommandRunner + Sync>(runner: &R, serial: &str) -> Option<String> {
    for query in NAME_QUERIES {
        let mut args = vec!["-s", serial];
        args.extend_from_slice(query);

        let output = runner.run(Tool::Adb, &args, RunMode::Foreground).await;
        if output.is_unresolvable() {
            return None;
        }
        if let Some(name) = parse_resolved_name(&output.text) {
            trace!("{} resolved to {} via '{}'", serial, name, query.join(" "));
            return Some(name);
        }
    }

    debug!("Could not resolve AVD name for {}", serial);
    None
}

/// Running emulators with their resolved names, or `None` when adb cannot be found.
///
/// Endpoints whose name cannot be resolved are dropped.
pub async fn query_running<R: CommandRunner + Sync>(runner: &R) -> Option<Vec<RunningEmulator>> {
    let endpoints = list_endpoints(runner).await?;

    let resolved = join_all(
        endpoints
            .iter()
            .map(|e| async move { (e.serial.clone(), resolve_endpoint(runner, &e.serial).await) }),
    )
    .await;

    Some(
        resolved
            .into_iter()
            .filter_map(|(serial, name)| name.map(|name| RunningEmulator { serial, name }))
            .collect(),
    )
}

/// Running emulators with their resolved names; a missing adb means none
pub async fn running_endpoints<R: CommandRunner + Sync>(runner: &R) -> Vec<RunningEmulator> {
    query_running(runner).await.unwrap_or_default()
}

/// Names of all images currently running as emulator processes
pub async fn running_image_names<R: CommandRunner + Sync>(runner: &R) -> HashSet<String> {
    running_endpoints(runner)
        .await
        .into_iter()
        .map(|e| e.name)
        .collect()
}
