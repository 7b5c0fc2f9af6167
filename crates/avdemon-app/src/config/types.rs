//! Configuration types for AVD Demon
//!
//! Every section and field has a default, so a partial (or empty) file is valid.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Global application settings (`config.toml`)
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub sdk: SdkSettings,

    #[serde(default)]
    pub commands: CommandSettings,

    #[serde(default)]
    pub enumeration: EnumerationSettings,

    #[serde(default)]
    pub reconcile: ReconcileSettings,

    #[serde(default)]
    pub lifecycle: LifecycleSettings,

    #[serde(default)]
    pub watcher: WatcherSettings,
}

/// Android SDK location
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SdkSettings {
    /// SDK root; falls back to `ANDROID_HOME` / `ANDROID_SDK_ROOT` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// External command settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CommandSettings {
    /// Deadline for foreground commands
    #[serde(default = "default_command_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl CommandSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Image enumeration settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EnumerationSettings {
    /// Upper bound for a whole enumeration pass
    #[serde(default = "default_enumeration_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EnumerationSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_enumeration_timeout_secs(),
        }
    }
}

impl EnumerationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Background reconciliation settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReconcileSettings {
    /// Seconds between detection passes
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
        }
    }
}

impl ReconcileSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Start/stop verification timings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LifecycleSettings {
    /// Wait before the first post-start detection
    #[serde(default = "default_start_grace_secs")]
    pub start_grace_secs: u64,

    /// Extra detection attempts after the first one
    #[serde(default = "default_verify_retries")]
    pub verify_retries: u32,

    /// Wait between detection attempts
    #[serde(default = "default_verify_interval_secs")]
    pub verify_interval_secs: u64,

    /// Wait before the post-stop reconciliation
    #[serde(default = "default_stop_settle_secs")]
    pub stop_settle_secs: u64,

    /// Mark a start that was never detected as stopped again
    #[serde(default)]
    pub revert_unconfirmed_start: bool,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            start_grace_secs: default_start_grace_secs(),
            verify_retries: default_verify_retries(),
            verify_interval_secs: default_verify_interval_secs(),
            stop_settle_secs: default_stop_settle_secs(),
            revert_unconfirmed_start: false,
        }
    }
}

impl LifecycleSettings {
    pub fn start_grace(&self) -> Duration {
        Duration::from_secs(self.start_grace_secs)
    }

    pub fn verify_interval(&self) -> Duration {
        Duration::from_secs(self.verify_interval_secs)
    }

    pub fn stop_settle(&self) -> Duration {
        Duration::from_secs(self.stop_settle_secs)
    }
}

/// AVD directory watcher settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WatcherSettings {
    /// Re-enumerate when AVD definitions change on disk
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Debounce duration in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl WatcherSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_command_timeout_secs() -> u64 {
    10
}

fn default_enumeration_timeout_secs() -> u64 {
    10
}

fn default_reconcile_interval_secs() -> u64 {
    5
}

fn default_start_grace_secs() -> u64 {
    3
}

fn default_verify_retries() -> u32 {
    3
}

fn default_verify_interval_secs() -> u64 {
    2
}

fn default_stop_settle_secs() -> u64 {
    2
}

fn default_debounce_ms() -> u64 {
    500
}
