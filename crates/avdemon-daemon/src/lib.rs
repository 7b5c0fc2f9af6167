//! # avdemon-daemon - Android Tool Plumbing
//!
//! Runs the Android SDK executables (`emulator`, `adb`, `avdmanager`) and the
//! OS process utilities, and turns their loosely formatted output into
//! domain values.
//!
//! Depends on [`avdemon_core`] for domain types and error handling.
//!
//! ## Public API
//!
//! ### Command Execution
//! - [`CommandRunner`] - Trait every tool invocation goes through
//! - [`SystemCommandRunner`] - Real processes with a deadline and PATH/SDK resolution
//! - [`CommandOutput`], [`CommandStatus`] - Captured text plus what happened to the child
//!
//! ### SDK Resolution
//! - [`SdkLocator`], [`SdkPaths`] - Configured path, then `ANDROID_HOME` / `ANDROID_SDK_ROOT`
//!
//! ### Image Enumeration
//! - [`list_images()`] - All registered AVDs with best-effort metadata
//!
//! ### Running-State Detection
//! - [`running_image_names()`] - Names of images booted as emulators
//! - [`running_endpoints()`] - Same, with the adb serial of each
//!
//! ### Shutdown Primitives
//! - [`stop_endpoint()`], [`kill_image_processes()`], [`pkill_image()`]

pub mod avds;
pub mod command;
pub mod devices;
pub mod processes;
pub mod sdk;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;

// Public API re-exports
pub use avds::{avd_home, list_images};
pub use command::{
    CommandOutput, CommandRunner, CommandStatus, LocalCommandRunner, RunMode,
    SystemCommandRunner, Tool, DEFAULT_COMMAND_TIMEOUT,
};
pub use devices::{
    query_running, running_endpoints, running_image_names, Endpoint, RunningEmulator,
};
pub use processes::{kill_image_processes, pkill_image, stop_endpoint, StopOutcome};
pub use sdk::{is_valid_sdk_root, SdkLocator, SdkPaths};
