//! Android SDK location
//!
//! The engine only consumes an SDK root; it never searches well-known install
//! directories. A root is accepted when it contains both `emulator/` and
//! `platform-tools/`. Without one, every tool is looked up on `PATH`.

use std::path::{Path, PathBuf};

use avdemon_core::prelude::*;

use crate::command::Tool;

/// Environment variables consulted after the configured path, in order
pub const SDK_ENV_VARS: &[&str] = &["ANDROID_HOME", "ANDROID_SDK_ROOT"];

/// Supplies the Android SDK root to the command executor
#[cfg_attr(test, mockall::automock)]
pub trait SdkLocator: Send + Sync {
    /// A validated SDK root, or `None` to run in PATH-only mode
    fn sdk_root(&self) -> Option<PathBuf>;
}

/// Check that `path` looks like an Android SDK root
pub fn is_valid_sdk_root(path: &Path) -> bool {
    path.join("emulator").is_dir() && path.join("platform-tools").is_dir()
}

/// Candidate executable locations for `tool` inside an SDK root, in priority order.
///
/// OS utilities (`ps`, `kill`, `pkill`) never live in the SDK.
pub fn tool_candidates(root: &Path, tool: Tool) -> Vec<PathBuf> {
    let exe = |name: &str| format!("{}{}", name, std::env::consts::EXE_SUFFIX);

    match tool {
        Tool::Emulator => vec![root.join("emulator").join(exe("emulator"))],
        Tool::Adb => vec![root.join("platform-tools").join(exe("adb"))],
        Tool::AvdManager => {
            // avdmanager is a script on every platform (.bat on Windows)
            let script = if cfg!(windows) {
                "avdmanager.bat"
            } else {
                "avdmanager"
            };
            vec![
                root.join("cmdline-tools")
                    .join("latest")
                    .join("bin")
                    .join(script),
                root.join("tools").join("bin").join(script),
            ]
        }
        Tool::Ps | Tool::Kill | Tool::Pkill => Vec::new(),
    }
}

/// SDK root taken from settings first, then the standard environment variables
#[derive(Debug, Clone, Default)]
pub struct SdkPaths {
    configured: Option<PathBuf>,
}

impl SdkPaths {
    /// Create a locator preferring `configured` over the environment
    pub fn new(configured: Option<PathBuf>) -> Self {
        Self { configured }
    }

    /// All roots that will be tried, in order
    fn candidates(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self.configured.iter().cloned().collect();
        for var in SDK_ENV_VARS {
            if let Ok(value) = std::env::var(var) {
                if !value.trim().is_empty() {
                    roots.push(PathBuf::from(value.trim()));
                }
            }
        }
        roots
    }

    /// Get user-friendly message when no SDK root is usable
    pub fn unavailable_message(&self) -> Option<&'static str> {
        if self.sdk_root().is_some() {
            None
        } else {
            Some("Android SDK not found. Set sdk.path, ANDROID_HOME or ANDROID_SDK_ROOT; falling back to PATH.")
        }
    }
}

impl SdkLocator for SdkPaths {
    fn sdk_root(&self) -> Option<PathBuf> {
        for root in self.candidates() {
            if is_valid_sdk_root(&root) {
                let root = dunce::canonicalize(&root).unwrap_or(root);
                trace!("Using Android SDK at {}", root.display());
                return Some(root);
            }
            debug!("Ignoring invalid SDK root candidate {}", root.display());
        }
        None
    }
}
