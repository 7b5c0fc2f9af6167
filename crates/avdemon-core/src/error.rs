//! Application error types with rich context

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Application error types organized by layer/domain
///
/// Timeouts and unparsable tool output never surface here: a timed-out command
/// is reported as `CommandStatus::TimedOut` by `avdemon-daemon`, and degraded
/// metadata as [`MetadataSource::Defaulted`](crate::MetadataSource).
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Tooling Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Could not locate '{tool}'. Set the Android SDK path or add it to your PATH.")]
    ToolUnresolvable { tool: String },

    #[error("Process error: {message}")]
    Process { message: String },

    // ─────────────────────────────────────────────────────────────
    // Lifecycle Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Virtual device '{name}' not found")]
    ImageNotFound { name: String },

    #[error("Failed to launch '{name}': {output}")]
    LaunchDispatchFailed { name: String, output: String },

    #[error("No stop method succeeded for '{name}'")]
    StopExhausted { name: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid Android SDK path: {path}")]
    InvalidSdkPath { path: PathBuf },

    // ─────────────────────────────────────────────────────────────
    // Runtime Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Signal handling error: {message}")]
    Signal { message: String },

    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn tool_unresolvable(tool: impl Into<String>) -> Self {
        Self::ToolUnresolvable { tool: tool.into() }
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::Process {
            message: message.into(),
        }
    }

    pub fn image_not_found(name: impl Into<String>) -> Self {
        Self::ImageNotFound { name: name.into() }
    }

    pub fn launch_failed(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self::LaunchDispatchFailed {
            name: name.into(),
            output: output.into(),
        }
    }

    pub fn stop_exhausted(name: impl Into<String>) -> Self {
        Self::StopExhausted { name: name.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn invalid_sdk_path(path: impl Into<PathBuf>) -> Self {
        Self::InvalidSdkPath { path: path.into() }
    }

    pub fn signal(message: impl Into<String>) -> Self {
        Self::Signal {
            message: message.into(),
        }
    }

    /// Check if this is a recoverable error
    ///
    /// Recoverable errors leave the engine usable; the next refresh or
    /// reconciliation tick may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Process { .. }
                | Error::LaunchDispatchFailed { .. }
                | Error::StopExhausted { .. }
                | Error::ImageNotFound { .. }
        )
    }

    /// Check if this error should trigger application exit
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Signal { .. } | Error::ChannelClosed)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}
