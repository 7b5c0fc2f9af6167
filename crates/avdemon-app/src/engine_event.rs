//! Domain events emitted by the Engine for external consumers
//!
//! The [`Inventory`](crate::store::Inventory) watch channel always holds the
//! latest state; these events describe *why* it changed. Frontends (the
//! headless NDJSON runner, the CLI) subscribe via `Engine::events()`.

use avdemon_core::TransitionIntent;

use crate::lifecycle::StopMethod;
use crate::store::InventoryStatus;

/// Domain events emitted by the Engine for external consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    // ─────────────────────────────────────────────────────────
    // Enumeration
    // ─────────────────────────────────────────────────────────
    /// A full enumeration pass finished
    InventoryRefreshed {
        status: InventoryStatus,
        count: usize,
    },

    /// AVD definitions changed on disk; a refresh follows
    DefinitionsChanged { count: usize },

    // ─────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────
    /// A start or stop began for an image
    TransitionStarted {
        name: String,
        intent: TransitionIntent,
    },

    /// The dispatch step of a start or stop completed
    TransitionFinished {
        name: String,
        intent: TransitionIntent,
    },

    /// A started image was seen by the detector
    StartConfirmed { name: String },

    /// A started image was never seen by the detector
    StartUnconfirmed { name: String, reverted: bool },

    /// A stop went through with the given method
    Stopped { name: String, method: StopMethod },

    /// No stop method succeeded for an image (soft warning)
    StopExhausted { name: String },

    // ─────────────────────────────────────────────────────────
    // Reconciliation
    // ─────────────────────────────────────────────────────────
    /// The observed running state of an image changed
    RunningChanged { name: String, is_running: bool },

    /// Stuck intents were cleared on request; `cleared` lists the images
    StateReset { cleared: Vec<String> },

    // ─────────────────────────────────────────────────────────
    // Watcher / Engine Lifecycle
    // ─────────────────────────────────────────────────────────
    /// The AVD directory watcher reported a problem
    WatcherError { message: String },

    /// Engine is shutting down
    Shutdown,
}

impl EngineEvent {
    /// Returns a short string label for this event type (for logging/debugging).
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::InventoryRefreshed { .. } => "inventory_refreshed",
            Self::DefinitionsChanged { .. } => "definitions_changed",
            Self::TransitionStarted { .. } => "transition_started",
            Self::TransitionFinished { .. } => "transition_finished",
            Self::StartConfirmed { .. } => "start_confirmed",
            Self::StartUnconfirmed { .. } => "start_unconfirmed",
            Self::Stopped { .. } => "stopped",
            Self::StopExhausted { .. } => "stop_exhausted",
            Self::RunningChanged { .. } => "running_changed",
            Self::StateReset { .. } => "state_reset",
            Self::WatcherError { .. } => "watcher_error",
            Self::Shutdown => "shutdown",
        }
    }

    /// Image the event is about, if any
    pub fn image_name(&self) -> Option<&str> {
        match self {
            Self::TransitionStarted { name, .. }
            | Self::TransitionFinished { name, .. }
            | Self::StartConfirmed { name }
            | Self::StartUnconfirmed { name, .. }
            | Self::Stopped { name, .. }
            | Self::StopExhausted { name }
            | Self::RunningChanged { name, .. } => Some(name.as_str()),
            _ => None,
        }
    }
}
