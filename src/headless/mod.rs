//! Headless mode - NDJSON event stream
//!
//! `avdemon watch` keeps an engine alive and writes one JSON object per line
//! to stdout for every engine event, so scripts can follow AVD state without
//! parsing tables.
//!
//! # Example Output
//!
//! ```json
//! {"event":"inventory","status":"ready","images":[...],"timestamp":1704700001000}
//! {"event":"transition_started","name":"Pixel_7_API_33","intent":"starting","timestamp":1704700002000}
//! {"event":"start_confirmed","name":"Pixel_7_API_33","timestamp":1704700005000}
//! ```

pub mod runner;

use std::io::{self, Write};

use chrono::Utc;
use serde::Serialize;
use tracing::error;

use avdemon_app::{EngineEvent, Inventory, InventoryStatus, StopMethod};
use avdemon_core::TransitionIntent;

use crate::output::{rows, ImageRow};

/// Events emitted in headless mode
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HeadlessEvent {
    /// Full inventory after an enumeration pass
    Inventory {
        status: InventoryStatus,
        images: Vec<ImageRow>,
        timestamp: i64,
    },

    /// AVD definitions changed on disk
    DefinitionsChanged { count: usize, timestamp: i64 },

    TransitionStarted {
        name: String,
        intent: TransitionIntent,
        timestamp: i64,
    },

    TransitionFinished {
        name: String,
        intent: TransitionIntent,
        timestamp: i64,
    },

    StartConfirmed { name: String, timestamp: i64 },

    StartUnconfirmed {
        name: String,
        reverted: bool,
        timestamp: i64,
    },

    Stopped {
        name: String,
        method: StopMethod,
        timestamp: i64,
    },

    StopExhausted { name: String, timestamp: i64 },

    RunningChanged {
        name: String,
        is_running: bool,
        timestamp: i64,
    },

    /// Stuck intents were cleared by a `reset` command
    StateReset {
        cleared: Vec<String>,
        timestamp: i64,
    },

    /// Error occurred
    Error {
        message: String,
        fatal: bool,
        timestamp: i64,
    },

    /// Engine shutting down; last event of the stream
    Shutdown { timestamp: i64 },
}

impl HeadlessEvent {
    /// Emit this event to stdout as JSON
    pub fn emit(&self) {
        let json = match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize headless event: {}", e);
                return;
            }
        };

        let mut stdout = io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", json) {
            error!("Failed to write headless event to stdout: {}", e);
            return;
        }

        if let Err(e) = stdout.flush() {
            error!("Failed to flush headless stdout: {}", e);
        }
    }

    /// Get current timestamp in milliseconds
    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    pub fn inventory(inventory: &Inventory) -> Self {
        Self::Inventory {
            status: inventory.status,
            images: rows(inventory),
            timestamp: Self::now(),
        }
    }

    pub fn error(message: impl Into<String>, fatal: bool) -> Self {
        Self::Error {
            message: message.into(),
            fatal,
            timestamp: Self::now(),
        }
    }

    pub fn shutdown() -> Self {
        Self::Shutdown {
            timestamp: Self::now(),
        }
    }

    /// Map an engine event; refreshes are reported with the current inventory
    pub fn from_engine_event(event: EngineEvent, inventory: &Inventory) -> Self {
        let timestamp = Self::now();
        match event {
            EngineEvent::InventoryRefreshed { .. } => Self::inventory(inventory),
            EngineEvent::DefinitionsChanged { count } => {
                Self::DefinitionsChanged { count, timestamp }
            }
            EngineEvent::TransitionStarted { name, intent } => Self::TransitionStarted {
                name,
                intent,
                timestamp,
            },
            EngineEvent::TransitionFinished { name, intent } => Self::TransitionFinished {
                name,
                intent,
                timestamp,
            },
            EngineEvent::StartConfirmed { name } => Self::StartConfirmed { name, timestamp },
            EngineEvent::StartUnconfirmed { name, reverted } => Self::StartUnconfirmed {
                name,
                reverted,
                timestamp,
            },
            EngineEvent::Stopped { name, method } => Self::Stopped {
                name,
                method,
                timestamp,
            },
            EngineEvent::StopExhausted { name } => Self::StopExhausted { name, timestamp },
            EngineEvent::RunningChanged { name, is_running } => Self::RunningChanged {
                name,
                is_running,
                timestamp,
            },
            EngineEvent::StateReset { cleared } => Self::StateReset { cleared, timestamp },
            EngineEvent::WatcherError { message } => Self::Error {
                message,
                fatal: false,
                timestamp,
            },
            EngineEvent::Shutdown => Self::Shutdown { timestamp },
        }
    }
}
