//! avdemon-app - State, lifecycle orchestration and configuration for avd-demon
//!
//! The [`Engine`] owns the [`StateStore`](store::StateStore), the
//! [`LifecycleController`](lifecycle::LifecycleController), the periodic
//! [`Reconciler`](reconciler::Reconciler) and the AVD directory watcher.
//! Frontends read snapshots and subscribe to [`EngineEvent`]s.

pub mod config;
pub mod engine;
pub mod engine_event;
pub mod lifecycle;
pub mod reconciler;
pub mod signals;
pub mod store;
pub mod watcher;

// Re-export primary types
pub use config::Settings;
pub use engine::{refresh_inventory, Engine};
pub use engine_event::EngineEvent;
pub use lifecycle::{Dispatch, LifecycleController, StopMethod, StopReport};
pub use store::{AvdRecord, Inventory, InventoryStatus, StateStore};
