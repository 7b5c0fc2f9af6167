//! Periodic reconciliation of observed state against the detector
//!
//! Independent of user actions: every tick asks the detector which images are
//! running and patches the store where it disagrees. Records owned by the
//! lifecycle controller (in-flight intent or pending confirmation) are skipped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use avdemon_core::prelude::*;
use avdemon_daemon::{running_image_names, CommandRunner};

use crate::engine_event::EngineEvent;
use crate::store::StateStore;

/// One detection pass merged into `store`.
///
/// Skipped while no image is known. Returns the `(name, is_running)` pairs
/// that changed; an event is broadcast for each.
pub async fn reconcile_once<R>(
    runner: &R,
    store: &StateStore,
    events: &broadcast::Sender<EngineEvent>,
) -> Vec<(String, bool)>
where
    R: CommandRunner + Sync,
{
    if store.is_empty() {
        trace!("No images known, skipping reconciliation");
        return Vec::new();
    }

    let running = running_image_names(runner).await;
    let changes = store.apply_detection(&running);

    for (name, is_running) in &changes {
        info!(
            "{} is now {}",
            name,
            if *is_running { "running" } else { "stopped" }
        );
        let _ = events.send(EngineEvent::RunningChanged {
            name: name.clone(),
            is_running: *is_running,
        });
    }

    changes
}

/// Background task running [`reconcile_once`] on a fixed period
pub struct Reconciler<R> {
    runner: Arc<R>,
    store: StateStore,
    events: broadcast::Sender<EngineEvent>,
    interval: Duration,
}

impl<R> Reconciler<R>
where
    R: CommandRunner + Sync + 'static,
{
    pub fn new(
        runner: Arc<R>,
        store: StateStore,
        events: broadcast::Sender<EngineEvent>,
        interval: Duration,
    ) -> Self {
        Self {
            runner,
            store,
            events,
            interval,
        }
    }

    /// Run until `shutdown_rx` turns `true` (or its sender is dropped)
    pub fn spawn(self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; callers reconcile after enumeration
            ticker.tick().await;

            info!("Reconciler running every {:?}", self.interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        reconcile_once(self.runner.as_ref(), &self.store, &self.events).await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Reconciler stopped");
        })
    }
}
