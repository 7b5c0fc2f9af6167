//! Start/stop of individual images
//!
//! Both operations update the store optimistically as soon as the dispatch
//! step completes, then hand over to a per-image background task that
//! verifies the result against the detector. Only the dispatch step can fail;
//! verification problems are logged and broadcast, never returned.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use avdemon_core::prelude::*;
use avdemon_core::TransitionIntent;
use avdemon_daemon::{
    kill_image_processes, pkill_image, query_running, running_image_names, stop_endpoint,
    CommandRunner, RunMode, StopOutcome, Tool,
};

use crate::config::LifecycleSettings;
use crate::engine_event::EngineEvent;
use crate::reconciler::reconcile_once;
use crate::store::StateStore;

/// Map of image names to their pending verification task
pub type ConfirmationTaskMap = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

/// Whether a start/stop request was acted upon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dispatch {
    /// The operation was dispatched
    Accepted,
    /// Another start or stop for the image is still in flight
    Ignored,
}

/// How an image was stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMethod {
    /// `adb -s <serial> emu kill`
    Console,
    /// TERM/KILL to the pid from the process table
    Signal,
    /// `pkill -f` on the launch command line
    Pattern,
}

impl fmt::Display for StopMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopMethod::Console => write!(f, "emulator console"),
            StopMethod::Signal => write!(f, "process signal"),
            StopMethod::Pattern => write!(f, "pkill pattern"),
        }
    }
}

/// Outcome of a stop request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub name: String,
    pub dispatch: Dispatch,
    /// The method that reported success, if any
    pub method: Option<StopMethod>,
}

impl StopReport {
    fn ignored(name: &str) -> Self {
        Self {
            name: name.to_string(),
            dispatch: Dispatch::Ignored,
            method: None,
        }
    }

    /// Dispatched, but no method reported success
    pub fn is_exhausted(&self) -> bool {
        self.dispatch == Dispatch::Accepted && self.method.is_none()
    }

    /// Soft warning for an exhausted stop
    pub fn warning(&self) -> Option<Error> {
        self.is_exhausted()
            .then(|| Error::stop_exhausted(self.name.clone()))
    }
}

/// Drives start/stop for images in a [`StateStore`]
pub struct LifecycleController<R> {
    runner: Arc<R>,
    store: StateStore,
    settings: LifecycleSettings,
    events: broadcast::Sender<EngineEvent>,
    tasks: ConfirmationTaskMap,
}

impl<R> Clone for LifecycleController<R> {
    fn clone(&self) -> Self {
        Self {
            runner: self.runner.clone(),
            store: self.store.clone(),
            settings: self.settings.clone(),
            events: self.events.clone(),
            tasks: self.tasks.clone(),
        }
    }
}

impl<R> LifecycleController<R> {
    /// Abort every pending verification task
    pub fn abort_all(&self) {
        for (name, handle) in lock(&self.tasks).drain() {
            trace!("Aborting verification task for {}", name);
            handle.abort();
            self.store.set_awaiting_confirmation(&name, false);
        }
    }

    /// Abort pending verification and release every intent.
    ///
    /// Recovery for an image stuck in `Starting`/`Stopping`; the next
    /// reconciliation pass restores the running flags.
    pub fn reset(&self) -> Vec<String> {
        let cleared = self.store.clear_intents();
        self.abort_all();
        if cleared.is_empty() {
            debug!("State reset: nothing in flight");
        } else {
            warn!("State reset: released {}", cleared.join(", "));
        }
        let _ = self.events.send(EngineEvent::StateReset {
            cleared: cleared.clone(),
        });
        cleared
    }

    /// Number of images with a verification task registered
    pub fn pending_count(&self) -> usize {
        lock(&self.tasks)
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }
}

impl<R> LifecycleController<R>
where
    R: CommandRunner + Sync + 'static,
{
    pub fn new(
        runner: Arc<R>,
        store: StateStore,
        settings: LifecycleSettings,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            runner,
            store,
            settings,
            events,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Launch `name` in the background.
    ///
    /// The image is reported running as soon as the launch was dispatched; a
    /// confirmation task then checks the detector.
    pub async fn start(&self, name: &str) -> Result<Dispatch> {
        if !self.store.try_begin(name, TransitionIntent::Starting)? {
            info!("Ignoring start of {}: operation already in flight", name);
            return Ok(Dispatch::Ignored);
        }
        self.cancel_pending(name);
        self.emit(EngineEvent::TransitionStarted {
            name: name.to_string(),
            intent: TransitionIntent::Starting,
        });

        info!("Starting {}", name);
        let output = self
            .runner
            .run(Tool::Emulator, &["-avd", name], RunMode::Background)
            .await;

        self.store.end_transition(name);
        self.emit(EngineEvent::TransitionFinished {
            name: name.to_string(),
            intent: TransitionIntent::Starting,
        });

        if output.is_unresolvable() {
            return Err(Error::tool_unresolvable(Tool::Emulator.command_name()));
        }
        if output.has_error_marker() {
            warn!("Launch of {} failed: {}", name, output.text.trim());
            return Err(Error::launch_failed(name, output.text.trim()));
        }

        self.store.set_running(name, true);
        self.store.set_awaiting_confirmation(name, true);
        self.track(name, self.spawn_start_confirmation(name));

        Ok(Dispatch::Accepted)
    }

    /// Stop `name`, trying the console, process signals and `pkill` in turn.
    ///
    /// Fails only when none of the stop tools could be found. A stop where no
    /// method succeeded is still reported as dispatched, with a warning.
    pub async fn stop(&self, name: &str) -> Result<StopReport> {
        if !self.store.try_begin(name, TransitionIntent::Stopping)? {
            info!("Ignoring stop of {}: operation already in flight", name);
            return Ok(StopReport::ignored(name));
        }
        self.cancel_pending(name);
        self.emit(EngineEvent::TransitionStarted {
            name: name.to_string(),
            intent: TransitionIntent::Stopping,
        });

        info!("Stopping {}", name);
        let attempt = self.run_stop_methods(name).await;

        let method = match attempt {
            Ok(method) => method,
            Err(e) => {
                self.store.end_transition(name);
                self.emit(EngineEvent::TransitionFinished {
                    name: name.to_string(),
                    intent: TransitionIntent::Stopping,
                });
                return Err(e);
            }
        };

        self.store.set_running(name, false);
        self.store.set_awaiting_confirmation(name, true);
        self.store.end_transition(name);
        self.emit(EngineEvent::TransitionFinished {
            name: name.to_string(),
            intent: TransitionIntent::Stopping,
        });

        match method {
            Some(method) => {
                info!("Stopped {} via {}", name, method);
                self.emit(EngineEvent::Stopped {
                    name: name.to_string(),
                    method,
                });
            }
            None => {
                warn!("{}", Error::stop_exhausted(name));
                self.emit(EngineEvent::StopExhausted {
                    name: name.to_string(),
                });
            }
        }

        self.track(name, self.spawn_stop_settle(name));

        Ok(StopReport {
            name: name.to_string(),
            dispatch: Dispatch::Accepted,
            method,
        })
    }

    /// Wait for every pending verification task to finish
    pub async fn settle(&self) {
        loop {
            let pending: Vec<_> = lock(&self.tasks).drain().collect();
            if pending.is_empty() {
                return;
            }
            for (name, handle) in pending {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        warn!("Verification task for {} failed: {}", name, e);
                    }
                }
            }
        }
    }

    /// Console first, then signals to the pid, then pkill.
    ///
    /// `Ok(None)` means every method ran and none succeeded.
    async fn run_stop_methods(&self, name: &str) -> Result<Option<StopMethod>> {
        let runner = self.runner.as_ref();
        let mut any_tool = false;

        if let Some(running) = query_running(runner).await {
            any_tool = true;
            for endpoint in running.iter().filter(|e| e.name == name) {
                if stop_endpoint(runner, &endpoint.serial).await.is_stopped() {
                    return Ok(Some(StopMethod::Console));
                }
            }
        }

        match kill_image_processes(runner, name).await {
            StopOutcome::Stopped => return Ok(Some(StopMethod::Signal)),
            StopOutcome::NotStopped => any_tool = true,
            StopOutcome::ToolMissing => {}
        }

        match pkill_image(runner, name).await {
            StopOutcome::Stopped => return Ok(Some(StopMethod::Pattern)),
            StopOutcome::NotStopped => any_tool = true,
            StopOutcome::ToolMissing => {}
        }

        if any_tool {
            Ok(None)
        } else {
            Err(Error::tool_unresolvable("adb, ps/kill or pkill"))
        }
    }

    fn spawn_start_confirmation(&self, name: &str) -> JoinHandle<()> {
        let runner = self.runner.clone();
        let store = self.store.clone();
        let events = self.events.clone();
        let settings = self.settings.clone();
        let name = name.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(settings.start_grace()).await;

            let attempts = settings.verify_retries + 1;
            let mut confirmed = false;
            for attempt in 1..=attempts {
                if attempt > 1 {
                    tokio::time::sleep(settings.verify_interval()).await;
                }
                if running_image_names(runner.as_ref()).await.contains(&name) {
                    confirmed = true;
                    break;
                }
                debug!("{} not detected yet (attempt {}/{})", name, attempt, attempts);
            }

            if confirmed {
                store.set_running(&name, true);
                info!("Start of {} confirmed", name);
                let _ = events.send(EngineEvent::StartConfirmed { name: name.clone() });
            } else {
                let reverted = settings.revert_unconfirmed_start;
                if reverted {
                    store.set_running(&name, false);
                }
                warn!(
                    "{} was not detected after {} attempts{}",
                    name,
                    attempts,
                    if reverted { ", marking stopped" } else { "" }
                );
                let _ = events.send(EngineEvent::StartUnconfirmed {
                    name: name.clone(),
                    reverted,
                });
            }

            store.set_awaiting_confirmation(&name, false);
        })
    }

    fn spawn_stop_settle(&self, name: &str) -> JoinHandle<()> {
        let runner = self.runner.clone();
        let store = self.store.clone();
        let events = self.events.clone();
        let settle = self.settings.stop_settle();
        let name = name.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            store.set_awaiting_confirmation(&name, false);
            reconcile_once(runner.as_ref(), &store, &events).await;
        })
    }

    /// Register `handle` as the verification task for `name`
    fn track(&self, name: &str, handle: JoinHandle<()>) {
        if let Some(previous) = lock(&self.tasks).insert(name.to_string(), handle) {
            previous.abort();
        }
    }

    /// Abort the verification task of `name`, if one is pending
    fn cancel_pending(&self, name: &str) {
        if let Some(handle) = lock(&self.tasks).remove(name) {
            if !handle.is_finished() {
                debug!("Cancelling pending verification for {}", name);
            }
            handle.abort();
        }
        self.store.set_awaiting_confirmation(name, false);
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

fn lock(tasks: &ConfirmationTaskMap) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
    tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InventoryStatus;
    use avdemon_core::{AvdImage, LifecyclePhase};
    use avdemon_daemon::test_utils::FakeRunner;
    use avdemon_daemon::CommandOutput;
    use std::time::Duration;
    use tokio_test::assert_ok;

    const PIXEL: &str = "Pixel_7_API_33";

    struct Harness {
        runner: Arc<FakeRunner>,
        store: StateStore,
        controller: LifecycleController<FakeRunner>,
        events: broadcast::Receiver<EngineEvent>,
    }

    fn harness(settings: LifecycleSettings) -> Harness {
        let runner = Arc::new(FakeRunner::new());
        runner.set_adb_devices(&[]);
        let store = StateStore::new();
        store.replace_images(vec![AvdImage::new(PIXEL)]);
        let (tx, events) = broadcast::channel(64);
        let controller = LifecycleController::new(runner.clone(), store.clone(), settings, tx);
        Harness {
            runner,
            store,
            controller,
            events,
        }
    }

    fn boot(runner: &FakeRunner) {
        runner.set_adb_devices(&[("emulator-5554", "device")]);
        runner.add_running_emulator("emulator-5554", PIXEL);
    }

    fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_optimistic_and_confirms() {
        let mut h = harness(LifecycleSettings::default());

        let dispatch = assert_ok!(h.controller.start(PIXEL).await);
        assert_eq!(dispatch, Dispatch::Accepted);

        let record = h.store.record(PIXEL).unwrap();
        assert!(record.is_running);
        assert!(record.awaiting_confirmation);
        assert_eq!(record.intent, None);
        assert_eq!(h.runner.count(Tool::Emulator, &["-avd", PIXEL]), 1);

        boot(&h.runner);
        h.controller.settle().await;

        let record = h.store.record(PIXEL).unwrap();
        assert!(record.is_running);
        assert!(!record.awaiting_confirmation);
        assert!(drain(&mut h.events)
            .contains(&EngineEvent::StartConfirmed { name: PIXEL.into() }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_start_stays_running_by_default() {
        let mut h = harness(LifecycleSettings::default());
        let started = tokio::time::Instant::now();

        assert_ok!(h.controller.start(PIXEL).await);
        h.controller.settle().await;

        // 3 s grace plus 3 retries at 2 s
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(9) && elapsed < Duration::from_secs(10));
        assert_eq!(h.runner.count(Tool::Adb, &["devices"]), 4);
        let record = h.store.record(PIXEL).unwrap();
        assert!(record.is_running);
        assert!(!record.awaiting_confirmation);
        assert!(drain(&mut h.events).contains(&EngineEvent::StartUnconfirmed {
            name: PIXEL.into(),
            reverted: false
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_start_can_revert() {
        let settings = LifecycleSettings {
            revert_unconfirmed_start: true,
            ..Default::default()
        };
        let h = harness(settings);

        assert_ok!(h.controller.start(PIXEL).await);
        h.controller.settle().await;

        assert!(!h.store.record(PIXEL).unwrap().is_running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_starts_dispatch_once() {
        let h = harness(LifecycleSettings::default());
        h.runner.set_latency(Duration::from_millis(200));

        let (first, second) = tokio::join!(h.controller.start(PIXEL), h.controller.start(PIXEL));

        let mut results = vec![first.unwrap(), second.unwrap()];
        results.sort_by_key(|d| *d == Dispatch::Ignored);
        assert_eq!(results, vec![Dispatch::Accepted, Dispatch::Ignored]);
        assert_eq!(h.runner.count(Tool::Emulator, &["-avd", PIXEL]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ignored_while_start_in_flight() {
        let h = harness(LifecycleSettings::default());
        h.runner.set_latency(Duration::from_millis(200));

        let (start, stop) = tokio::join!(h.controller.start(PIXEL), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(
                h.store.record(PIXEL).unwrap().phase(),
                LifecyclePhase::Starting
            );
            h.controller.stop(PIXEL).await
        });

        assert_eq!(start.unwrap(), Dispatch::Accepted);
        assert_eq!(stop.unwrap().dispatch, Dispatch::Ignored);
    }

    #[tokio::test]
    async fn test_start_unknown_image() {
        let h = harness(LifecycleSettings::default());
        let err = h.controller.start("Nope").await.unwrap_err();
        assert!(matches!(err, Error::ImageNotFound { .. }));
    }

    #[tokio::test]
    async fn test_start_with_missing_emulator() {
        let h = harness(LifecycleSettings::default());
        h.runner.make_unresolvable(Tool::Emulator);

        let err = h.controller.start(PIXEL).await.unwrap_err();

        assert!(matches!(err, Error::ToolUnresolvable { .. }));
        let record = h.store.record(PIXEL).unwrap();
        assert!(!record.is_running);
        assert_eq!(record.intent, None);
    }

    #[tokio::test]
    async fn test_start_launch_failure() {
        let h = harness(LifecycleSettings::default());
        h.runner.respond(
            Tool::Emulator,
            &["-avd", PIXEL],
            CommandOutput::spawn_failed("permission denied"),
        );

        let err = h.controller.start(PIXEL).await.unwrap_err();

        assert!(matches!(err, Error::LaunchDispatchFailed { .. }));
        assert!(!h.store.record(PIXEL).unwrap().is_running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_via_console() {
        let mut h = harness(LifecycleSettings::default());
        boot(&h.runner);
        h.store.set_running(PIXEL, true);
        h.runner.respond(
            Tool::Adb,
            &["-s", "emulator-5554", "emu", "kill"],
            CommandOutput::ok("OK: killing emulator, bye bye\r\n"),
        );

        let report = assert_ok!(h.controller.stop(PIXEL).await);

        assert_eq!(report.method, Some(StopMethod::Console));
        assert!(report.warning().is_none());
        assert!(!h.store.record(PIXEL).unwrap().is_running);
        assert_eq!(h.runner.count(Tool::Ps, &["aux"]), 0);
        assert!(drain(&mut h.events).contains(&EngineEvent::Stopped {
            name: PIXEL.into(),
            method: StopMethod::Console
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_falls_back_to_process_signals() {
        let h = harness(LifecycleSettings::default());
        h.store.set_running(PIXEL, true);
        h.runner.respond(
            Tool::Ps,
            &["aux"],
            CommandOutput::ok(format!(
                "dev 4242 90.0 10.0 1 1 ? Sl 10:00 1:00 qemu-system-x86_64 -avd {}\n",
                PIXEL
            )),
        );

        let report = assert_ok!(h.controller.stop(PIXEL).await);

        assert_eq!(report.method, Some(StopMethod::Signal));
        assert_eq!(h.runner.count(Tool::Kill, &["-TERM", "4242"]), 1);
        assert_eq!(h.runner.count(Tool::Kill, &["-KILL", "4242"]), 1);
        assert_eq!(h.runner.count_prefix(Tool::Pkill, &[]), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_exhausted_is_soft_warning() {
        let mut h = harness(LifecycleSettings::default());
        h.store.set_running(PIXEL, true);
        h.runner.respond_any(Tool::Pkill, CommandOutput::exited("", Some(1)));

        let report = assert_ok!(h.controller.stop(PIXEL).await);

        assert!(report.is_exhausted());
        assert!(matches!(report.warning(), Some(Error::StopExhausted { .. })));
        assert!(!h.store.record(PIXEL).unwrap().is_running);
        assert!(drain(&mut h.events)
            .contains(&EngineEvent::StopExhausted { name: PIXEL.into() }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_releases_stuck_intent() {
        let mut h = harness(LifecycleSettings::default());
        assert!(h.store.try_begin(PIXEL, TransitionIntent::Stopping).unwrap());
        assert_eq!(assert_ok!(h.controller.start(PIXEL).await), Dispatch::Ignored);

        let cleared = h.controller.reset();

        assert_eq!(cleared, vec![PIXEL.to_string()]);
        assert!(drain(&mut h.events).contains(&EngineEvent::StateReset {
            cleared: vec![PIXEL.into()]
        }));
        assert_eq!(assert_ok!(h.controller.start(PIXEL).await), Dispatch::Accepted);
        assert_eq!(h.controller.pending_count(), 1);

        h.controller.reset();
        assert_eq!(h.controller.pending_count(), 0);
        assert!(!h.store.record(PIXEL).unwrap().is_claimed());
    }

    #[tokio::test]
    async fn test_stop_with_no_tools_changes_nothing() {
        let h = harness(LifecycleSettings::default());
        h.store.set_running(PIXEL, true);
        for tool in [Tool::Adb, Tool::Ps, Tool::Kill, Tool::Pkill] {
            h.runner.make_unresolvable(tool);
        }

        let err = h.controller.stop(PIXEL).await.unwrap_err();

        assert!(matches!(err, Error::ToolUnresolvable { .. }));
        let record = h.store.record(PIXEL).unwrap();
        assert!(record.is_running);
        assert_eq!(record.intent, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_settles_to_detector_truth() {
        let h = harness(LifecycleSettings::default());
        boot(&h.runner);
        h.store.set_running(PIXEL, true);
        // emu kill fails and the emulator keeps running
        h.runner.respond(
            Tool::Adb,
            &["-s", "emulator-5554", "emu", "kill"],
            CommandOutput::exited("error: device offline", Some(1)),
        );

        assert_ok!(h.controller.stop(PIXEL).await);
        let record = h.store.record(PIXEL).unwrap();
        assert!(!record.is_running);
        assert!(record.awaiting_confirmation);

        h.controller.settle().await;

        let record = h.store.record(PIXEL).unwrap();
        assert!(record.is_running);
        assert!(!record.awaiting_confirmation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_confirmation() {
        let h = harness(LifecycleSettings::default());

        assert_ok!(h.controller.start(PIXEL).await);
        assert_eq!(h.controller.pending_count(), 1);
        h.runner.clear_calls();

        assert_ok!(h.controller.stop(PIXEL).await);
        h.controller.settle().await;

        // One detection from the stop itself, one from the settle pass
        assert_eq!(h.runner.count(Tool::Adb, &["devices"]), 2);
        assert!(!h.store.record(PIXEL).unwrap().is_running);
        assert_eq!(h.store.snapshot().status, InventoryStatus::Ready);
    }
}
