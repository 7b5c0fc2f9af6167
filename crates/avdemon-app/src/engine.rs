//! Engine - owner of everything the CLI and headless runner drive
//!
//! Built explicitly from [`Settings`] and torn down with [`Engine::shutdown`];
//! there is no global state. The engine owns:
//! - the command runner (real processes, or a scripted one in tests)
//! - the [`StateStore`] and the event broadcaster
//! - the [`LifecycleController`] and its confirmation tasks
//! - the periodic [`Reconciler`] and the AVD directory watcher, once started

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use avdemon_core::prelude::*;
use avdemon_daemon::{avd_home, list_images, CommandRunner, SdkPaths, SystemCommandRunner};

use crate::config::Settings;
use crate::engine_event::EngineEvent;
use crate::lifecycle::{Dispatch, LifecycleController, StopReport};
use crate::reconciler::{self, Reconciler};
use crate::store::{Inventory, InventoryStatus, StateStore};
use crate::watcher::{AvdWatcher, WatchEvent, WatcherConfig};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the watcher → engine channel
const WATCH_CHANNEL_CAPACITY: usize = 32;

/// One enumeration pass followed by one reconciliation pass.
///
/// Enumeration runs under `timeout`; when not even the image names arrive in
/// time the inventory is cleared and marked [`InventoryStatus::TimedOut`].
pub async fn refresh_inventory<R>(
    runner: &R,
    store: &StateStore,
    events: &broadcast::Sender<EngineEvent>,
    timeout: Duration,
) -> InventoryStatus
where
    R: CommandRunner + Sync,
{
    store.begin_loading();

    let status = match list_images(runner, timeout).await {
        Some(images) => store.replace_images(images),
        None => {
            warn!("AVD enumeration did not finish within {:?}", timeout);
            store.mark_timed_out();
            InventoryStatus::TimedOut
        }
    };

    let count = store.snapshot().len();
    info!("Inventory refreshed: {:?}, {} image(s)", status, count);
    let _ = events.send(EngineEvent::InventoryRefreshed { status, count });

    reconciler::reconcile_once(runner, store, events).await;
    status
}

/// Orchestration engine for AVD lifecycle management.
pub struct Engine<R = SystemCommandRunner> {
    /// Loaded settings
    pub settings: Settings,

    runner: Arc<R>,
    store: StateStore,
    controller: LifecycleController<R>,
    event_tx: broadcast::Sender<EngineEvent>,

    /// Send `true` to stop the background tasks
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    reconciler_task: Option<JoinHandle<()>>,
    watcher: Option<AvdWatcher>,
    watcher_task: Option<JoinHandle<()>>,
}

impl Engine<SystemCommandRunner> {
    /// Create an engine that runs the real Android tools.
    ///
    /// The SDK root comes from `settings.sdk.path`, then the environment; a
    /// missing SDK only means tools are looked up on `PATH`.
    pub fn new(settings: Settings) -> Self {
        let locator = SdkPaths::new(settings.sdk.path.clone());
        if let Some(message) = locator.unavailable_message() {
            warn!("{}", message);
        }

        let runner =
            SystemCommandRunner::new(Arc::new(locator)).with_timeout(settings.commands.timeout());
        Self::with_runner(settings, Arc::new(runner))
    }
}

impl<R> Engine<R>
where
    R: CommandRunner + Sync + 'static,
{
    /// Create an engine around an existing runner
    pub fn with_runner(settings: Settings, runner: Arc<R>) -> Self {
        let store = StateStore::new();
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let controller = LifecycleController::new(
            runner.clone(),
            store.clone(),
            settings.lifecycle.clone(),
            event_tx.clone(),
        );

        Self {
            settings,
            runner,
            store,
            controller,
            event_tx,
            shutdown_tx,
            shutdown_rx,
            reconciler_task: None,
            watcher: None,
            watcher_task: None,
        }
    }

    // ─────────────────────────────────────────────────────────
    // Background tasks
    // ─────────────────────────────────────────────────────────

    /// Start the periodic reconciler (no-op if already running)
    pub fn start_reconciler(&mut self) {
        if self.reconciler_task.is_some() {
            return;
        }
        let reconciler = Reconciler::new(
            self.runner.clone(),
            self.store.clone(),
            self.event_tx.clone(),
            self.settings.reconcile.interval(),
        );
        self.reconciler_task = Some(reconciler.spawn(self.shutdown_rx.clone()));
    }

    /// Watch the AVD home directory and refresh on changes.
    ///
    /// Does nothing when the watcher is disabled in settings or the directory
    /// cannot be determined.
    pub fn start_watcher(&mut self) -> Result<()> {
        if !self.settings.watcher.enabled {
            debug!("AVD watcher disabled in settings");
            return Ok(());
        }
        match avd_home() {
            Some(dir) => self.start_watcher_in(dir),
            None => {
                debug!("No AVD home directory; not watching");
                Ok(())
            }
        }
    }

    /// Watch `dir` for AVD definition changes
    pub fn start_watcher_in(&mut self, dir: PathBuf) -> Result<()> {
        if self.watcher.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let mut watcher =
            AvdWatcher::new(WatcherConfig::new(dir).with_debounce(self.settings.watcher.debounce()));
        if !watcher.start(tx)? {
            return Ok(());
        }

        self.watcher = Some(watcher);
        self.watcher_task = Some(self.spawn_watch_bridge(rx));
        Ok(())
    }

    /// Start both background tasks
    pub fn start_background(&mut self) -> Result<()> {
        self.start_reconciler();
        self.start_watcher()
    }

    fn spawn_watch_bridge(&self, mut rx: mpsc::Receiver<WatchEvent>) -> JoinHandle<()> {
        let runner = self.runner.clone();
        let store = self.store.clone();
        let events = self.event_tx.clone();
        let timeout = self.settings.enumeration.timeout();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(WatchEvent::DefinitionsChanged { count }) => {
                            info!("AVD definitions changed, refreshing");
                            let _ = events.send(EngineEvent::DefinitionsChanged { count });
                            refresh_inventory(runner.as_ref(), &store, &events, timeout).await;
                        }
                        Some(WatchEvent::Error { message }) => {
                            let _ = events.send(EngineEvent::WatcherError { message });
                        }
                        None => break,
                    },
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Watcher bridge stopped");
        })
    }

    // ─────────────────────────────────────────────────────────
    // Operations
    // ─────────────────────────────────────────────────────────

    /// Enumerate images, then reconcile their running state
    pub async fn refresh(&self) -> InventoryStatus {
        refresh_inventory(
            self.runner.as_ref(),
            &self.store,
            &self.event_tx,
            self.settings.enumeration.timeout(),
        )
        .await
    }

    /// One on-demand reconciliation pass
    pub async fn reconcile_once(&self) -> Vec<(String, bool)> {
        reconciler::reconcile_once(self.runner.as_ref(), &self.store, &self.event_tx).await
    }

    pub async fn start(&self, name: &str) -> Result<Dispatch> {
        self.controller.start(name).await
    }

    pub async fn stop(&self, name: &str) -> Result<StopReport> {
        self.controller.stop(name).await
    }

    /// Wait for outstanding confirmation and settle tasks
    pub async fn settle(&self) {
        self.controller.settle().await;
    }

    /// Release stuck intents, then reconcile so the running flags match the
    /// detector again
    pub async fn reset(&self) -> Vec<String> {
        let cleared = self.controller.reset();
        self.reconcile_once().await;
        cleared
    }

    // ─────────────────────────────────────────────────────────
    // Observation
    // ─────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Inventory {
        self.store.snapshot()
    }

    /// Receiver notified whenever the inventory changes
    pub fn subscribe(&self) -> watch::Receiver<Inventory> {
        self.store.subscribe()
    }

    /// Receiver of engine events from this point on
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn runner(&self) -> &Arc<R> {
        &self.runner
    }

    /// Sender that triggers shutdown of the background tasks (e.g. from a signal handler)
    pub fn shutdown_sender(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Receiver observing the shutdown flag
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.as_ref().is_some_and(AvdWatcher::is_running)
    }

    // ─────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────

    /// Stop every background task the engine started.
    ///
    /// Confirmation tasks are aborted, not awaited; call [`Engine::settle`]
    /// first to let them finish.
    pub async fn shutdown(&mut self) {
        info!("Engine shutting down");
        let _ = self.event_tx.send(EngineEvent::Shutdown);
        let _ = self.shutdown_tx.send(true);

        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
        if let Some(task) = self.watcher_task.take() {
            if let Err(e) = task.await {
                warn!("Watcher bridge ended abnormally: {}", e);
            }
        }
        if let Some(task) = self.reconciler_task.take() {
            if let Err(e) = task.await {
                warn!("Reconciler ended abnormally: {}", e);
            }
        }

        self.controller.abort_all();
    }
}

impl<R> Drop for Engine<R> {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.reconciler_task.take() {
            task.abort();
        }
        if let Some(task) = self.watcher_task.take() {
            task.abort();
        }
        self.controller.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avdemon_core::AvdImage;
    use avdemon_daemon::test_utils::FakeRunner;
    use avdemon_daemon::{CommandOutput, Tool};
    use tempfile::TempDir;

    fn engine_with(names: &[&str]) -> (Engine<FakeRunner>, Arc<FakeRunner>) {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(
            Tool::Emulator,
            &["-list-avds"],
            CommandOutput::ok(names.join("\n")),
        );
        runner.make_unresolvable(Tool::AvdManager);
        runner.set_adb_devices(&[]);
        (Engine::with_runner(Settings::default(), runner.clone()), runner)
    }

    #[tokio::test]
    async fn test_refresh_populates_inventory() {
        let (engine, runner) = engine_with(&["Pixel_7_API_33", "Tablet_API_34"]);
        let mut events = engine.events();

        let status = engine.refresh().await;

        assert_eq!(status, InventoryStatus::Ready);
        let inventory = engine.snapshot();
        assert_eq!(inventory.len(), 2);
        assert!(inventory.running().is_empty());
        assert_eq!(
            events.try_recv().unwrap(),
            EngineEvent::InventoryRefreshed {
                status: InventoryStatus::Ready,
                count: 2
            }
        );
        assert_eq!(runner.count(Tool::Adb, &["devices"]), 1);
    }

    #[tokio::test]
    async fn test_refresh_with_no_images() {
        let (engine, runner) = engine_with(&[]);

        assert_eq!(engine.refresh().await, InventoryStatus::Empty);
        assert!(engine.snapshot().placeholder().is_some());
        // No images, no detection pass
        assert_eq!(runner.count(Tool::Adb, &["devices"]), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_timeout_marks_timed_out() {
        let (engine, runner) = engine_with(&["Pixel_7_API_33"]);
        runner.set_latency(Duration::from_secs(30));

        assert_eq!(engine.refresh().await, InventoryStatus::TimedOut);

        let inventory = engine.snapshot();
        assert!(inventory.is_empty());
        assert_eq!(
            inventory.placeholder().map(|p| p.name),
            Some(AvdImage::timed_out_placeholder().name)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_with_slow_avdmanager_is_ready() {
        let (engine, runner) = engine_with(&["Pixel_7_API_33"]);
        runner.make_resolvable(Tool::AvdManager);
        runner.respond(Tool::AvdManager, &["list", "avd"], CommandOutput::ok(""));
        runner.set_tool_latency(Tool::Emulator, Duration::from_secs(1));
        runner.set_tool_latency(Tool::AvdManager, Duration::from_millis(9_500));

        assert_eq!(engine.refresh().await, InventoryStatus::Ready);

        let record = engine.store().record("Pixel_7_API_33").unwrap();
        assert_eq!(record.image.api_level, "33");
    }

    #[tokio::test]
    async fn test_refresh_keeps_running_state() {
        let (engine, runner) = engine_with(&["Pixel_7_API_33"]);
        runner.set_adb_devices(&[("emulator-5554", "device")]);
        runner.add_running_emulator("emulator-5554", "Pixel_7_API_33");

        engine.refresh().await;
        engine.refresh().await;

        assert!(engine.store().record("Pixel_7_API_33").unwrap().is_running);
    }

    #[tokio::test]
    async fn test_shutdown_stops_background_tasks() {
        let (mut engine, _runner) = engine_with(&["Pixel_7_API_33"]);
        let dir = TempDir::new().unwrap();
        let mut events = engine.events();

        engine.start_reconciler();
        engine.start_watcher_in(dir.path().to_path_buf()).unwrap();
        assert!(engine.is_watching());

        engine.shutdown().await;

        assert!(!engine.is_watching());
        assert!(*engine.shutdown_receiver().borrow());
        assert_eq!(events.try_recv().unwrap(), EngineEvent::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restores_detector_truth() {
        let (engine, runner) = engine_with(&["Pixel_7_API_33"]);
        engine.refresh().await;
        engine.start("Pixel_7_API_33").await.unwrap();
        assert!(engine.store().record("Pixel_7_API_33").unwrap().is_running);

        let cleared = engine.reset().await;

        // Never booted: the optimistic flag is corrected right away
        assert_eq!(cleared, vec!["Pixel_7_API_33".to_string()]);
        let record = engine.store().record("Pixel_7_API_33").unwrap();
        assert!(!record.is_running);
        assert!(!record.is_claimed());
        assert_eq!(runner.count(Tool::Emulator, &["-avd", "Pixel_7_API_33"]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_aborts_confirmation_tasks() {
        let (engine, runner) = engine_with(&["Pixel_7_API_33"]);
        engine.refresh().await;
        engine.start("Pixel_7_API_33").await.unwrap();
        let store = engine.store().clone();
        assert!(store.record("Pixel_7_API_33").unwrap().awaiting_confirmation);
        let detections = runner.count(Tool::Adb, &["devices"]);

        drop(engine);
        tokio::time::sleep(Duration::from_secs(15)).await;

        assert_eq!(runner.count(Tool::Adb, &["devices"]), detections);
        assert!(!store.record("Pixel_7_API_33").unwrap().awaiting_confirmation);
    }

    #[tokio::test]
    async fn test_watcher_on_missing_dir_is_skipped() {
        let (mut engine, _runner) = engine_with(&[]);
        engine
            .start_watcher_in(PathBuf::from("/nonexistent/avd/home"))
            .unwrap();
        assert!(!engine.is_watching());
    }
}
