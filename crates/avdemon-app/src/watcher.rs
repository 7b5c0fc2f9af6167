//! AVD home directory watcher
//!
//! Every image is registered by a `<name>.ini` file directly in the AVD home
//! directory, so creating, deleting or renaming an AVD (from Android Studio or
//! `avdmanager`) shows up here. Changes are debounced and reported as a
//! [`WatchEvent`]; the engine reacts with a full refresh.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult};
use tokio::sync::{mpsc, oneshot};

use avdemon_core::prelude::*;

/// Default debounce duration in milliseconds
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// Extension of AVD registration files
pub const AVD_INI_EXTENSION: &str = "ini";

/// Notifications from the watcher thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// One or more `*.ini` files changed
    DefinitionsChanged { count: usize },
    /// The watcher reported an error
    Error { message: String },
}

/// Configuration for the AVD watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Directory to watch
    pub dir: PathBuf,
    pub debounce: Duration,
}

impl WatcherConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

/// Whether `path` is an AVD registration file
pub fn is_avd_definition(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == AVD_INI_EXTENSION)
}

/// Watches the AVD home directory until stopped or dropped
pub struct AvdWatcher {
    config: WatcherConfig,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl AvdWatcher {
    pub fn new(config: WatcherConfig) -> Self {
        Self {
            config,
            stop_tx: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Start watching; changes are sent to `event_tx`.
    ///
    /// Returns `Ok(false)` without starting when the directory does not exist.
    pub fn start(&mut self, event_tx: mpsc::Sender<WatchEvent>) -> Result<bool> {
        if self.is_running() {
            return Err(Error::process("AVD watcher is already running"));
        }
        if !self.config.dir.is_dir() {
            debug!(
                "AVD directory {} does not exist; not watching",
                self.config.dir.display()
            );
            return Ok(false);
        }

        let config = self.config.clone();
        let (stop_tx, stop_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tokio::task::spawn_blocking(move || {
            Self::run_watcher(config, event_tx, stop_rx);
        });

        Ok(true)
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_running(&self) -> bool {
        self.stop_tx.is_some()
    }

    fn run_watcher(
        config: WatcherConfig,
        event_tx: mpsc::Sender<WatchEvent>,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let tx = event_tx.clone();

        let debouncer_result = new_debouncer(
            config.debounce,
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let count = events
                        .iter()
                        .filter(|event| event.paths.iter().any(|p| is_avd_definition(p)))
                        .count();
                    if count == 0 {
                        return;
                    }
                    debug!("AVD watcher detected {} change(s)", count);
                    let _ = tx.blocking_send(WatchEvent::DefinitionsChanged { count });
                }
                Err(errors) => {
                    for error in errors {
                        warn!("AVD watcher error: {:?}", error);
                        let _ = tx.blocking_send(WatchEvent::Error {
                            message: error.to_string(),
                        });
                    }
                }
            },
        );

        let mut debouncer = match debouncer_result {
            Ok(d) => d,
            Err(e) => {
                error!("Failed to create AVD watcher: {}", e);
                let _ = event_tx.blocking_send(WatchEvent::Error {
                    message: format!("Failed to create watcher: {}", e),
                });
                return;
            }
        };

        if let Err(e) = debouncer.watch(&config.dir, RecursiveMode::NonRecursive) {
            warn!("Failed to watch {}: {}", config.dir.display(), e);
            let _ = event_tx.blocking_send(WatchEvent::Error {
                message: e.to_string(),
            });
            return;
        }
        info!("Watching AVD directory {}", config.dir.display());

        loop {
            match stop_rx.try_recv() {
                Ok(()) | Err(oneshot::error::TryRecvError::Closed) => {
                    info!("AVD watcher stopping");
                    break;
                }
                Err(oneshot::error::TryRecvError::Empty) => {
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }
}

impl Drop for AvdWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_is_avd_definition() {
        assert!(is_avd_definition(Path::new("/home/dev/.android/avd/Pixel_7.ini")));
        assert!(!is_avd_definition(Path::new("/home/dev/.android/avd/Pixel_7.avd")));
        assert!(!is_avd_definition(Path::new("/home/dev/.android/avd/Pixel_7.ini.lock")));
        assert!(!is_avd_definition(Path::new("ini")));
    }

    #[test]
    fn test_config_builder() {
        let config = WatcherConfig::new("/tmp/avd").with_debounce(Duration::from_millis(50));
        assert_eq!(config.dir, PathBuf::from("/tmp/avd"));
        assert_eq!(config.debounce, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_missing_directory_is_not_watched() {
        let mut watcher = AvdWatcher::new(WatcherConfig::new("/nonexistent/avd/home"));
        let (tx, _rx) = mpsc::channel(8);

        assert!(!watcher.start(tx).unwrap());
        assert!(!watcher.is_running());
    }

    #[tokio::test]
    async fn test_double_start_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut watcher = AvdWatcher::new(WatcherConfig::new(dir.path()));
        let (tx, _rx) = mpsc::channel(8);

        assert!(watcher.start(tx.clone()).unwrap());
        assert!(watcher.start(tx).is_err());

        watcher.stop();
        assert!(!watcher.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_new_ini_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut watcher = AvdWatcher::new(
            WatcherConfig::new(dir.path()).with_debounce(Duration::from_millis(50)),
        );
        let (tx, mut rx) = mpsc::channel(8);
        assert!(watcher.start(tx).unwrap());

        // Let the watcher register before touching the directory
        tokio::time::sleep(Duration::from_millis(300)).await;
        std::fs::write(dir.path().join("Pixel_7_API_33.ini"), "avd.ini.encoding=UTF-8\n").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, WatchEvent::DefinitionsChanged { .. }));

        watcher.stop();
    }
}
