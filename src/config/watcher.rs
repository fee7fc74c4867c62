//! Configuration hot-reload watcher.
//!
//! ## Responsibility
//! Watch a sorter TOML file for changes and broadcast validated new configs
//! to subscribers. Invalid reloads are logged and rejected; the current
//! config remains unchanged.
//!
//! ## Guarantees
//! - Only validated configs are broadcast
//! - Invalid file edits are logged but do not disrupt sorting
//! - File watching is debounced to avoid rapid re-reads on multi-write editors
//! - The polling task exits once the watcher is dropped
//!
//! ## NOT Responsible For
//! - Applying the config (see [`super::ConfigHandle::follow`])
//! - Initial config loading (that belongs to `loader`)

use std::path::PathBuf;
use std::sync::mpsc::TryRecvError;
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, Mutex};

use super::loader::load_from_file;
use super::validation::ConfigError;
use super::SorterConfig;

/// Watches a config file for changes and broadcasts validated updates.
pub struct ConfigWatcher {
    tx: broadcast::Sender<SorterConfig>,
    /// Retained watcher handle. Dropping this stops file watching.
    _watcher: Arc<Mutex<RecommendedWatcher>>,
}

impl ConfigWatcher {
    /// Create a new [`ConfigWatcher`] for the given config file path.
    ///
    /// Returns the watcher and a receiver for config change notifications.
    /// The initial config is **not** broadcast; use `loader::load_from_file`
    /// for the initial load.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file watcher cannot be created.
    pub fn new(path: PathBuf) -> Result<(Self, broadcast::Receiver<SorterConfig>), ConfigError> {
        let (tx, rx) = broadcast::channel(8);
        let tx_clone = tx.clone();

        let (notify_tx, notify_rx) = std::sync::mpsc::channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = notify_tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| ConfigError::Io {
            file: path.display().to_string(),
            source: std::io::Error::other(e.to_string()),
        })?;

        // Watch the parent directory so atomic saves (write + rename) are seen.
        let watch_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::Io {
                file: watch_dir.display().to_string(),
                source: std::io::Error::other(e.to_string()),
            })?;

        let watcher = Arc::new(Mutex::new(watcher));

        let config_path = path;
        tokio::spawn(async move {
            let debounce = Duration::from_millis(500);
            let mut last_reload = std::time::Instant::now()
                .checked_sub(debounce)
                .unwrap_or_else(std::time::Instant::now);

            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;

                let mut should_reload = false;
                loop {
                    match notify_rx.try_recv() {
                        Ok(event) => {
                            let relevant =
                                matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                                    && event
                                        .paths
                                        .iter()
                                        .any(|p| p.file_name() == config_path.file_name());
                            should_reload |= relevant;
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => return,
                    }
                }

                if should_reload && last_reload.elapsed() >= debounce {
                    last_reload = std::time::Instant::now();
                    match load_from_file(&config_path) {
                        Ok(new_config) => {
                            tracing::info!(
                                path = %config_path.display(),
                                sorter = %new_config.sorter.name,
                                "sorter config reloaded"
                            );
                            let _ = tx_clone.send(new_config);
                        }
                        Err(e) => {
                            tracing::warn!(
                                path = %config_path.display(),
                                error = %e,
                                "config reload rejected, keeping current config"
                            );
                        }
                    }
                }
            }
        });

        Ok((
            Self {
                tx,
                _watcher: watcher,
            },
            rx,
        ))
    }

    /// Subscribe to config change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SorterConfig> {
        self.tx.subscribe()
    }
}
