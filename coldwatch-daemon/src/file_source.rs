// Coldwatch Daemon - File-backed settings source
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Settings read from a JSON file and polled for changes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use coldwatch::{ConfigError, ConfigSource, GatewaySettings};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default poll interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// [`ConfigSource`] backed by a JSON file
pub struct FileConfigSource {
    path: PathBuf,
    poll_interval: Duration,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl FileConfigSource {
    /// Source reading `path`
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
            watcher: Mutex::new(None),
        }
    }

    /// File being read
    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn read_settings(path: &Path) -> Result<Option<GatewaySettings>, ConfigError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            })
        }
    };
    GatewaySettings::from_json(&text)
        .map(Some)
        .map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
}

impl ConfigSource for FileConfigSource {
    async fn fetch(&self) -> Result<Option<GatewaySettings>, ConfigError> {
        read_settings(&self.path).await
    }

    async fn listen(
        &self,
        updates: Arc<watch::Sender<GatewaySettings>>,
    ) -> Result<(), ConfigError> {
        let path = self.path.clone();
        let poll_interval = self.poll_interval;
        info!(path = %path.display(), poll_ms = poll_interval.as_millis() as u64, "Watching settings file");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match read_settings(&path).await {
                    Ok(Some(settings)) => {
                        let changed = updates.send_if_modified(|current| {
                            if *current == settings {
                                return false;
                            }
                            *current = settings;
                            true
                        });
                        if changed {
                            info!(path = %path.display(), "Settings updated");
                        } else {
                            debug!("Settings unchanged");
                        }
                    }
                    Ok(None) => warn!(path = %path.display(), "Settings file missing"),
                    Err(e) => warn!(error = %e, "Ignoring unreadable settings"),
                }
            }
        });

        if let Ok(mut watcher) = self.watcher.lock() {
            if let Some(previous) = watcher.replace(task) {
                previous.abort();
            }
        }
        Ok(())
    }
}

impl Drop for FileConfigSource {
    fn drop(&mut self) {
        if let Ok(mut watcher) = self.watcher.lock() {
            if let Some(task) = watcher.take() {
                task.abort();
            }
        }
    }
}
