//! Configuration file watching.

use std::path::{Path, PathBuf};
use std::sync::Weak;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tracing::{debug, warn};

use crate::orchestrator::OrchestratorInner;

#[derive(Debug, Error)]
pub enum WatchError {
    /// The watcher was stopped once already.
    #[error("Config watcher already stopped")]
    AlreadyStopped,
    #[error("Filesystem watch error: {0}")]
    Notify(#[from] notify::Error),
}

/// Something that watches the endpoint configuration file and can be
/// stopped. `stop` may report [`WatchError::AlreadyStopped`], which
/// callers tolerate.
pub trait ConfigWatcher: Send {
    fn stop(&mut self) -> Result<(), WatchError>;
}

/// `notify`-backed watcher that triggers a fleet hot-swap whenever the
/// configuration file is modified.
///
/// The parent directory is watched rather than the file itself so that
/// editors replacing the file via rename are still observed.
pub struct NotifyConfigWatcher {
    watcher: Option<RecommendedWatcher>,
}

impl NotifyConfigWatcher {
    pub(crate) fn spawn(
        config_file: &Path,
        orchestrator: Weak<OrchestratorInner>,
        runtime: tokio::runtime::Handle,
    ) -> Result<Self, WatchError> {
        let file_name = config_file.file_name().map(|n| n.to_os_string());
        let watch_dir: PathBuf = config_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut watcher =
            notify::recommended_watcher(move |event: Result<notify::Event, notify::Error>| {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Config watch error: {}", e);
                        return;
                    }
                };
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    return;
                }
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == file_name.as_deref());
                if !ours {
                    return;
                }
                if let Some(inner) = orchestrator.upgrade() {
                    debug!("Endpoint configuration changed; scheduling hot-swap");
                    runtime.spawn(async move {
                        inner.hotswap_endpoint_managers().await;
                    });
                }
            })?;
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
        Ok(Self {
            watcher: Some(watcher),
        })
    }
}

impl ConfigWatcher for NotifyConfigWatcher {
    fn stop(&mut self) -> Result<(), WatchError> {
        match self.watcher.take() {
            Some(watcher) => {
                drop(watcher);
                Ok(())
            }
            None => Err(WatchError::AlreadyStopped),
        }
    }
}
