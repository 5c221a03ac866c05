//! Hot reload of OAuth server definitions
//!
//! Watches the definitions directory and, after changes settle, refreshes
//! the [`FileRepository`] and runs a [`Loader`] cycle. An optional fixed
//! poll interval triggers the same reload for directories on filesystems
//! without change notifications.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

use super::file_repository::is_definition_file;
use super::{FileRepository, Loader};
use crate::{Error, Result};

/// Quiet period after the last change before reloading
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Running definition watcher; dropping it stops file notifications
pub struct DefinitionWatcher {
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl DefinitionWatcher {
    /// Start watching `repository`'s directory (when `watch`) and polling
    /// every `poll_interval` (when set). Stops on `shutdown_rx`.
    pub fn start(
        repository: Arc<FileRepository>,
        loader: Arc<Loader>,
        watch: bool,
        poll_interval: Option<Duration>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::channel(100);

        let watcher = if watch {
            Some(Self::create_watcher(event_tx, repository.directory())?)
        } else {
            None
        };

        if watcher.is_none() && poll_interval.is_none() {
            debug!("Definition reload disabled");
            return Ok(Self {
                _watcher: Mutex::new(None),
            });
        }

        Self::spawn_reload_task(repository, loader, event_rx, poll_interval, shutdown_rx);
        Ok(Self {
            _watcher: Mutex::new(watcher),
        })
    }

    fn create_watcher(event_tx: mpsc::Sender<()>, directory: &Path) -> Result<RecommendedWatcher> {
        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) && event.paths.iter().any(|p| is_definition_file(p));

                    if relevant {
                        debug!(paths = ?event.paths, kind = ?event.kind, "Definition file change");
                        // full channel: a reload is already pending
                        let _ = event_tx.try_send(());
                    }
                }
                Err(e) => error!(error = %e, "Definition watcher error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| Error::Internal(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(directory, RecursiveMode::Recursive)
            .map_err(|e| Error::Internal(format!("Failed to watch {}: {e}", directory.display())))?;
        info!(directory = %directory.display(), "Watching for definition changes");
        Ok(watcher)
    }

    fn spawn_reload_task(
        repository: Arc<FileRepository>,
        loader: Arc<Loader>,
        mut event_rx: mpsc::Receiver<()>,
        poll_interval: Option<Duration>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        tokio::spawn(async move {
            let mut last_event: Option<Instant> = None;
            let mut ticker = tokio::time::interval(Duration::from_millis(100));

            // a disabled poller never fires
            let poll_every = poll_interval.unwrap_or(Duration::MAX);
            let mut next_poll = Instant::now().checked_add(poll_every);

            loop {
                tokio::select! {
                    Some(()) = event_rx.recv() => {
                        last_event = Some(Instant::now());
                    }
                    _ = ticker.tick() => {
                        let settled = last_event.is_some_and(|at| at.elapsed() >= DEBOUNCE);
                        let poll_due = next_poll.is_some_and(|at| Instant::now() >= at);
                        if settled || poll_due {
                            last_event = None;
                            next_poll = Instant::now().checked_add(poll_every);
                            reload(&repository, &loader, if settled { "change" } else { "poll" }).await;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Definition watcher shutting down");
                        break;
                    }
                }
            }
        });
    }
}

async fn reload(repository: &FileRepository, loader: &Loader, trigger: &str) {
    debug!(trigger, "Reloading OAuth server definitions");
    if let Err(e) = repository.refresh().await {
        error!(error = %e, "Definition refresh failed, keeping current routes");
        return;
    }
    match loader.reload().await {
        Ok(report) => info!(trigger, routes = report.routes, removed = report.removed, "Hot-reload complete"),
        Err(e) => error!(error = %e, "Hot-reload failed"),
    }
}
