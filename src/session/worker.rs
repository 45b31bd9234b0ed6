use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::VaultError;
use crate::logger::Logger;
use crate::vault::scanner::FileFilter;
use crate::vault::synchronizer::{IndexEvent, Synchronizer};
use crate::vault::watcher::{watch, PathChange, WatchHandle};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    Full,
    Paths(Vec<PathBuf>),
}

impl SyncRequest {
    /// Requests queued behind a running pass collapse into one.
    pub fn merge(self, other: SyncRequest) -> SyncRequest {
        match (self, other) {
            (SyncRequest::Paths(mut a), SyncRequest::Paths(b)) => {
                let mut seen: BTreeSet<PathBuf> = a.iter().cloned().collect();
                for path in b {
                    if seen.insert(path.clone()) {
                        a.push(path);
                    }
                }
                SyncRequest::Paths(a)
            }
            _ => SyncRequest::Full,
        }
    }
}

pub struct WatchSettings {
    pub debounce: Duration,
    pub filter: FileFilter,
}

/// The single task that runs synchronization passes for one vault, one at
/// a time, and owns starting the watcher.
pub struct VaultWorker {
    requests: UnboundedSender<SyncRequest>,
    stop: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl VaultWorker {
    /// `stop` must be the token the synchronizer was built with.
    pub fn spawn(
        sync: Synchronizer,
        events: UnboundedSender<IndexEvent>,
        watch_settings: WatchSettings,
        watcher: Arc<Mutex<Option<WatchHandle>>>,
        stop: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let run = WorkerLoop {
            sync,
            events,
            watch_settings,
            watcher,
            requests: tx.clone(),
            stop: stop.clone(),
            logger: Logger::new("VaultWorker"),
        };
        let task = tokio::spawn(run.run(rx));
        Self {
            requests: tx,
            stop,
            task: tokio::sync::Mutex::new(Some(task)),
        }
    }

    pub fn request(&self, request: SyncRequest) -> Result<()> {
        if self.stop.is_cancelled() {
            return Err(VaultError::Closed);
        }
        self.requests.send(request).map_err(|_| VaultError::Closed)
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Lets the file being embedded finish, drops the rest and waits for
    /// the task to exit. Idempotent.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Vault worker ended abnormally: {}", e);
            }
        }
    }
}

struct WorkerLoop {
    sync: Synchronizer,
    events: UnboundedSender<IndexEvent>,
    watch_settings: WatchSettings,
    watcher: Arc<Mutex<Option<WatchHandle>>>,
    requests: UnboundedSender<SyncRequest>,
    stop: CancellationToken,
    logger: Logger,
}

impl WorkerLoop {
    async fn run(self, mut rx: UnboundedReceiver<SyncRequest>) {
        loop {
            let first = tokio::select! {
                _ = self.stop.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            let mut request = first;
            while let Ok(queued) = rx.try_recv() {
                request = request.merge(queued);
            }

            let result = match &request {
                SyncRequest::Full => self.sync.run_full(&self.events).await,
                SyncRequest::Paths(paths) => self.sync.run_paths(paths, &self.events).await,
            };

            match result {
                Ok(report) => {
                    if request == SyncRequest::Full {
                        self.ensure_watcher();
                    }
                    if !report.warnings.is_empty() {
                        self.logger.debug(&format!("Pass finished with {} warnings", report.warnings.len()));
                    }
                }
                Err(VaultError::Closed) => break,
                Err(e) => {
                    self.logger.error(&format!("Synchronization of {} failed: {}", self.sync.root().display(), e));
                    let _ = self.events.send(IndexEvent::Error(e.user_message()));
                }
            }
        }
        self.logger.debug(&format!("Worker for {} stopped", self.sync.root().display()));
    }

    /// Starts the watcher after the first successful full pass. Checked
    /// under the watcher lock so a concurrent close never leaks a watch.
    fn ensure_watcher(&self) {
        let Ok(mut slot) = self.watcher.lock() else { return };
        if slot.is_some() || self.stop.is_cancelled() {
            return;
        }

        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel::<Vec<PathChange>>();
        match watch(
            self.sync.root(),
            self.watch_settings.debounce,
            self.watch_settings.filter.clone(),
            batch_tx,
        ) {
            Ok(handle) => {
                let requests = self.requests.clone();
                tokio::spawn(async move {
                    while let Some(batch) = batch_rx.recv().await {
                        let paths = batch.into_iter().map(|change| change.path().to_path_buf()).collect();
                        if requests.send(SyncRequest::Paths(paths)).is_err() {
                            break;
                        }
                    }
                });
                self.logger.info(&format!("Watching {}", self.sync.root().display()));
                *slot = Some(handle);
            }
            Err(e) => {
                self.logger.error(&format!("Failed to watch {}: {}", self.sync.root().display(), e));
                let _ = self.events.send(IndexEvent::Error(e.user_message()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_request_wins_merge() {
        let paths = SyncRequest::Paths(vec![PathBuf::from("a.md")]);
        assert_eq!(paths.clone().merge(SyncRequest::Full), SyncRequest::Full);
        assert_eq!(SyncRequest::Full.merge(paths), SyncRequest::Full);
    }

    #[test]
    fn test_path_requests_union_in_order() {
        let merged = SyncRequest::Paths(vec![PathBuf::from("a.md"), PathBuf::from("b.md")])
            .merge(SyncRequest::Paths(vec![PathBuf::from("b.md"), PathBuf::from("c.md")]));
        assert_eq!(
            merged,
            SyncRequest::Paths(vec![
                PathBuf::from("a.md"),
                PathBuf::from("b.md"),
                PathBuf::from("c.md")
            ])
        );
    }
}
