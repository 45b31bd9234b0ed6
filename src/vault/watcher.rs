use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::vault::scanner::FileFilter;
use crate::Result;

const IDLE_POLL: Duration = Duration::from_millis(250);

/// A coalesced change for one path. Whether a path changed or went away
/// is decided when the debounce window closes, so a rename arrives as a
/// `Removed` for the old name and a `Changed` for the new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathChange {
    Changed(PathBuf),
    Removed(PathBuf),
}

impl PathChange {
    pub fn path(&self) -> &Path {
        match self {
            PathChange::Changed(path) | PathChange::Removed(path) => path,
        }
    }
}

/// Keeps a directory watch alive. Dropping the handle cancels it.
pub struct WatchHandle {
    root: PathBuf,
    open: Arc<Mutex<bool>>,
    shutdown: CancellationToken,
}

impl WatchHandle {
    /// No batch is delivered once this returns.
    pub fn cancel(&self) {
        if let Ok(mut open) = self.open.lock() {
            *open = false;
        }
        self.shutdown.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Watches `root` recursively and sends debounced batches of changes to
/// `tx`. Events under ignored or hidden directories never leave the
/// watcher thread.
pub fn watch(
    root: &Path,
    debounce: Duration,
    filter: FileFilter,
    tx: UnboundedSender<Vec<PathChange>>,
) -> Result<WatchHandle> {
    let (watch_tx, watch_rx) = std_mpsc::channel();
    let mut watcher = RecommendedWatcher::new(watch_tx, NotifyConfig::default())?;
    watcher.watch(root, RecursiveMode::Recursive)?;

    let open = Arc::new(Mutex::new(true));
    let shutdown = CancellationToken::new();

    let thread_root = root.to_path_buf();
    let thread_open = Arc::clone(&open);
    let thread_shutdown = shutdown.clone();
    std::thread::Builder::new()
        .name("vault-watcher".to_string())
        .spawn(move || {
            // the watcher must live as long as the loop reading its channel
            let _watcher = watcher;
            debounce_loop(
                &thread_root,
                debounce,
                &filter,
                watch_rx,
                &tx,
                &thread_open,
                &thread_shutdown,
            );
            debug!("Watcher for {} stopped", thread_root.display());
        })
        .map_err(|e| crate::error::VaultError::io(root, e))?;

    debug!("Watching {} (debounce {:?})", root.display(), debounce);
    Ok(WatchHandle {
        root: root.to_path_buf(),
        open,
        shutdown,
    })
}

fn debounce_loop(
    root: &Path,
    debounce: Duration,
    filter: &FileFilter,
    events: std_mpsc::Receiver<notify::Result<Event>>,
    tx: &UnboundedSender<Vec<PathChange>>,
    open: &Mutex<bool>,
    shutdown: &CancellationToken,
) {
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let wait = pending
            .values()
            .map(|last| (*last + debounce).saturating_duration_since(Instant::now()))
            .min()
            .unwrap_or(IDLE_POLL)
            .min(IDLE_POLL);

        match events.recv_timeout(wait) {
            Ok(Ok(event)) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    continue;
                }
                let now = Instant::now();
                for path in event.paths {
                    if is_relevant(root, filter, &path) {
                        pending.insert(path, now);
                    }
                }
            }
            Ok(Err(err)) => warn!("Watcher error for {}: {:?}", root.display(), err),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        let due: Vec<PathBuf> = pending
            .iter()
            .filter(|(_, last)| now.duration_since(**last) >= debounce)
            .map(|(path, _)| path.clone())
            .collect();
        if due.is_empty() {
            continue;
        }

        let mut batch: Vec<PathChange> = due
            .into_iter()
            .map(|path| {
                pending.remove(&path);
                if path.exists() {
                    PathChange::Changed(path)
                } else {
                    PathChange::Removed(path)
                }
            })
            .collect();
        batch.sort_by(|a, b| a.path().cmp(b.path()));

        let Ok(open) = open.lock() else { break };
        if !*open {
            break;
        }
        if tx.send(batch).is_err() {
            break;
        }
    }
}

/// Directories and extensionless paths pass through; they may be folders
/// that were created, renamed or removed.
fn is_relevant(root: &Path, filter: &FileFilter, path: &Path) -> bool {
    if path == root || filter.is_ignored_path(root, path) {
        return false;
    }
    filter.has_indexable_extension(path) || path.extension().is_none() || path.is_dir()
}
