//! Maps session ids to open vaults and owns their lifecycle.
//!
//! At most one live session exists per canonical vault directory. Model
//! resources are leased from pools shared by every session, so two vaults
//! selecting the same embedding or generation model load it once.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::ai::provider::BackendFactory;
use crate::ai::session::{BackendPool, GenerationSession};
use crate::config::preferences::PreferenceStore;
use crate::config::settings::Settings;
use crate::error::VaultError;
use crate::logger::Logger;
use crate::session::pool::SharedPool;
use crate::session::worker::{SyncRequest, VaultWorker, WatchSettings};
use crate::vault::embeddings::{EmbedderFactory, EmbeddingProvider};
use crate::vault::scanner::FileFilter;
use crate::vault::search::SemanticSearch;
use crate::vault::storage::SearchHit;
use crate::vault::synchronizer::{IndexEvent, Synchronizer};
use crate::vault::table_client::VectorTableClient;
use crate::vault::watcher::WatchHandle;
use crate::Result;

pub type EmbedderPool = SharedPool<Arc<dyn EmbeddingProvider>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

struct Indexing {
    worker: VaultWorker,
    stop: CancellationToken,
    embedder: Arc<dyn EmbeddingProvider>,
    embedder_key: String,
}

/// One open vault. The table and generation session are created with the
/// session but only load on first use.
pub struct VaultSession {
    id: SessionId,
    directory: PathBuf,
    table: Arc<VectorTableClient>,
    generation: Arc<GenerationSession>,
    watcher: Arc<Mutex<Option<WatchHandle>>>,
    indexing: tokio::sync::Mutex<Option<Indexing>>,
    closed: AtomicBool,
}

impl VaultSession {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn table(&self) -> &Arc<VectorTableClient> {
        &self.table
    }

    pub fn generation(&self) -> &Arc<GenerationSession> {
        &self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    pub async fn is_indexing(&self) -> bool {
        self.indexing.lock().await.is_some()
    }

    /// Queues a full pass on the running worker.
    pub async fn reindex(&self) -> Result<()> {
        let indexing = self.indexing.lock().await;
        match indexing.as_ref() {
            Some(indexing) => indexing.worker.request(SyncRequest::Full),
            None => Err(VaultError::NotInitialized),
        }
    }

    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let embedder = {
            let indexing = self.indexing.lock().await;
            match indexing.as_ref() {
                Some(indexing) => Arc::clone(&indexing.embedder),
                None => return Err(VaultError::NotInitialized),
            }
        };
        SemanticSearch::new(Arc::clone(&self.table), embedder)
            .search(query, limit)
            .await
    }
}

pub struct VaultRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<VaultSession>>>,
    settings: Settings,
    prefs: Arc<dyn PreferenceStore>,
    backends: Arc<BackendPool>,
    embedders: EmbedderPool,
    backend_factory: BackendFactory,
    embedder_factory: EmbedderFactory,
    embed_permits: Arc<Semaphore>,
    logger: Logger,
}

impl VaultRegistry {
    pub fn new(
        settings: Settings,
        prefs: Arc<dyn PreferenceStore>,
        backend_factory: BackendFactory,
        embedder_factory: EmbedderFactory,
    ) -> Self {
        let permits = settings.vault.embed_concurrency.max(1);
        Self {
            sessions: Mutex::new(HashMap::new()),
            settings,
            prefs,
            backends: Arc::new(BackendPool::new("GenerationPool")),
            embedders: EmbedderPool::new("EmbeddingPool"),
            backend_factory,
            embedder_factory,
            embed_permits: Arc::new(Semaphore::new(permits)),
            logger: Logger::new("VaultRegistry"),
        }
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<SessionId, Arc<VaultSession>>>> {
        self.sessions
            .lock()
            .map_err(|_| VaultError::Internal("session registry lock poisoned".to_string()))
    }

    /// Registers a session for `directory`. Fails with `Conflict` when a
    /// live session already owns the directory; concurrent opens of the
    /// same directory leave exactly one winner.
    #[instrument(skip(self), fields(session = %id))]
    pub fn open_vault(&self, id: SessionId, directory: &Path) -> Result<Arc<VaultSession>> {
        let directory = std::fs::canonicalize(directory).map_err(|e| VaultError::io(directory, e))?;
        if !directory.is_dir() {
            return Err(VaultError::io(
                &directory,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }

        let mut sessions = self.entries()?;
        if sessions.contains_key(&id) {
            return Err(VaultError::DuplicateSession(id.to_string()));
        }
        if let Some(owner) = sessions.values().find(|s| s.directory == directory) {
            return Err(VaultError::Conflict {
                directory,
                owner: owner.id.to_string(),
            });
        }

        let session = Arc::new(VaultSession {
            id: id.clone(),
            table: Arc::new(VectorTableClient::new(
                self.settings.vault.storage,
                self.settings.vector_db_path(),
                &directory,
            )),
            generation: Arc::new(GenerationSession::new(
                Arc::clone(&self.backends),
                Arc::clone(&self.backend_factory),
            )),
            directory,
            watcher: Arc::new(Mutex::new(None)),
            indexing: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        sessions.insert(id, Arc::clone(&session));
        self.logger.info(&format!(
            "Opened {} as session {}",
            session.directory.display(),
            session.id
        ));
        Ok(session)
    }

    pub fn lookup_by_directory(&self, directory: &Path) -> Result<Arc<VaultSession>> {
        let canonical = std::fs::canonicalize(directory).unwrap_or_else(|_| directory.to_path_buf());
        self.entries()?
            .values()
            .find(|s| s.directory == canonical)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(format!("no session for {}", directory.display())))
    }

    pub fn lookup_by_session_id(&self, id: &SessionId) -> Result<Arc<VaultSession>> {
        self.entries()?
            .get(id)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(format!("session {}", id)))
    }

    /// Opens the session's table with the current embedding model and
    /// starts its worker with an initial full pass. On a session that is
    /// already indexing this only queues another full pass.
    #[instrument(skip(self, session, events), fields(session = %session.id))]
    pub async fn start_indexing(&self, session: &Arc<VaultSession>, events: UnboundedSender<IndexEvent>) -> Result<()> {
        let mut indexing = session.indexing.lock().await;
        if session.is_closed() {
            return Err(VaultError::Closed);
        }
        if let Some(running) = indexing.as_ref() {
            return running.worker.request(SyncRequest::Full);
        }

        let model = self.prefs.get_embedding_model_config();
        if session.table.open(&model).await? {
            self.logger.info(&format!(
                "Index of {} was built for another model and starts over",
                session.directory.display()
            ));
        }

        let key = model.fingerprint();
        let factory = Arc::clone(&self.embedder_factory);
        let config = &model;
        let embedder = self
            .embedders
            .acquire(&key, || async move { (*factory)(config) })
            .await?;

        let stop = CancellationToken::new();
        let sync = Synchronizer::new(
            session.directory.clone(),
            Arc::clone(&session.table),
            Arc::clone(&embedder),
            &self.settings.vault,
            Arc::clone(&self.embed_permits),
        )
        .with_batch_size(model.batch_size)
        .with_stop(stop.clone());

        let worker = VaultWorker::spawn(
            sync,
            events,
            WatchSettings {
                debounce: Duration::from_millis(self.settings.vault.debounce_ms),
                filter: FileFilter::new(&self.settings.vault),
            },
            Arc::clone(&session.watcher),
            stop.clone(),
        );
        worker.request(SyncRequest::Full)?;

        *indexing = Some(Indexing {
            worker,
            stop,
            embedder,
            embedder_key: key,
        });
        Ok(())
    }

    /// Stops the watcher and worker, releases model resources, flushes the
    /// table and forgets the session. Closing an unknown or already closed
    /// session succeeds.
    #[instrument(skip(self), fields(session = %id))]
    pub async fn close_session(&self, id: &SessionId) -> Result<()> {
        let session = match self.entries()?.get(id).cloned() {
            Some(session) => session,
            None => return Ok(()),
        };
        if session.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let indexing = session.indexing.lock().await.take();
        if let Some(indexing) = &indexing {
            indexing.stop.cancel();
        }
        let watch = session.watcher.lock().ok().and_then(|mut slot| slot.take());
        if let Some(watch) = watch {
            watch.cancel();
        }

        if let Some(indexing) = &indexing {
            indexing.worker.shutdown().await;
        }
        session.generation.teardown().await;
        if let Err(e) = session.table.close().await {
            self.logger.warn(&format!("Failed to flush {}: {}", session.table.table_name(), e));
        }
        if let Some(indexing) = indexing {
            if self.embedders.release(&indexing.embedder_key).await.is_some() {
                self.logger.debug(&format!("Embedder {} released", indexing.embedder_key));
            }
        }

        if let Err(e) = self.prefs.set_last_opened_directory(&session.directory) {
            self.logger.warn(&format!("Could not remember {}: {}", session.directory.display(), e));
        }

        self.entries()?.remove(id);
        self.logger.info(&format!("Closed session {}", id));
        Ok(())
    }

    pub async fn close_all(&self) {
        let ids: Vec<SessionId> = match self.entries() {
            Ok(sessions) => sessions.keys().cloned().collect(),
            Err(_) => return,
        };
        for id in ids {
            if let Err(e) = self.close_session(&id).await {
                self.logger.warn(&format!("Failed to close session {}: {}", id, e));
            }
        }
    }

    pub fn sessions(&self) -> Vec<Arc<VaultSession>> {
        self.entries()
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries().map(|sessions| sessions.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn prefs(&self) -> &Arc<dyn PreferenceStore> {
        &self.prefs
    }

    pub async fn loaded_embedders(&self) -> usize {
        self.embedders.len().await
    }

    pub async fn loaded_backends(&self) -> usize {
        self.backends.len().await
    }
}
