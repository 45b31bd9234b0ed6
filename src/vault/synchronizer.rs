//! Reconciles a vault's eligible files with its vector table.
//!
//! A pass plans by path: files on disk without records are added, files
//! whose stat data moved are re-hashed and re-embedded only when the hash
//! differs, records without a file are removed. Embedding work fans out
//! over a bounded number of files at a time; each file's records are
//! replaced atomically, so an interrupted pass never leaves a file with a
//! mix of old and new chunks.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::settings::VaultConfig;
use crate::crypto::Blake3Hasher;
use crate::error::VaultError;
use crate::logger::Logger;
use crate::vault::chunker::{chunk_text, Chunk};
use crate::vault::embeddings::{EmbeddingError, EmbeddingProvider};
use crate::vault::scanner::{relative_key, scan_vault, stat_file, FileFilter, ScannedFile};
use crate::vault::storage::{IndexRecord, StoredFile};
use crate::vault::table_client::VectorTableClient;
use crate::Result;

/// Payloads of a session's index channel, `{"progress": 0.5}` or
/// `{"error": "..."}` once serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexEvent {
    Progress(f32),
    Error(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    pub warnings: Vec<String>,
}

impl SyncReport {
    pub fn changed(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }

    fn sort(&mut self) {
        self.added.sort();
        self.updated.sort();
        self.removed.sort();
        self.unchanged.sort();
    }
}

enum Job {
    Add(ScannedFile),
    Check(ScannedFile, StoredFile),
}

enum FileOutcome {
    Added(String),
    Updated(String),
    Unchanged(String),
    Skipped(String),
    Unavailable(String),
    Stopped,
}

pub struct Synchronizer {
    root: PathBuf,
    table: Arc<VectorTableClient>,
    embedder: Arc<dyn EmbeddingProvider>,
    filter: FileFilter,
    chunk_size: usize,
    concurrency: usize,
    batch_size: usize,
    permits: Arc<Semaphore>,
    stop: CancellationToken,
    logger: Logger,
}

impl Synchronizer {
    /// `permits` bounds concurrent embedding calls across every vault
    /// sharing it.
    pub fn new(
        root: PathBuf,
        table: Arc<VectorTableClient>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: &VaultConfig,
        permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            root,
            table,
            embedder,
            filter: FileFilter::new(config),
            chunk_size: config.chunk_size,
            concurrency: config.embed_concurrency.max(1),
            batch_size: 32,
            permits,
            stop: CancellationToken::new(),
            logger: Logger::new("VaultSynchronizer"),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Once `stop` fires, files not yet started are skipped and the pass
    /// ends with [`VaultError::Closed`]; files in progress finish.
    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full reconciliation of the vault directory.
    #[instrument(skip(self, progress), fields(vault = %self.root.display()))]
    pub async fn run_full(&self, progress: &UnboundedSender<IndexEvent>) -> Result<SyncReport> {
        let started = Instant::now();
        if !tokio::fs::metadata(&self.root).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(VaultError::io(
                &self.root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "vault directory is missing"),
            ));
        }

        let root = self.root.clone();
        let filter = self.filter.clone();
        let scan = tokio::task::spawn_blocking(move || scan_vault(&root, &filter))
            .await
            .map_err(|e| VaultError::Internal(format!("scan task failed: {}", e)))?;
        let stored = self.table.stored_files().await?;

        let mut report = SyncReport {
            warnings: scan.warnings,
            ..SyncReport::default()
        };
        for warning in &report.warnings {
            self.logger.warn(warning);
        }

        let on_disk: HashSet<&str> = scan.files.iter().map(|f| f.rel_path.as_str()).collect();
        let mut to_remove: Vec<String> = stored
            .keys()
            .filter(|path| !on_disk.contains(path.as_str()))
            .cloned()
            .collect();
        to_remove.sort();

        let mut jobs = Vec::new();
        for file in scan.files {
            if let Some(job) = plan_file(file, &stored, &mut report) {
                jobs.push(job);
            }
        }

        self.logger.info(&format!(
            "Plan for {}: {} to embed, {} to remove, {} unchanged",
            self.root.display(),
            jobs.len(),
            to_remove.len(),
            report.unchanged.len()
        ));

        for path in to_remove {
            self.table.remove_file(&path).await?;
            report.removed.push(path);
        }

        self.execute(jobs, &mut report, progress).await?;
        report.sort();

        self.logger.info(&format!(
            "Full pass completed in {:?}: {} added, {} updated, {} removed, {} unchanged, {} warnings",
            started.elapsed(),
            report.added.len(),
            report.updated.len(),
            report.removed.len(),
            report.unchanged.len(),
            report.warnings.len()
        ));
        Ok(report)
    }

    /// Reconciles only `paths` (absolute, or relative to the vault root).
    /// A path that is now a directory, or the root itself, turns the
    /// pass into a full one.
    #[instrument(skip(self, paths, progress), fields(vault = %self.root.display(), paths = paths.len()))]
    pub async fn run_paths(&self, paths: &[PathBuf], progress: &UnboundedSender<IndexEvent>) -> Result<SyncReport> {
        let stored = self.table.stored_files().await?;
        let mut report = SyncReport::default();
        let mut seen = HashSet::new();
        let mut jobs = Vec::new();

        for path in paths {
            let abs = if path.is_absolute() {
                path.clone()
            } else {
                self.root.join(path)
            };
            if !abs.starts_with(&self.root) {
                self.logger.debug(&format!("Ignoring path outside vault: {}", abs.display()));
                continue;
            }
            let rel = match relative_key(&self.root, &abs) {
                Some(rel) => rel,
                None => return self.run_full(progress).await,
            };
            if !seen.insert(rel.clone()) {
                continue;
            }

            let metadata = match tokio::fs::metadata(&abs).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    let removed = self.table.remove_file(&rel).await? + self.table.remove_prefix(&rel).await?;
                    if removed > 0 {
                        report.removed.push(rel);
                    }
                    continue;
                }
                Err(e) => {
                    let warning = format!("Failed to stat {}: {}", abs.display(), e);
                    self.logger.warn(&warning);
                    report.warnings.push(warning);
                    continue;
                }
            };

            if metadata.is_dir() {
                self.logger.debug(&format!("{} is a directory, escalating to a full pass", rel));
                return self.run_full(progress).await;
            }

            if !self.filter.is_eligible(&self.root, &abs) {
                // a file can stop being eligible, e.g. renamed to an ignored extension
                if self.table.remove_file(&rel).await? > 0 {
                    report.removed.push(rel);
                }
                continue;
            }

            match stat_file(&self.root, &abs) {
                Ok(Some(file)) => {
                    if let Some(job) = plan_file(file, &stored, &mut report) {
                        jobs.push(job);
                    }
                }
                Ok(None) => {
                    if self.table.remove_file(&rel).await? > 0 {
                        report.removed.push(rel);
                    }
                }
                Err(e) => {
                    let warning = format!("Failed to stat {}: {}", abs.display(), e);
                    self.logger.warn(&warning);
                    report.warnings.push(warning);
                }
            }
        }

        self.execute(jobs, &mut report, progress).await?;
        report.sort();
        self.logger.debug(&format!(
            "Path pass: {} added, {} updated, {} removed",
            report.added.len(),
            report.updated.len(),
            report.removed.len()
        ));
        Ok(report)
    }

    /// Runs embed jobs and reports progress as files complete. Progress is
    /// computed from the merged completion counter, never per task.
    async fn execute(
        &self,
        jobs: Vec<Job>,
        report: &mut SyncReport,
        progress: &UnboundedSender<IndexEvent>,
    ) -> Result<()> {
        let total = jobs.len();
        let mut completed = 0usize;
        let mut stopped = false;

        let mut outcomes = stream::iter(jobs.into_iter().map(|job| self.process(job)))
            .buffer_unordered(self.concurrency);

        while let Some(outcome) = outcomes.next().await {
            match outcome? {
                FileOutcome::Added(path) => report.added.push(path),
                FileOutcome::Updated(path) => report.updated.push(path),
                FileOutcome::Unchanged(path) => report.unchanged.push(path),
                FileOutcome::Skipped(warning) => {
                    self.logger.warn(&warning);
                    report.warnings.push(warning);
                }
                FileOutcome::Unavailable(message) => {
                    self.logger.error(&format!(
                        "Embedding provider unavailable after {} of {} files: {}",
                        completed, total, message
                    ));
                    // dropping the stream abandons files still in flight
                    return Err(VaultError::EmbeddingUnavailable(message));
                }
                FileOutcome::Stopped => {
                    stopped = true;
                    continue;
                }
            }

            completed += 1;
            if completed < total {
                let _ = progress.send(IndexEvent::Progress(completed as f32 / total as f32));
            }
        }

        if stopped {
            return Err(VaultError::Closed);
        }
        let _ = progress.send(IndexEvent::Progress(1.0));
        Ok(())
    }

    async fn process(&self, job: Job) -> Result<FileOutcome> {
        if self.stop.is_cancelled() {
            return Ok(FileOutcome::Stopped);
        }

        let (file, stored) = match job {
            Job::Add(file) => (file, None),
            Job::Check(file, stored) => (file, Some(stored)),
        };

        let bytes = match tokio::fs::read(&file.abs_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return Ok(FileOutcome::Skipped(format!(
                    "Failed to read {}: {}",
                    file.abs_path.display(),
                    e
                )))
            }
        };
        let hash = Blake3Hasher::hash_content(&bytes);

        if let Some(stored) = &stored {
            if stored.content_hash == hash {
                self.table
                    .touch_file(&file.rel_path, file.modified_ms, file.size)
                    .await?;
                return Ok(FileOutcome::Unchanged(file.rel_path));
            }
        }

        let text = String::from_utf8_lossy(&bytes);
        let chunks = chunk_text(&text, self.chunk_size);
        let vectors = match self.embed_chunks(&chunks).await {
            Ok(vectors) => vectors,
            Err(EmbeddingError::Unavailable(message)) => return Ok(FileOutcome::Unavailable(message)),
            Err(e) => {
                return Ok(FileOutcome::Skipped(format!(
                    "Failed to embed {}: {}",
                    file.rel_path, e
                )))
            }
        };

        let records = build_records(&file, &hash, chunks, vectors, self.embedder.dimensions());
        self.table.replace_file(&file.rel_path, records).await?;

        Ok(match stored {
            Some(_) => FileOutcome::Updated(file.rel_path),
            None => FileOutcome::Added(file.rel_path),
        })
    }

    async fn embed_chunks(&self, chunks: &[Chunk]) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| EmbeddingError::Failed("embedding pool is closed".to_string()))?;
            vectors.extend(self.embedder.embed(&texts).await?);
        }
        Ok(vectors)
    }
}

/// Decides whether a scanned file needs work. Files whose size and mtime
/// match the stored record are unchanged without reading them.
fn plan_file(file: ScannedFile, stored: &HashMap<String, StoredFile>, report: &mut SyncReport) -> Option<Job> {
    match stored.get(&file.rel_path) {
        None => Some(Job::Add(file)),
        Some(existing) if existing.modified_ms == file.modified_ms && existing.size == file.size => {
            report.unchanged.push(file.rel_path);
            None
        }
        Some(existing) => Some(Job::Check(file, existing.clone())),
    }
}

fn build_records(
    file: &ScannedFile,
    hash: &str,
    chunks: Vec<Chunk>,
    vectors: Vec<Vec<f32>>,
    dims: usize,
) -> Vec<IndexRecord> {
    let record = |chunk_index: usize, start_offset: usize, text: String, vector: Vec<f32>| IndexRecord {
        chunk_id: IndexRecord::chunk_id_for(&file.rel_path, start_offset),
        source_path: file.rel_path.clone(),
        content_hash: hash.to_string(),
        modified_ms: file.modified_ms,
        size: file.size,
        chunk_index,
        start_offset,
        text,
        vector,
    };

    if chunks.is_empty() {
        return vec![record(0, 0, String::new(), vec![0.0; dims])];
    }
    chunks
        .into_iter()
        .zip(vectors)
        .map(|(chunk, vector)| record(chunk.index, chunk.start, chunk.text, vector))
        .collect()
}
