pub mod memory_store;
pub mod sqlite_store;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use memory_store::MemoryTable;
pub use sqlite_store::SqliteTable;

/// One embedded chunk of a vault file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub chunk_id: String,
    /// Vault-relative path with `/` separators
    pub source_path: String,
    pub content_hash: String,
    pub modified_ms: i64,
    pub size: u64,
    pub chunk_index: usize,
    pub start_offset: usize,
    pub text: String,
    pub vector: Vec<f32>,
}

impl IndexRecord {
    pub fn chunk_id_for(source_path: &str, start_offset: usize) -> String {
        format!("{}#{}", source_path, start_offset)
    }

    pub fn dims(&self) -> usize {
        self.vector.len()
    }

    /// Files without any text still get one record so that unchanged empty
    /// files are recognised on the next pass.
    pub fn is_marker(&self) -> bool {
        self.text.is_empty()
    }
}

/// Per-file summary of what the table holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub content_hash: String,
    pub modified_ms: i64,
    pub size: u64,
    pub chunks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub source_path: String,
    pub text: String,
    pub score: f32,
}

/// What the table was built with; a mismatch invalidates its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub model_fingerprint: String,
    pub dimensions: usize,
}

/// One physical vector table. Owns no policy about what "stale" means;
/// the synchronizer decides, the table applies.
#[async_trait::async_trait]
pub trait VectorTable: Send + Sync {
    fn schema(&self) -> &TableSchema;

    /// Distinct source paths with their stored hash and stat data.
    async fn stored_files(&self) -> Result<HashMap<String, StoredFile>, StorageError>;

    /// Replaces every record of `source_path` with `records`, all or nothing.
    async fn replace_file(&self, source_path: &str, records: Vec<IndexRecord>) -> Result<(), StorageError>;

    /// Removes every record of `source_path`, returning how many were deleted.
    async fn remove_file(&self, source_path: &str) -> Result<usize, StorageError>;

    /// Removes every record under the directory `dir` (vault-relative).
    async fn remove_prefix(&self, dir: &str) -> Result<usize, StorageError>;

    /// Refreshes stat data of records whose content is unchanged.
    async fn touch_file(&self, source_path: &str, modified_ms: i64, size: u64) -> Result<(), StorageError>;

    async fn nearest(&self, query: &[f32], limit: usize) -> Result<Vec<SearchHit>, StorageError>;

    async fn records_for(&self, source_path: &str) -> Result<Vec<IndexRecord>, StorageError>;

    async fn count(&self) -> Result<usize, StorageError>;

    async fn flush(&self) -> Result<(), StorageError>;
}

pub(crate) fn validate_records(
    schema: &TableSchema,
    source_path: &str,
    records: &[IndexRecord],
) -> Result<(), StorageError> {
    for record in records {
        if record.source_path != source_path {
            return Err(StorageError::ForeignRecord {
                expected: source_path.to_string(),
                actual: record.source_path.clone(),
            });
        }
        if record.dims() != schema.dimensions {
            return Err(StorageError::InvalidVectorDimension {
                expected: schema.dimensions,
                actual: record.dims(),
            });
        }
    }
    Ok(())
}

pub(crate) fn rank_hits<'a, I>(query: &[f32], candidates: I, limit: usize) -> Vec<SearchHit>
where
    I: Iterator<Item = &'a IndexRecord>,
{
    let mut hits: Vec<SearchHit> = candidates
        .filter(|record| !record.is_marker())
        .map(|record| SearchHit {
            chunk_id: record.chunk_id.clone(),
            source_path: record.source_path.clone(),
            text: record.text.clone(),
            score: crate::vault::embeddings::cosine_similarity(query, &record.vector),
        })
        .collect();
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(limit);
    hits
}

/// Error types for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid vector dimension: expected {expected}, got {actual}")]
    InvalidVectorDimension { expected: usize, actual: usize },

    #[error("Record for {actual} passed while replacing {expected}")]
    ForeignRecord { expected: String, actual: String },

    #[error("Corrupt vector blob for chunk {0}")]
    CorruptVector(String),

    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),

    #[error("Storage task failed: {0}")]
    Task(String),
}
