// src/error.rs - Error taxonomy shared by the indexing and inference core
use std::path::PathBuf;

use crate::ai::provider::GenerationError;
use crate::vault::embeddings::EmbeddingError;
use crate::vault::storage::StorageError;

const EMBEDDING_HINT: &str = "Please try downloading an embedding model (or starting the embedding server) and attaching it in settings.";
const GENERIC_HINT: &str = "Please try again, or report the issue if it persists.";

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Vault {directory} is already open in session {owner}")]
    Conflict { directory: PathBuf, owner: String },

    #[error("Session id {0} is already in use")]
    DuplicateSession(String),

    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Embedding function error: embedding model unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Generation session not initialized")]
    NotInitialized,

    #[error("Generation session is busy with another prompt")]
    Busy,

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Embedding error: {0}")]
    Embedding(EmbeddingError),

    #[error("Generation error: {0}")]
    Generation(GenerationError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session closed")]
    Closed,

    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VaultError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        VaultError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_embedding_unavailable(&self) -> bool {
        matches!(self, VaultError::EmbeddingUnavailable(_))
    }

    /// Text sent across the UI boundary. Keeps the "embedding unavailable"
    /// case distinguishable from generic failures.
    pub fn user_message(&self) -> String {
        if self.is_embedding_unavailable() {
            format!("{}. {}", self, EMBEDDING_HINT)
        } else {
            format!("{}. {}", self, GENERIC_HINT)
        }
    }
}

impl From<EmbeddingError> for VaultError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::Unavailable(msg) => VaultError::EmbeddingUnavailable(msg),
            other => VaultError::Embedding(other),
        }
    }
}

impl From<GenerationError> for VaultError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::ModelLoad(msg) => VaultError::ModelLoad(msg),
            other => VaultError::Generation(other),
        }
    }
}

impl From<config::ConfigError> for VaultError {
    fn from(err: config::ConfigError) -> Self {
        VaultError::Config(err.to_string())
    }
}
