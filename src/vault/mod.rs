pub mod chunker;
pub mod embeddings;
pub mod scanner;
pub mod search;
pub mod storage;
pub mod synchronizer;
pub mod table_client;
pub mod watcher;

pub use embeddings::{build_embedder, default_embedder_factory, EmbedderFactory, EmbeddingError, EmbeddingProvider};
pub use search::SemanticSearch;
pub use storage::{IndexRecord, SearchHit, VectorTable};
pub use synchronizer::{IndexEvent, SyncReport, Synchronizer};
pub use table_client::VectorTableClient;
pub use watcher::{watch, PathChange, WatchHandle};
