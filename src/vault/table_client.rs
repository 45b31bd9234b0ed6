use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::settings::{EmbeddingModelConfig, StorageBackend};
use crate::crypto::Blake3Hasher;
use crate::error::VaultError;
use crate::vault::storage::{
    IndexRecord, MemoryTable, SearchHit, SqliteTable, StoredFile, TableSchema, VectorTable,
};
use crate::Result;

/// Owns the physical table of one vault. Created unopened; every data
/// call fails with [`VaultError::NotInitialized`] until [`open`] succeeds.
///
/// [`open`]: VectorTableClient::open
pub struct VectorTableClient {
    backend: StorageBackend,
    database_path: PathBuf,
    vault_dir: PathBuf,
    table_name: String,
    table: RwLock<Option<Arc<dyn VectorTable>>>,
}

impl VectorTableClient {
    pub fn new(backend: StorageBackend, database_path: impl Into<PathBuf>, vault_dir: &Path) -> Self {
        Self {
            backend,
            database_path: database_path.into(),
            vault_dir: vault_dir.to_path_buf(),
            table_name: Blake3Hasher::table_name(vault_dir),
            table: RwLock::new(None),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn vault_dir(&self) -> &Path {
        &self.vault_dir
    }

    pub async fn is_open(&self) -> bool {
        self.table.read().await.is_some()
    }

    /// Opens the table for `model`. Reopening with the same model is a
    /// no-op; a different fingerprint or dimensionality rebuilds it.
    /// Returns true when previous contents were discarded.
    pub async fn open(&self, model: &EmbeddingModelConfig) -> Result<bool> {
        let schema = TableSchema {
            model_fingerprint: model.fingerprint(),
            dimensions: model.dimensions,
        };

        let mut slot = self.table.write().await;
        if let Some(existing) = slot.as_ref() {
            if existing.schema() == &schema {
                return Ok(false);
            }
            existing.flush().await?;
        }

        let (table, recreated): (Arc<dyn VectorTable>, bool) = match self.backend {
            StorageBackend::Sqlite => {
                let opened =
                    SqliteTable::open(&self.database_path, &self.table_name, &self.vault_dir, schema).await?;
                (Arc::new(opened.table), opened.recreated)
            }
            StorageBackend::Memory => (Arc::new(MemoryTable::new(schema)), slot.is_some()),
        };

        info!(
            "Vector table {} ready for {} ({:?})",
            self.table_name,
            self.vault_dir.display(),
            self.backend
        );
        *slot = Some(table);
        Ok(recreated)
    }

    /// Flushes pending writes and drops the table handle. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let table = self.table.write().await.take();
        if let Some(table) = table {
            table.flush().await?;
            debug!("Closed vector table {}", self.table_name);
        }
        Ok(())
    }

    async fn table(&self) -> Result<Arc<dyn VectorTable>> {
        self.table
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or(VaultError::NotInitialized)
    }

    pub async fn dimensions(&self) -> Result<usize> {
        Ok(self.table().await?.schema().dimensions)
    }

    pub async fn stored_files(&self) -> Result<HashMap<String, StoredFile>> {
        Ok(self.table().await?.stored_files().await?)
    }

    pub async fn replace_file(&self, source_path: &str, records: Vec<IndexRecord>) -> Result<()> {
        Ok(self.table().await?.replace_file(source_path, records).await?)
    }

    pub async fn remove_file(&self, source_path: &str) -> Result<usize> {
        Ok(self.table().await?.remove_file(source_path).await?)
    }

    pub async fn remove_prefix(&self, dir: &str) -> Result<usize> {
        Ok(self.table().await?.remove_prefix(dir).await?)
    }

    pub async fn touch_file(&self, source_path: &str, modified_ms: i64, size: u64) -> Result<()> {
        Ok(self.table().await?.touch_file(source_path, modified_ms, size).await?)
    }

    pub async fn nearest(&self, query: &[f32], limit: usize) -> Result<Vec<SearchHit>> {
        Ok(self.table().await?.nearest(query, limit).await?)
    }

    pub async fn records_for(&self, source_path: &str) -> Result<Vec<IndexRecord>> {
        Ok(self.table().await?.records_for(source_path).await?)
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.table().await?.count().await?)
    }

    pub async fn flush(&self) -> Result<()> {
        Ok(self.table().await?.flush().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_calls_fail_until_opened() {
        let client = VectorTableClient::new(StorageBackend::Memory, "unused.sqlite", Path::new("/vault"));
        assert!(matches!(client.count().await, Err(VaultError::NotInitialized)));

        client.open(&EmbeddingModelConfig::default()).await.unwrap();
        assert!(client.is_open().await);
        assert_eq!(client.count().await.unwrap(), 0);
        assert_eq!(client.dimensions().await.unwrap(), 768);

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(matches!(client.count().await, Err(VaultError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_table_name_is_stable_per_directory() {
        let a = VectorTableClient::new(StorageBackend::Memory, "db", Path::new("/notes/a"));
        let again = VectorTableClient::new(StorageBackend::Memory, "db", Path::new("/notes/a"));
        let b = VectorTableClient::new(StorageBackend::Memory, "db", Path::new("/notes/b"));
        assert_eq!(a.table_name(), again.table_name());
        assert_ne!(a.table_name(), b.table_name());
        assert!(a.table_name().starts_with("vault_"));
    }

    #[tokio::test]
    async fn test_sqlite_backend_persists_between_clients() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("data").join("vectordb.sqlite");
        let model = EmbeddingModelConfig {
            dimensions: 2,
            ..EmbeddingModelConfig::default()
        };
        let record = IndexRecord {
            chunk_id: IndexRecord::chunk_id_for("a.md", 0),
            source_path: "a.md".to_string(),
            content_hash: "h".to_string(),
            modified_ms: 1,
            size: 1,
            chunk_index: 0,
            start_offset: 0,
            text: "alpha".to_string(),
            vector: vec![1.0, 0.0],
        };

        let first = VectorTableClient::new(StorageBackend::Sqlite, &db, dir.path());
        assert!(!first.open(&model).await.unwrap());
        first.replace_file("a.md", vec![record]).await.unwrap();
        first.close().await.unwrap();

        let second = VectorTableClient::new(StorageBackend::Sqlite, &db, dir.path());
        second.open(&model).await.unwrap();
        assert_eq!(second.count().await.unwrap(), 1);
    }
}
