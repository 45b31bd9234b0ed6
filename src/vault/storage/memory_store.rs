use std::collections::HashMap;

use tokio::sync::RwLock;

use super::{rank_hits, validate_records, IndexRecord, SearchHit, StorageError, StoredFile, TableSchema, VectorTable};

/// In-process table keyed by source path. Contents live as long as the
/// value does.
pub struct MemoryTable {
    schema: TableSchema,
    files: RwLock<HashMap<String, Vec<IndexRecord>>>,
}

impl MemoryTable {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            files: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait::async_trait]
impl VectorTable for MemoryTable {
    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    async fn stored_files(&self) -> Result<HashMap<String, StoredFile>, StorageError> {
        let files = self.files.read().await;
        Ok(files
            .iter()
            .filter_map(|(path, records)| {
                records.first().map(|first| {
                    (
                        path.clone(),
                        StoredFile {
                            content_hash: first.content_hash.clone(),
                            modified_ms: first.modified_ms,
                            size: first.size,
                            chunks: records.len(),
                        },
                    )
                })
            })
            .collect())
    }

    async fn replace_file(&self, source_path: &str, mut records: Vec<IndexRecord>) -> Result<(), StorageError> {
        validate_records(&self.schema, source_path, &records)?;
        let mut files = self.files.write().await;
        if records.is_empty() {
            files.remove(source_path);
        } else {
            records.sort_by_key(|r| r.chunk_index);
            files.insert(source_path.to_string(), records);
        }
        Ok(())
    }

    async fn remove_file(&self, source_path: &str) -> Result<usize, StorageError> {
        let mut files = self.files.write().await;
        Ok(files.remove(source_path).map(|r| r.len()).unwrap_or(0))
    }

    async fn remove_prefix(&self, dir: &str) -> Result<usize, StorageError> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let mut files = self.files.write().await;
        let doomed: Vec<String> = files
            .keys()
            .filter(|path| path.starts_with(&prefix))
            .cloned()
            .collect();
        let mut removed = 0;
        for path in doomed {
            removed += files.remove(&path).map(|r| r.len()).unwrap_or(0);
        }
        Ok(removed)
    }

    async fn touch_file(&self, source_path: &str, modified_ms: i64, size: u64) -> Result<(), StorageError> {
        let mut files = self.files.write().await;
        if let Some(records) = files.get_mut(source_path) {
            for record in records.iter_mut() {
                record.modified_ms = modified_ms;
                record.size = size;
            }
        }
        Ok(())
    }

    async fn nearest(&self, query: &[f32], limit: usize) -> Result<Vec<SearchHit>, StorageError> {
        if query.len() != self.schema.dimensions {
            return Err(StorageError::InvalidVectorDimension {
                expected: self.schema.dimensions,
                actual: query.len(),
            });
        }
        let files = self.files.read().await;
        Ok(rank_hits(query, files.values().flatten(), limit))
    }

    async fn records_for(&self, source_path: &str) -> Result<Vec<IndexRecord>, StorageError> {
        let files = self.files.read().await;
        Ok(files.get(source_path).cloned().unwrap_or_default())
    }

    async fn count(&self) -> Result<usize, StorageError> {
        let files = self.files.read().await;
        Ok(files.values().map(Vec::len).sum())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
