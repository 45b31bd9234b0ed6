use std::sync::Arc;

use crate::error::VaultError;
use crate::logger::Logger;
use crate::vault::embeddings::EmbeddingProvider;
use crate::vault::storage::SearchHit;
use crate::vault::table_client::VectorTableClient;
use crate::Result;

/// Nearest-neighbour retrieval over one vault's table.
pub struct SemanticSearch {
    table: Arc<VectorTableClient>,
    embedder: Arc<dyn EmbeddingProvider>,
    logger: Logger,
}

impl SemanticSearch {
    pub fn new(table: Arc<VectorTableClient>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            table,
            embedder,
            logger: Logger::new("SemanticSearch"),
        }
    }

    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let query = query.trim();
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut vectors = self.embedder.embed(&[query.to_string()]).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| VaultError::Internal("embedder returned no vector for query".to_string()))?;

        let hits = self.table.nearest(&vector, limit).await?;
        self.logger.debug(&format!("{} hits for {:?}", hits.len(), query));
        Ok(hits)
    }
}
