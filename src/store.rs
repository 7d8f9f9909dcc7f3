use anyhow::Result;
use async_trait::async_trait;

use crate::db::Database;
use crate::models::StoredChunk;
use crate::ollama::OllamaClient;
use crate::qdrant_store::QdrantStore;
use crate::tantivy_store::TantivyStore;

const TERM_RECALL_K: usize = 72;

#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn lookup_by_term(&self, term: &str) -> Result<Vec<String>>;

    async fn similarity_search(&self, query_text: &str, k: usize) -> Result<Vec<String>>;

    async fn get_chunk(&self, id: &str) -> Result<Option<StoredChunk>>;

    /// Latest year the corpus covers for `terms`, from metadata alone.
    async fn latest_year_for_terms(&self, terms: &[String]) -> Result<Option<i32>>;
}

#[derive(Clone)]
pub struct IndexedChunkStore {
    db: Database,
    tantivy: TantivyStore,
    qdrant: QdrantStore,
    ollama: OllamaClient,
    embedding_model: String,
}

impl IndexedChunkStore {
    pub fn new(
        db: Database,
        tantivy: TantivyStore,
        qdrant: QdrantStore,
        ollama: OllamaClient,
        embedding_model: impl Into<String>,
    ) -> Self {
        Self {
            db,
            tantivy,
            qdrant,
            ollama,
            embedding_model: embedding_model.into(),
        }
    }
}

#[async_trait]
impl ChunkStore for IndexedChunkStore {
    async fn lookup_by_term(&self, term: &str) -> Result<Vec<String>> {
        if !self.tantivy.is_available() {
            return self
                .db
                .search_chunk_ids_by_term(term, TERM_RECALL_K as i64)
                .await;
        }

        let tantivy = self.tantivy.clone();
        let term = term.to_string();
        tokio::task::spawn_blocking(move || tantivy.lookup_term(&term, TERM_RECALL_K)).await?
    }

    async fn similarity_search(&self, query_text: &str, k: usize) -> Result<Vec<String>> {
        let embedding = self.ollama.embed_query(&self.embedding_model, query_text).await?;
        let hits = self.qdrant.search(&embedding, k).await?;
        Ok(hits.into_iter().map(|hit| hit.chunk_id).collect())
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<StoredChunk>> {
        self.db.get_chunk(id).await
    }

    async fn latest_year_for_terms(&self, terms: &[String]) -> Result<Option<i32>> {
        self.db.latest_year_for_terms(terms).await
    }
}
