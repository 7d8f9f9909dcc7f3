use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{Chunk, Provenance, Query};
use crate::store::ChunkStore;

#[derive(Clone)]
pub struct RetrievalMerger {
    store: Arc<dyn ChunkStore>,
    similarity_k: usize,
}

impl RetrievalMerger {
    pub fn new(store: Arc<dyn ChunkStore>, similarity_k: usize) -> Self {
        Self {
            store,
            similarity_k: similarity_k.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    /// Raw candidates for `query`, in first-seen order (keyword hits first).
    pub async fn retrieve(&self, query: &Query) -> PipelineResult<Vec<Chunk>> {
        let ids = self
            .candidate_ids(&query.subject_terms, &query.raw_text, self.similarity_k)
            .await?;
        if ids.is_empty() {
            return Err(PipelineError::RetrievalEmpty);
        }

        let chunks = self.fetch(ids).await?;
        if chunks.is_empty() {
            return Err(PipelineError::RetrievalEmpty);
        }

        tracing::info!(
            candidates = chunks.len(),
            keyword = chunks.iter().filter(|c| c.provenance != Provenance::Semantic).count(),
            semantic = chunks.iter().filter(|c| c.provenance != Provenance::Keyword).count(),
            "retrieval merged"
        );
        Ok(chunks)
    }

    /// Supplemental retrieval scoped to material ending after `after_year`.
    /// An empty result is not an error here.
    pub async fn retrieve_after(&self, query: &Query, after_year: i32) -> PipelineResult<Vec<Chunk>> {
        let scoped_text = format!("{} after {after_year}", query.raw_text);
        let ids = match self
            .candidate_ids(&query.subject_terms, &scoped_text, self.similarity_k * 2)
            .await
        {
            Ok(ids) => ids,
            Err(PipelineError::RetrievalEmpty) => return Ok(vec![]),
            Err(err) => return Err(err),
        };

        let chunks: Vec<Chunk> = self
            .fetch(ids)
            .await?
            .into_iter()
            .filter(|chunk| chunk.year_span.is_some_and(|span| span.end > after_year))
            .collect();

        tracing::info!(after_year, found = chunks.len(), "supplemental retrieval");
        Ok(chunks)
    }

    async fn candidate_ids(
        &self,
        terms: &[String],
        query_text: &str,
        k: usize,
    ) -> PipelineResult<Vec<(String, Provenance)>> {
        let keyword_fut = async {
            let mut hits = Vec::new();
            let mut failures = 0usize;
            let mut last_err = None;
            for term in terms {
                match self.store.lookup_by_term(term).await {
                    Ok(ids) => hits.extend(ids),
                    Err(err) => {
                        tracing::warn!(term = %term, error = %err, "keyword lookup failed");
                        failures += 1;
                        last_err = Some(err);
                    }
                }
            }
            match last_err {
                Some(err) if failures == terms.len() => Err(err),
                _ => Ok(hits),
            }
        };
        let semantic_fut = self.store.similarity_search(query_text, k);

        let (keyword, semantic) = tokio::join!(keyword_fut, semantic_fut);

        let (keyword, semantic) = match (keyword, semantic) {
            (Ok(keyword), Ok(semantic)) => (keyword, semantic),
            (Ok(keyword), Err(err)) => {
                tracing::warn!(error = %err, "similarity search failed; keyword hits only");
                if keyword.is_empty() {
                    return Err(PipelineError::Store(err));
                }
                (keyword, vec![])
            }
            (Err(err), Ok(semantic)) => {
                tracing::warn!(error = %err, "keyword lookup failed; similarity hits only");
                if semantic.is_empty() {
                    return Err(PipelineError::Store(err));
                }
                (vec![], semantic)
            }
            (Err(keyword_err), Err(semantic_err)) => {
                tracing::error!(error = %semantic_err, "similarity search failed");
                return Err(PipelineError::Store(keyword_err));
            }
        };

        let mut order: Vec<(String, Provenance)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let tagged = keyword
            .into_iter()
            .map(|id| (id, Provenance::Keyword))
            .chain(semantic.into_iter().map(|id| (id, Provenance::Semantic)));
        for (id, provenance) in tagged {
            match index.get(&id) {
                Some(&at) => order[at].1 = order[at].1.merge(provenance),
                None => {
                    index.insert(id.clone(), order.len());
                    order.push((id, provenance));
                }
            }
        }

        if order.is_empty() {
            return Err(PipelineError::RetrievalEmpty);
        }
        Ok(order)
    }

    async fn fetch(&self, ids: Vec<(String, Provenance)>) -> PipelineResult<Vec<Chunk>> {
        let mut chunks = Vec::with_capacity(ids.len());
        for (id, provenance) in ids {
            match self.store.get_chunk(&id).await.map_err(PipelineError::Store)? {
                Some(stored) => chunks.push(Chunk::from_stored(id, stored, provenance)),
                None => tracing::warn!(chunk_id = %id, "index hit has no stored chunk"),
            }
        }
        Ok(chunks)
    }
}
