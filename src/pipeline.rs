use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::Instrument;
use uuid::Uuid;

use crate::batcher::TokenBatcher;
use crate::collapse::OverlapCollapser;
use crate::config::{AppConfig, PipelineConfig};
use crate::coverage::{CoverageAnalyzer, CoveragePolicy};
use crate::db::Database;
use crate::error::{PipelineError, PipelineResult};
use crate::gateway::{CallGateway, RateBudget};
use crate::models::{AnswerStatus, Diagnostics, Query, QueryAnswer, QueryOptions};
use crate::ollama::OllamaClient;
use crate::qdrant_store::QdrantStore;
use crate::retrieval::RetrievalMerger;
use crate::review::{AnswerReviewer, ReviewPolicy, ReviewState};
use crate::store::{ChunkStore, IndexedChunkStore};
use crate::synthesis::NarrativeSynthesizer;
use crate::tantivy_store::TantivyStore;

#[derive(Clone)]
pub struct NarrativeService {
    config: PipelineConfig,
    store: Arc<dyn ChunkStore>,
    gateway: Arc<CallGateway>,
    merger: RetrievalMerger,
    collapser: OverlapCollapser,
    coverage: CoverageAnalyzer,
    batcher: TokenBatcher,
    synthesizer: NarrativeSynthesizer,
    reviewer: AnswerReviewer,
}

impl NarrativeService {
    pub fn new(config: PipelineConfig, store: Arc<dyn ChunkStore>, gateway: Arc<CallGateway>) -> Self {
        let merger = RetrievalMerger::new(store.clone(), config.similarity_k);
        let collapser = OverlapCollapser::new(config.source_overlap_words, config.min_overlap_words);
        let coverage = CoverageAnalyzer::new(
            merger.clone(),
            collapser,
            CoveragePolicy {
                gap_threshold_years: config.gap_threshold_years,
                max_augmentation_rounds: config.max_augmentation_rounds,
                broad_evidence_cap: config.broad_evidence_cap,
            },
        );
        let batcher = TokenBatcher::new(config.max_tokens_per_batch);
        let synthesizer = NarrativeSynthesizer::new(gateway.clone(), config.max_sentences_per_paragraph);
        let reviewer = AnswerReviewer::new(
            synthesizer.clone(),
            batcher,
            coverage.clone(),
            ReviewPolicy {
                max_iterations: config.max_review_iterations,
                max_sentences_per_paragraph: config.max_sentences_per_paragraph,
                chronology_tolerance_years: config.chronology_tolerance_years,
                gap_threshold_years: config.gap_threshold_years,
            },
        );

        Self {
            config,
            store,
            gateway,
            merger,
            collapser,
            coverage,
            batcher,
            synthesizer,
            reviewer,
        }
    }

    pub async fn connect(config: &AppConfig) -> anyhow::Result<Self> {
        let db = Database::new(config).await?;
        let ollama = OllamaClient::new(
            config.ollama_base_url.clone(),
            config.models.answer_model.clone(),
        );
        let qdrant = QdrantStore::new(
            config.qdrant_base_url.clone(),
            config.qdrant_collection.clone(),
        );
        let tantivy = TantivyStore::new(config.tantivy_dir());
        if !tantivy.is_available() {
            tracing::warn!(dir = %config.tantivy_dir().display(), "no keyword index; falling back to SQL scans");
        }

        let store = IndexedChunkStore::new(
            db,
            tantivy,
            qdrant,
            ollama.clone(),
            config.models.embedding_model.clone(),
        );
        let gateway = CallGateway::new(
            Arc::new(ollama),
            Arc::new(RateBudget::new(config.rate_limits)),
            config.retry,
            config.max_concurrent_generations,
            config.pipeline.max_output_tokens,
        );

        Ok(Self::new(
            config.pipeline.clone(),
            Arc::new(store),
            Arc::new(gateway),
        ))
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<CallGateway> {
        &self.gateway
    }

    /// Runs the whole pipeline under the caller's timeout. Budget already
    /// spent by an aborted query stays spent.
    pub async fn answer_query(&self, text: &str, options: QueryOptions) -> PipelineResult<QueryAnswer> {
        let query_id = Uuid::new_v4().to_string();
        let timeout = options.timeout.unwrap_or(self.config.query_timeout);
        let span = tracing::info_span!("query", query_id = %query_id);

        async {
            match tokio::time::timeout(timeout, self.run(&query_id, text, &options)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(timeout_secs = timeout.as_secs(), "query timed out");
                    Err(PipelineError::TimedOut(timeout))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(&self, query_id: &str, text: &str, options: &QueryOptions) -> PipelineResult<QueryAnswer> {
        let started = Instant::now();

        // A query that cannot make a single call fails before any retrieval.
        self.gateway
            .budget()
            .ensure_daily_capacity()
            .await
            .map_err(|_| PipelineError::RateLimitedDaily)?;

        let query = Query::parse(text)?;
        tracing::info!(
            query_type = query.query_type.as_str(),
            terms = ?query.subject_terms,
            "query parsed"
        );

        let chunks = match self.merger.retrieve(&query).await {
            Ok(chunks) => chunks,
            Err(PipelineError::RetrievalEmpty) => {
                tracing::info!("no evidence found");
                return Ok(no_information(query_id, started));
            }
            Err(err) => return Err(err),
        };

        let raw_chunks = chunks.len();
        let spans = self.collapser.collapse(&chunks);
        tracing::info!(raw_chunks, spans = spans.len(), "evidence collapsed");

        let report = self.coverage.analyze(&query, spans).await?;
        let batches = self.batcher.batch(&report.evidence);
        tracing::info!(
            batches = batches.len(),
            evidence_spans = report.evidence.len(),
            augmentation_rounds = report.augmentation_rounds,
            "evidence batched"
        );

        let synthesis = self.synthesizer.synthesize(&query, &batches).await?;
        let review = self
            .reviewer
            .review(
                &query,
                ReviewState {
                    evidence: report.evidence,
                    batches,
                    partials: synthesis.partials,
                    skipped: synthesis.skipped,
                },
                options.max_review_iterations,
            )
            .await?;

        let related_count = options
            .related_questions
            .unwrap_or(self.config.related_questions);
        let related_questions = self
            .synthesizer
            .related_questions(&query, &review.draft, related_count)
            .await;

        let state = review.state;
        let degraded = review.degraded || !state.skipped.is_empty();
        let coverage_gap_years = report
            .corpus_latest_year
            .zip(state.evidence.latest_year())
            .map(|(corpus, evidence)| (corpus - evidence).max(0))
            .or(report.coverage_gap_years);

        let diagnostics = Diagnostics {
            batches_skipped: state.skipped,
            coverage_gap_years,
            review_iterations_used: review.iterations_used,
            augmentation_rounds: report.augmentation_rounds,
            raw_chunks,
            evidence_spans: state.evidence.len(),
            batches: state.batches.len(),
            failed_checks: review.failed_checks,
        };

        tracing::info!(
            degraded,
            paragraphs = review.draft.paragraphs.len(),
            skipped = diagnostics.batches_skipped.len(),
            iterations = diagnostics.review_iterations_used,
            latency_ms = started.elapsed().as_millis() as u64,
            "query answered"
        );

        Ok(QueryAnswer {
            query_id: query_id.to_string(),
            status: AnswerStatus::Answered,
            narrative: review.draft.render(),
            paragraphs: review.draft.paragraphs,
            related_questions,
            degraded,
            evidence_years: state.evidence.year_span,
            diagnostics,
            answered_at: Utc::now(),
            latency_ms: started.elapsed().as_millis(),
        })
    }
}

fn no_information(query_id: &str, started: Instant) -> QueryAnswer {
    QueryAnswer {
        query_id: query_id.to_string(),
        status: AnswerStatus::NoInformation,
        narrative: String::new(),
        paragraphs: vec![],
        related_questions: vec![],
        degraded: false,
        evidence_years: None,
        diagnostics: Diagnostics::default(),
        answered_at: Utc::now(),
        latency_ms: started.elapsed().as_millis(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::GenerationError;
    use crate::gateway::{RateBudget, RateLimits, RetryPolicy};
    use crate::models::SkipReason;
    use crate::testing::{MemoryChunkStore, ScriptedGenerator};

    fn corpus() -> MemoryChunkStore {
        MemoryChunkStore::new()
            .with_chunk(
                "c1",
                "rothschild.pdf",
                (4, 5),
                Some((1798, 1850)),
                "Nathan Rothschild reached Manchester in 1798 and the firm expanded to Paris in 1850.",
            )
            .with_chunk(
                "c2",
                "rothschild.pdf",
                (5, 6),
                Some((1850, 1870)),
                "to Paris in 1850. Operations of the Rothschild house in Paris continued until 1870",
            )
            .with_semantic("rothschild", &["c2"])
    }

    fn service(
        store: MemoryChunkStore,
        generator: Arc<ScriptedGenerator>,
        limits: RateLimits,
        config: PipelineConfig,
    ) -> NarrativeService {
        let gateway = Arc::new(CallGateway::new(
            generator,
            Arc::new(RateBudget::new(limits)),
            RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(20)),
            1,
            100,
        ));
        NarrativeService::new(config, Arc::new(store), gateway)
    }

    fn roomy() -> RateLimits {
        RateLimits::new(100, 1_000_000, 100)
    }

    fn narrator(prompt: &str) -> Result<String, GenerationError> {
        if prompt.contains("follow-up questions") {
            return Ok("Who led the Paris house after 1870?".to_string());
        }
        Ok("Nathan Rothschild reached Manchester in 1798. [E1]\n\n\
            The firm expanded to Paris in 1850 and operated there until 1870. [E1]"
            .to_string())
    }

    #[tokio::test]
    async fn answers_with_collapsed_evidence_and_related_questions() {
        let generator = Arc::new(ScriptedGenerator::with_handler(narrator));
        let answer = service(corpus(), generator.clone(), roomy(), PipelineConfig::default())
            .answer_query("What did the Rothschild family do in Paris?", QueryOptions::default())
            .await
            .unwrap();

        assert_eq!(answer.status, AnswerStatus::Answered);
        assert!(!answer.degraded);
        assert_eq!(answer.paragraphs.len(), 2);
        assert_eq!(answer.paragraphs[0].chunk_ids, vec!["c1", "c2"]);
        assert_eq!(answer.related_questions, vec!["Who led the Paris house after 1870?"]);
        assert_eq!(answer.diagnostics.raw_chunks, 2);
        assert_eq!(answer.diagnostics.evidence_spans, 1);
        assert_eq!(answer.diagnostics.batches, 1);
        assert_eq!(answer.diagnostics.review_iterations_used, 1);
        assert_eq!(generator.call_count(), 2);
    }

    #[tokio::test]
    async fn empty_retrieval_is_an_explicit_no_information_answer() {
        let generator = Arc::new(ScriptedGenerator::with_handler(narrator));
        let answer = service(corpus(), generator.clone(), roomy(), PipelineConfig::default())
            .answer_query("Who was Amschel Mayer?", QueryOptions::default())
            .await
            .unwrap();

        assert_eq!(answer.status, AnswerStatus::NoInformation);
        assert!(answer.narrative.is_empty());
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test]
    async fn exhausted_daily_budget_fails_before_any_call() {
        let generator = Arc::new(ScriptedGenerator::with_handler(narrator));
        let service = service(
            corpus(),
            generator.clone(),
            RateLimits::new(100, 1_000_000, 2),
            PipelineConfig::default(),
        );
        service.gateway().budget().acquire(10).await.unwrap();
        service.gateway().budget().acquire(10).await.unwrap();

        let err = service
            .answer_query("What did the Rothschild family do in Paris?", QueryOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::RateLimitedDaily));
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_is_reported_and_the_answer_still_returned() {
        let store = MemoryChunkStore::new()
            .with_chunk("a", "x.pdf", (1, 1), Some((1800, 1800)), "Baring opened a London office in 1800")
            .with_chunk("b", "x.pdf", (50, 50), Some((1805, 1805)), "Baring financed the Louisiana purchase in 1805");
        let generator = Arc::new(ScriptedGenerator::with_handler(|prompt| {
            if prompt.contains("Louisiana") {
                Err(GenerationError::Transient("upstream 503".to_string()))
            } else {
                Ok("Baring opened a London office in 1800. [E1]".to_string())
            }
        }));
        let config = PipelineConfig {
            max_tokens_per_batch: 30,
            related_questions: 0,
            ..PipelineConfig::default()
        };

        let answer = service(store, generator, roomy(), config)
            .answer_query("What did Baring do?", QueryOptions::default())
            .await
            .unwrap();

        assert_eq!(answer.narrative, "Baring opened a London office in 1800.");
        assert!(answer.degraded);
        assert_eq!(answer.diagnostics.batches_skipped.len(), 1);
        assert_eq!(answer.diagnostics.batches_skipped[0].chunk_ids, vec!["b"]);
        assert_eq!(answer.diagnostics.batches_skipped[0].reason, SkipReason::Transient);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_pipeline_times_out() {
        let generator = Arc::new(ScriptedGenerator::failing(GenerationError::RateLimited {
            retry_after: Some(Duration::from_secs(600)),
        }));
        let options = QueryOptions {
            timeout: Some(Duration::from_secs(30)),
            ..QueryOptions::default()
        };

        let err = service(corpus(), generator, roomy(), PipelineConfig::default())
            .answer_query("What did the Rothschild family do in Paris?", options)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::TimedOut(d) if d == Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn blank_question_is_rejected() {
        let generator = Arc::new(ScriptedGenerator::with_handler(narrator));
        let err = service(corpus(), generator, roomy(), PipelineConfig::default())
            .answer_query("   ", QueryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidQuery(_)));
    }
}
