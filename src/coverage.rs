use std::collections::HashSet;

use crate::collapse::OverlapCollapser;
use crate::error::PipelineResult;
use crate::models::{EvidenceSet, EvidenceSpan, Query};
use crate::retrieval::RetrievalMerger;

#[derive(Debug, Clone, Copy)]
pub struct CoveragePolicy {
    pub gap_threshold_years: i32,
    pub max_augmentation_rounds: usize,
    pub broad_evidence_cap: usize,
}

#[derive(Debug, Clone)]
pub struct CoverageReport {
    pub evidence: EvidenceSet,
    pub augmentation_rounds: usize,
    pub corpus_latest_year: Option<i32>,
    /// Years the corpus runs past the evidence, when both are known.
    pub coverage_gap_years: Option<i32>,
    pub capped: bool,
}

#[derive(Clone)]
pub struct CoverageAnalyzer {
    merger: RetrievalMerger,
    collapser: OverlapCollapser,
    policy: CoveragePolicy,
}

impl CoverageAnalyzer {
    pub fn new(merger: RetrievalMerger, collapser: OverlapCollapser, policy: CoveragePolicy) -> Self {
        Self {
            merger,
            collapser,
            policy,
        }
    }

    pub async fn analyze(&self, query: &Query, spans: Vec<EvidenceSpan>) -> PipelineResult<CoverageReport> {
        if query.query_type.is_pathologically_broad() {
            let before = spans.len();
            let spans = cap_with_temporal_spread(spans, self.policy.broad_evidence_cap);
            let capped = spans.len() < before;
            if capped {
                tracing::info!(
                    query_type = query.query_type.as_str(),
                    before,
                    after = spans.len(),
                    "broad query evidence capped"
                );
            }
            return Ok(CoverageReport {
                evidence: EvidenceSet::new(spans),
                augmentation_rounds: 0,
                corpus_latest_year: None,
                coverage_gap_years: None,
                capped,
            });
        }

        let corpus_latest = match self
            .merger
            .store()
            .latest_year_for_terms(&query.anchor_terms())
            .await
        {
            Ok(year) => year,
            Err(err) => {
                tracing::warn!(error = %err, "latest-year metadata unavailable; skipping coverage check");
                None
            }
        };

        let mut spans = spans;
        let mut rounds = 0usize;
        while let Some(corpus_latest) = corpus_latest {
            if rounds >= self.policy.max_augmentation_rounds {
                break;
            }
            let evidence_latest = latest_year(&spans);
            let after_year = match evidence_latest {
                Some(latest) if corpus_latest - latest > self.policy.gap_threshold_years => latest,
                Some(_) => break,
                // Undated evidence says nothing about how far it reaches; fetch the
                // corpus's final stretch.
                None => corpus_latest - self.policy.gap_threshold_years,
            };

            rounds += 1;
            tracing::info!(
                round = rounds,
                corpus_latest,
                evidence_latest,
                after_year,
                "evidence stops early; augmenting"
            );
            let (augmented, added) = self.augment_after(query, spans, after_year).await?;
            spans = augmented;
            if added == 0 || latest_year(&spans) <= evidence_latest {
                break;
            }
        }

        let evidence = EvidenceSet::new(spans);
        let coverage_gap_years = gap_between(corpus_latest, evidence.latest_year()).map(|gap| gap.max(0));
        Ok(CoverageReport {
            evidence,
            augmentation_rounds: rounds,
            corpus_latest_year: corpus_latest,
            coverage_gap_years,
            capped: false,
        })
    }

    /// Retrieves material after `after_year` and folds it into `spans`.
    /// Returns the merged spans and how many raw chunks were new. A failing
    /// store leaves `spans` unchanged.
    pub async fn augment_after(
        &self,
        query: &Query,
        spans: Vec<EvidenceSpan>,
        after_year: i32,
    ) -> PipelineResult<(Vec<EvidenceSpan>, usize)> {
        let extra = match self.merger.retrieve_after(query, after_year).await {
            Ok(extra) => extra,
            Err(err) => {
                tracing::warn!(error = %err, after_year, "supplemental retrieval failed");
                return Ok((spans, 0));
            }
        };

        let known: HashSet<&String> = spans.iter().flat_map(|span| span.contributors.iter()).collect();
        let fresh: Vec<_> = extra
            .into_iter()
            .filter(|chunk| !known.contains(&chunk.id))
            .collect();
        if fresh.is_empty() {
            return Ok((spans, 0));
        }

        let added = fresh.len();
        Ok((self.collapser.absorb(spans, &fresh), added))
    }
}

fn latest_year(spans: &[EvidenceSpan]) -> Option<i32> {
    spans
        .iter()
        .filter_map(|span| span.year_span.map(|years| years.end))
        .max()
}

fn gap_between(corpus_latest: Option<i32>, evidence_latest: Option<i32>) -> Option<i32> {
    Some(corpus_latest? - evidence_latest?)
}

/// Keeps at most `cap` spans, sampled evenly across the timeline so a broad
/// answer still reaches from the earliest to the latest material.
pub fn cap_with_temporal_spread(spans: Vec<EvidenceSpan>, cap: usize) -> Vec<EvidenceSpan> {
    if spans.len() <= cap {
        return spans;
    }
    if cap == 0 {
        return vec![];
    }

    let mut timeline = spans;
    timeline.sort_by_key(|span| span.year_span.map(|years| years.start).unwrap_or(i32::MAX));

    let n = timeline.len();
    let picks: HashSet<usize> = (0..cap)
        .map(|i| ((n - 1) * i) / cap.saturating_sub(1).max(1))
        .collect();

    timeline
        .into_iter()
        .enumerate()
        .filter(|(idx, _)| picks.contains(idx))
        .map(|(_, span)| span)
        .collect()
}
