use std::collections::BTreeSet;

use crate::batcher::TokenBatcher;
use crate::coverage::CoverageAnalyzer;
use crate::error::PipelineResult;
use crate::models::{
    Batch, CorrectiveAction, EvidenceSet, NarrativeDraft, Query, ReviewCheck, ReviewVerdict,
    SkippedBatch,
};
use crate::synthesis::{BatchOutcome, NarrativeSynthesizer, Partials, RepairDirective};
use crate::text::{extract_years, split_sentences};

const MAX_REORDER_ATTEMPTS: usize = 1;
const MAX_RERETRIEVALS: usize = 1;

#[derive(Debug, Clone, Copy)]
pub struct ReviewPolicy {
    pub max_iterations: usize,
    pub max_sentences_per_paragraph: usize,
    pub chronology_tolerance_years: i32,
    pub gap_threshold_years: i32,
}

#[derive(Debug, Clone)]
pub struct ReviewState {
    pub evidence: EvidenceSet,
    pub batches: Vec<Batch>,
    pub partials: Partials,
    pub skipped: Vec<SkippedBatch>,
}

#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub state: ReviewState,
    pub draft: NarrativeDraft,
    pub degraded: bool,
    pub iterations_used: usize,
    pub failed_checks: Vec<ReviewCheck>,
    pub verdicts: Vec<ReviewVerdict>,
}

pub fn check_paragraph_length(draft: &NarrativeDraft, max_sentences: usize) -> ReviewVerdict {
    let mut offending = BTreeSet::new();
    for paragraph in &draft.paragraphs {
        if split_sentences(&paragraph.text).len() > max_sentences {
            offending.extend(paragraph.batch_indices.iter().copied());
        }
    }
    verdict(ReviewCheck::ParagraphLength, CorrectiveAction::RePrompt, offending)
}

/// Paragraphs are keyed by the first year they mention; a key may fall behind
/// the latest key seen so far by at most `tolerance` years.
pub fn check_chronology(draft: &NarrativeDraft, tolerance: i32) -> ReviewVerdict {
    let mut offending = BTreeSet::new();
    let mut high_water: Option<i32> = None;
    for paragraph in &draft.paragraphs {
        let Some(&year) = extract_years(&paragraph.text).first() else {
            continue;
        };
        match high_water {
            Some(max) if year < max - tolerance => {
                offending.extend(paragraph.batch_indices.iter().copied());
            }
            Some(max) if year <= max => {}
            _ => high_water = Some(year),
        }
    }
    verdict(ReviewCheck::Chronology, CorrectiveAction::RePrompt, offending)
}

/// The narrative must reach within `gap_threshold` years of the evidence's
/// latest year. A narrative without any year is not judged.
pub fn check_coverage(
    draft: &NarrativeDraft,
    evidence: &EvidenceSet,
    gap_threshold: i32,
) -> ReviewVerdict {
    let failing = match (evidence.latest_year(), draft.latest_year()) {
        (Some(evidence_latest), Some(narrative_latest)) => {
            evidence_latest - narrative_latest > gap_threshold
        }
        _ => false,
    };
    ReviewVerdict {
        check: ReviewCheck::Coverage,
        passed: !failing,
        corrective_action: if failing {
            CorrectiveAction::ReRetrieve
        } else {
            CorrectiveAction::None
        },
        batches: vec![],
    }
}

fn verdict(check: ReviewCheck, action: CorrectiveAction, offending: BTreeSet<usize>) -> ReviewVerdict {
    let passed = offending.is_empty();
    ReviewVerdict {
        check,
        passed,
        corrective_action: if passed { CorrectiveAction::None } else { action },
        batches: offending.into_iter().collect(),
    }
}

#[derive(Clone)]
pub struct AnswerReviewer {
    synthesizer: NarrativeSynthesizer,
    batcher: TokenBatcher,
    coverage: CoverageAnalyzer,
    policy: ReviewPolicy,
}

impl AnswerReviewer {
    pub fn new(
        synthesizer: NarrativeSynthesizer,
        batcher: TokenBatcher,
        coverage: CoverageAnalyzer,
        policy: ReviewPolicy,
    ) -> Self {
        Self {
            synthesizer,
            batcher,
            coverage,
            policy,
        }
    }

    pub async fn review(
        &self,
        query: &Query,
        mut state: ReviewState,
        max_iterations: Option<usize>,
    ) -> PipelineResult<ReviewOutcome> {
        let max_iterations = max_iterations.unwrap_or(self.policy.max_iterations).max(1);
        let mut reorders = 0usize;
        let mut reretrievals = 0usize;
        let mut iteration = 0usize;

        loop {
            let draft = state.partials.stitch();
            if draft.is_empty() {
                tracing::warn!("nothing to review; every batch was skipped");
                return Ok(ReviewOutcome {
                    state,
                    draft,
                    degraded: true,
                    iterations_used: iteration,
                    failed_checks: vec![],
                    verdicts: vec![],
                });
            }

            iteration += 1;
            let mut verdicts = vec![
                check_paragraph_length(&draft, self.policy.max_sentences_per_paragraph),
                check_chronology(&draft, self.policy.chronology_tolerance_years),
                check_coverage(&draft, &state.evidence, self.policy.gap_threshold_years),
            ];
            for verdict in verdicts.iter_mut().filter(|v| !v.passed) {
                let exhausted = match verdict.check {
                    ReviewCheck::Chronology => reorders >= MAX_REORDER_ATTEMPTS,
                    // Broad queries keep the capped evidence they were given.
                    ReviewCheck::Coverage => {
                        reretrievals >= MAX_RERETRIEVALS || query.query_type.is_pathologically_broad()
                    }
                    ReviewCheck::ParagraphLength => false,
                };
                if exhausted {
                    verdict.corrective_action = CorrectiveAction::GiveUp;
                }
            }

            let failed_checks: Vec<ReviewCheck> = verdicts
                .iter()
                .filter(|v| !v.passed)
                .map(|v| v.check)
                .collect();
            if failed_checks.is_empty() {
                tracing::info!(iteration, "narrative passed review");
                return Ok(ReviewOutcome {
                    state,
                    draft,
                    degraded: false,
                    iterations_used: iteration,
                    failed_checks,
                    verdicts,
                });
            }

            let next = verdicts
                .iter()
                .find(|v| !v.passed && v.corrective_action != CorrectiveAction::GiveUp)
                .cloned();
            let next = match next {
                Some(next) if iteration < max_iterations => next,
                _ => {
                    tracing::warn!(
                        iteration,
                        failed = ?failed_checks,
                        "review gave up; returning degraded narrative"
                    );
                    return Ok(ReviewOutcome {
                        state,
                        draft,
                        degraded: true,
                        iterations_used: iteration,
                        failed_checks,
                        verdicts,
                    });
                }
            };

            tracing::info!(
                iteration,
                check = next.check.as_str(),
                batches = ?next.batches,
                "review check failed; repairing"
            );
            match next.check {
                ReviewCheck::ParagraphLength => {
                    self.reprompt(query, &mut state, &next.batches, RepairDirective::StricterParagraphs)
                        .await?;
                }
                ReviewCheck::Chronology => {
                    reorders += 1;
                    self.reprompt(query, &mut state, &next.batches, RepairDirective::Reorder)
                        .await?;
                }
                ReviewCheck::Coverage => {
                    reretrievals += 1;
                    // `check_coverage` only fails when the draft has a year.
                    if let Some(after_year) = draft.latest_year() {
                        self.reretrieve(query, &mut state, after_year).await?;
                    }
                }
            }
        }
    }

    /// Regenerates `batch_indices` with `directive`. A failed regeneration
    /// keeps the earlier partial.
    async fn reprompt(
        &self,
        query: &Query,
        state: &mut ReviewState,
        batch_indices: &[usize],
        directive: RepairDirective,
    ) -> PipelineResult<()> {
        let total = state.batches.len();
        for &index in batch_indices {
            let Some(batch) = state.batches.iter().find(|b| b.index == index) else {
                continue;
            };
            match self
                .synthesizer
                .synthesize_batch(query, batch, total, Some(directive))
                .await?
            {
                BatchOutcome::Written(paragraphs) => state.partials.insert(index, paragraphs),
                BatchOutcome::Skipped(skipped) => {
                    tracing::warn!(batch = index, reason = ?skipped.reason, "repair attempt failed; keeping earlier text");
                }
            }
        }
        Ok(())
    }

    /// Pulls in evidence after `after_year` and narrates everything the draft
    /// has not reached yet as additional parts.
    async fn reretrieve(&self, query: &Query, state: &mut ReviewState, after_year: i32) -> PipelineResult<()> {
        let (spans, added) = self
            .coverage
            .augment_after(query, state.evidence.spans.clone(), after_year)
            .await?;
        state.evidence = EvidenceSet::new(spans);

        let uncovered: Vec<_> = state
            .evidence
            .spans
            .iter()
            .filter(|span| span.year_span.is_some_and(|years| years.end > after_year))
            .cloned()
            .collect();
        tracing::info!(after_year, added, uncovered = uncovered.len(), "re-retrieval for coverage");

        let first_index = state.batches.iter().map(|b| b.index + 1).max().unwrap_or(0);
        let extra = self.batcher.batch_spans(&uncovered, first_index);
        state.batches.extend(extra.iter().cloned());

        let total = state.batches.len();
        for batch in &extra {
            match self.synthesizer.synthesize_batch(query, batch, total, None).await? {
                BatchOutcome::Written(paragraphs) => state.partials.insert(batch.index, paragraphs),
                BatchOutcome::Skipped(skipped) => state.skipped.push(skipped),
            }
        }
        Ok(())
    }
}
