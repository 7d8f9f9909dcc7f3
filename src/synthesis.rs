use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::error::{GatewayError, PipelineError, PipelineResult};
use crate::gateway::CallGateway;
use crate::models::{
    Batch, NarrativeDraft, NarrativeParagraph, Query, SkipReason, SkippedBatch, YearSpan,
};
use crate::text::{
    contains_words, estimate_tokens, normalize_words, sanitize_model_output, split_sentences,
    word_count, year_span_of,
};

static EVIDENCE_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[\s*e\s*(\d+)\s*\]").expect("valid evidence tag regex"));

static BLANK_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n").expect("valid blank line regex"));

static LIST_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*\u{2022}]|\d{1,2}[.)])\s+").expect("valid list marker regex")
});

static SPACE_BEFORE_PUNCT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+([.,;:!?])").expect("valid punctuation regex"));

/// Sentences shorter than this are never treated as seam duplicates.
const SEAM_MIN_WORDS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairDirective {
    StricterParagraphs,
    Reorder,
}

#[derive(Debug, Clone)]
pub enum BatchOutcome {
    Written(Vec<NarrativeParagraph>),
    Skipped(SkippedBatch),
}

#[derive(Debug, Clone, Default)]
pub struct Partials {
    by_batch: BTreeMap<usize, Vec<NarrativeParagraph>>,
}

impl Partials {
    pub fn insert(&mut self, batch_index: usize, paragraphs: Vec<NarrativeParagraph>) {
        self.by_batch.insert(batch_index, paragraphs);
    }

    pub fn len(&self) -> usize {
        self.by_batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_batch.is_empty()
    }

    pub fn stitch(&self) -> NarrativeDraft {
        stitch(self.by_batch.values().cloned())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SynthesisOutcome {
    pub partials: Partials,
    pub skipped: Vec<SkippedBatch>,
}

#[derive(Clone)]
pub struct NarrativeSynthesizer {
    gateway: Arc<CallGateway>,
    max_sentences_per_paragraph: usize,
}

impl NarrativeSynthesizer {
    pub fn new(gateway: Arc<CallGateway>, max_sentences_per_paragraph: usize) -> Self {
        Self {
            gateway,
            max_sentences_per_paragraph: max_sentences_per_paragraph.max(1),
        }
    }

    /// Generates every batch in order; one call at a time so partials stay chronological.
    pub async fn synthesize(&self, query: &Query, batches: &[Batch]) -> PipelineResult<SynthesisOutcome> {
        let mut outcome = SynthesisOutcome::default();
        let total = batches.len();
        for batch in batches {
            match self.synthesize_batch(query, batch, total, None).await? {
                BatchOutcome::Written(paragraphs) => outcome.partials.insert(batch.index, paragraphs),
                BatchOutcome::Skipped(skipped) => outcome.skipped.push(skipped),
            }
        }
        Ok(outcome)
    }

    /// One generation call. Only the daily budget escapes as an error; every
    /// other failure becomes a skipped batch.
    pub async fn synthesize_batch(
        &self,
        query: &Query,
        batch: &Batch,
        total_parts: usize,
        directive: Option<RepairDirective>,
    ) -> PipelineResult<BatchOutcome> {
        let prompt = self.build_prompt(query, batch, total_parts, directive);
        let estimated = estimate_tokens(&prompt);

        let skip = |reason: SkipReason| {
            BatchOutcome::Skipped(SkippedBatch {
                batch_index: batch.index,
                chunk_ids: batch.chunk_ids(),
                years: batch
                    .spans
                    .iter()
                    .fold(None, |acc, span| YearSpan::union_opt(acc, span.year_span)),
                reason,
            })
        };

        let response = match self.gateway.dispatch(&prompt, estimated).await {
            Ok(response) => response,
            Err(GatewayError::RateLimitedDaily) => return Err(PipelineError::RateLimitedDaily),
            Err(GatewayError::Transient(message)) => {
                tracing::warn!(batch = batch.index, error = %message, "batch skipped after retries");
                return Ok(skip(SkipReason::Transient));
            }
            Err(GatewayError::InvalidRequest(message)) => {
                tracing::warn!(batch = batch.index, error = %message, "batch rejected by service");
                return Ok(skip(SkipReason::InvalidRequest));
            }
        };

        let paragraphs = parse_partial(&response, batch);
        if paragraphs.is_empty() {
            tracing::warn!(batch = batch.index, "response had no usable paragraphs");
            return Ok(skip(SkipReason::MalformedPartial));
        }

        tracing::debug!(batch = batch.index, paragraphs = paragraphs.len(), "batch synthesized");
        Ok(BatchOutcome::Written(paragraphs))
    }

    fn build_prompt(
        &self,
        query: &Query,
        batch: &Batch,
        total_parts: usize,
        directive: Option<RepairDirective>,
    ) -> String {
        let max = self.max_sentences_per_paragraph;
        let part = batch.index + 1;
        let total = total_parts.max(part);

        let position = if part == 1 {
            "Open with the earliest events in this evidence.".to_string()
        } else {
            "Earlier parts already covered older events; continue the story without re-introducing the subject."
                .to_string()
        };

        let repair = match directive {
            None => String::new(),
            Some(RepairDirective::StricterParagraphs) => format!(
                "\nYour previous draft of this part had paragraphs longer than {max} sentences. \
                 Rewrite it so that no paragraph has more than {max} sentences.\n"
            ),
            Some(RepairDirective::Reorder) => "\nYour previous draft of this part moved backwards in time. \
                 Rewrite it so that events appear strictly in chronological order.\n"
                .to_string(),
        };

        let mut evidence = String::new();
        for (idx, span) in batch.spans.iter().enumerate() {
            let years = span
                .year_span
                .map(|y| format!("{}-{}", y.start, y.end))
                .unwrap_or_else(|| "-".to_string());
            evidence.push_str(&format!(
                "[E{}] source={} paragraphs={}-{} years={}\n{}\n\n",
                idx + 1,
                span.source_document,
                span.paragraph_range.start,
                span.paragraph_range.end,
                years,
                span.text.trim()
            ));
        }

        format!(
            "You are writing part {part} of {total} of a chronological historical narrative.\n\
             Rules: Use only the evidence below. Do not invent people, dates, places or events. \
             Organize the text strictly chronologically, earliest first. \
             Write paragraphs of at most {max} sentences, separated by a blank line. \
             Use active voice with the historical actors as grammatical subjects. \
             End each paragraph with the evidence tags it draws on, like [E1] [E3]. \
             Plain prose only: no headings, no lists, no code fences.\n\
             {position}\n{repair}\n\
             Question:\n{question}\n\nEvidence:\n{evidence}",
            question = query.raw_text.trim(),
        )
    }

    /// Best-effort follow-up questions; any failure yields an empty list.
    pub async fn related_questions(&self, query: &Query, draft: &NarrativeDraft, count: usize) -> Vec<String> {
        if count == 0 || draft.is_empty() {
            return vec![];
        }

        let outline: String = draft
            .paragraphs
            .iter()
            .map(|p| p.text.split_whitespace().take(40).collect::<Vec<_>>().join(" "))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "A reader asked: {question}\nThey received a narrative beginning:\n{outline}\n\n\
             Suggest {count} short follow-up questions about the same history, one per line, \
             each ending with a question mark. No numbering, no commentary.",
            question = query.raw_text.trim(),
        );

        match self.gateway.dispatch(&prompt, estimate_tokens(&prompt)).await {
            Ok(response) => parse_questions(&response, count),
            Err(err) => {
                tracing::warn!(error = %err, "related questions unavailable");
                vec![]
            }
        }
    }
}

pub fn parse_partial(response: &str, batch: &Batch) -> Vec<NarrativeParagraph> {
    let cleaned = sanitize_model_output(response).replace("\r\n", "\n");
    let batch_ids = batch.chunk_ids();

    let mut paragraphs = Vec::new();
    for block in BLANK_LINE_RE.split(&cleaned) {
        let lines: Vec<String> = block
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with("```"))
            .map(|line| LIST_MARKER_RE.replace(line, "").into_owned())
            .collect();
        if lines.is_empty() {
            continue;
        }
        let joined = lines.join(" ");

        let mut cited: BTreeSet<String> = BTreeSet::new();
        for caps in EVIDENCE_TAG_RE.captures_iter(&joined) {
            let Some(n) = caps.get(1).and_then(|m| m.as_str().parse::<usize>().ok()) else {
                continue;
            };
            if let Some(span) = n.checked_sub(1).and_then(|i| batch.spans.get(i)) {
                cited.extend(span.contributors.iter().cloned());
            }
        }

        let text = strip_tags(&joined);
        if word_count(&text) == 0 {
            continue;
        }

        paragraphs.push(NarrativeParagraph {
            years: year_span_of(&text),
            text,
            batch_indices: vec![batch.index],
            chunk_ids: if cited.is_empty() {
                batch_ids.clone()
            } else {
                cited.into_iter().collect()
            },
        });
    }
    paragraphs
}

fn strip_tags(text: &str) -> String {
    let without = EVIDENCE_TAG_RE.replace_all(text, " ");
    let collapsed = without.split_whitespace().collect::<Vec<_>>().join(" ");
    SPACE_BEFORE_PUNCT_RE.replace_all(&collapsed, "$1").into_owned()
}

fn parse_questions(response: &str, count: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for line in sanitize_model_output(response).lines() {
        let question = LIST_MARKER_RE.replace(line.trim(), "").trim().to_string();
        if question.ends_with('?') && !out.contains(&question) {
            out.push(question);
        }
        if out.len() == count {
            break;
        }
    }
    out
}

/// Concatenates partials in order. At each seam, leading sentences of the
/// incoming paragraph that the previous paragraph already contains are dropped.
pub fn stitch(partials: impl IntoIterator<Item = Vec<NarrativeParagraph>>) -> NarrativeDraft {
    let mut out: Vec<NarrativeParagraph> = Vec::new();

    for partial in partials {
        let mut at_seam = !out.is_empty();
        for paragraph in partial {
            if !at_seam {
                out.push(paragraph);
                continue;
            }
            let Some(previous) = out.last_mut() else {
                out.push(paragraph);
                at_seam = false;
                continue;
            };

            match trim_seam(&previous.text, &paragraph.text) {
                Some(rest) if rest == paragraph.text => {
                    out.push(paragraph);
                    at_seam = false;
                }
                Some(rest) => {
                    out.push(NarrativeParagraph {
                        years: year_span_of(&rest),
                        text: rest,
                        ..paragraph
                    });
                    at_seam = false;
                }
                // Entirely repeated: keep the attribution, drop the prose.
                None => {
                    for index in paragraph.batch_indices {
                        if !previous.batch_indices.contains(&index) {
                            previous.batch_indices.push(index);
                        }
                    }
                    for id in paragraph.chunk_ids {
                        if !previous.chunk_ids.contains(&id) {
                            previous.chunk_ids.push(id);
                        }
                    }
                }
            }
        }
    }

    NarrativeDraft { paragraphs: out }
}

/// What remains of `incoming` after dropping leading sentences `previous`
/// already contains; `None` when nothing remains.
fn trim_seam(previous: &str, incoming: &str) -> Option<String> {
    let previous_words = normalize_words(previous);
    let sentences = split_sentences(incoming);

    let duplicated = sentences
        .iter()
        .take_while(|sentence| {
            let words = normalize_words(sentence);
            words.len() >= SEAM_MIN_WORDS && contains_words(&previous_words, &words)
        })
        .count();

    if duplicated == 0 {
        return Some(incoming.to_string());
    }
    if duplicated == sentences.len() {
        return None;
    }
    Some(sentences[duplicated..].join(" "))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::GenerationError;
    use crate::gateway::{RateBudget, RateLimits, RetryPolicy};
    use crate::models::{Chunk, EvidenceSpan, ParagraphRange, Provenance, QueryType};
    use crate::testing::ScriptedGenerator;

    fn batch(index: usize, ids: &[&str]) -> Batch {
        let spans: Vec<EvidenceSpan> = ids
            .iter()
            .map(|id| {
                EvidenceSpan::from(Chunk {
                    id: id.to_string(),
                    text: format!("evidence {id}"),
                    source_document: "a.pdf".to_string(),
                    paragraph_range: ParagraphRange::new(1, 1),
                    year_span: None,
                    provenance: Provenance::Keyword,
                })
            })
            .collect();
        Batch {
            index,
            spans,
            estimated_tokens: 10,
        }
    }

    fn query() -> Query {
        Query {
            raw_text: "How did the Rothschild bank grow?".to_string(),
            query_type: QueryType::EntitySpecific,
            subject_terms: vec!["rothschild".to_string()],
        }
    }

    fn synthesizer(generator: Arc<ScriptedGenerator>) -> NarrativeSynthesizer {
        let gateway = CallGateway::new(
            generator,
            Arc::new(RateBudget::new(RateLimits::new(100, 1_000_000, 100))),
            RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(20)),
            1,
            100,
        );
        NarrativeSynthesizer::new(Arc::new(gateway), 3)
    }

    fn paragraph(batch_index: usize, text: &str) -> NarrativeParagraph {
        NarrativeParagraph {
            text: text.to_string(),
            batch_indices: vec![batch_index],
            chunk_ids: vec![format!("b{batch_index}")],
            years: year_span_of(text),
        }
    }

    #[test]
    fn parse_attributes_tags_and_strips_markup() {
        let response = "```markdown\n## Early years\n\nNathan reached Manchester in 1798 [E1].\n\n\
                        - The London house financed Wellington in 1815 [E2] [e1].\n```";
        let paragraphs = parse_partial(response, &batch(0, &["c1", "c2"]));

        assert_eq!(paragraphs.len(), 2);
        assert_eq!(paragraphs[0].text, "Nathan reached Manchester in 1798.");
        assert_eq!(paragraphs[0].chunk_ids, vec!["c1"]);
        assert_eq!(paragraphs[1].text, "The London house financed Wellington in 1815.");
        assert_eq!(paragraphs[1].chunk_ids, vec!["c1", "c2"]);
        assert_eq!(paragraphs[1].years, Some(YearSpan::new(1815, 1815)));
    }

    #[test]
    fn untagged_paragraphs_fall_back_to_whole_batch() {
        let paragraphs = parse_partial("The firm grew. [E9]", &batch(2, &["c1", "c2"]));
        assert_eq!(paragraphs[0].chunk_ids, vec!["c1", "c2"]);
        assert_eq!(paragraphs[0].batch_indices, vec![2]);
    }

    #[test]
    fn seam_drops_repeated_leading_sentence() {
        let draft = stitch(vec![
            vec![paragraph(0, "The bank opened in 1798. It financed the war in 1815.")],
            vec![
                paragraph(1, "It financed the war in 1815. The founder died in 1836."),
                paragraph(1, "The sons took over in 1837."),
            ],
        ]);

        let texts: Vec<&str> = draft.paragraphs.iter().map(|p| p.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "The bank opened in 1798. It financed the war in 1815.",
                "The founder died in 1836.",
                "The sons took over in 1837.",
            ]
        );
        assert_eq!(draft.paragraphs[1].years, Some(YearSpan::new(1836, 1836)));
    }

    #[test]
    fn fully_repeated_seam_paragraph_folds_into_previous() {
        let draft = stitch(vec![
            vec![paragraph(0, "The bank opened in 1798.")],
            vec![paragraph(1, "The bank opened in 1798."), paragraph(1, "It grew fast after 1815.")],
        ]);

        assert_eq!(draft.paragraphs.len(), 2);
        assert_eq!(draft.paragraphs[0].batch_indices, vec![0, 1]);
        assert_eq!(draft.paragraphs[1].text, "It grew fast after 1815.");
    }

    #[test]
    fn short_sentences_are_not_treated_as_duplicates() {
        let draft = stitch(vec![
            vec![paragraph(0, "He died. The estate passed to his sons.")],
            vec![paragraph(1, "He died. His brother was next in 1840.")],
        ]);
        assert_eq!(draft.paragraphs[1].text, "He died. His brother was next in 1840.");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_is_skipped_and_the_rest_survive() {
        let generator = Arc::new(ScriptedGenerator::with_handler(|prompt| {
            if prompt.contains("part 2 of 3") {
                Err(GenerationError::Transient("upstream 503".to_string()))
            } else {
                Ok("The firm grew in 1820. [E1]".to_string())
            }
        }));
        let batches = vec![batch(0, &["a"]), batch(1, &["b"]), batch(2, &["c"])];

        let outcome = synthesizer(generator.clone())
            .synthesize(&query(), &batches)
            .await
            .unwrap();

        assert_eq!(outcome.partials.len(), 2);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].batch_index, 1);
        assert_eq!(outcome.skipped[0].chunk_ids, vec!["b"]);
        assert_eq!(outcome.skipped[0].reason, SkipReason::Transient);
        assert_eq!(generator.call_count(), 4);
    }

    #[tokio::test]
    async fn unparseable_response_is_a_malformed_partial() {
        let generator = Arc::new(ScriptedGenerator::always("```\n# Heading only\n```"));
        let outcome = synthesizer(generator)
            .synthesize(&query(), &[batch(0, &["a"])])
            .await
            .unwrap();

        assert!(outcome.partials.is_empty());
        assert_eq!(outcome.skipped[0].reason, SkipReason::MalformedPartial);
    }

    #[tokio::test]
    async fn daily_budget_aborts_synthesis() {
        let generator = Arc::new(ScriptedGenerator::failing(GenerationError::QuotaExceeded));
        let err = synthesizer(generator)
            .synthesize(&query(), &[batch(0, &["a"]), batch(1, &["b"])])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::RateLimitedDaily));
    }

    #[tokio::test]
    async fn prompt_carries_directives_and_tags() {
        let generator = Arc::new(ScriptedGenerator::always("Text in 1800. [E1]"));
        synthesizer(generator.clone())
            .synthesize_batch(&query(), &batch(0, &["a"]), 1, Some(RepairDirective::StricterParagraphs))
            .await
            .unwrap();

        let prompt = &generator.prompts()[0];
        assert!(prompt.contains("[E1] source=a.pdf"));
        assert!(prompt.contains("at most 3 sentences"));
        assert!(prompt.contains("longer than 3 sentences"));
        assert!(prompt.contains("part 1 of 1"));
    }

    #[tokio::test]
    async fn related_questions_are_parsed_and_bounded() {
        let generator = Arc::new(ScriptedGenerator::always(
            "1. Who ran the Vienna house?\n- What happened in 1848?\nNot a question\nWhy did Naples close?",
        ));
        let draft = NarrativeDraft {
            paragraphs: vec![paragraph(0, "The bank opened in 1798.")],
        };

        let questions = synthesizer(generator).related_questions(&query(), &draft, 2).await;
        assert_eq!(
            questions,
            vec!["Who ran the Vienna house?", "What happened in 1848?"]
        );
    }
}
