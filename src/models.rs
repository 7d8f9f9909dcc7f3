use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Keyword,
    Semantic,
    Both,
}

impl Provenance {
    /// Richer of the two tags: a chunk seen by both lookups is `Both`.
    pub fn merge(self, other: Provenance) -> Provenance {
        if self == other {
            self
        } else {
            Provenance::Both
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct YearSpan {
    pub start: i32,
    pub end: i32,
}

impl YearSpan {
    pub fn new(a: i32, b: i32) -> Self {
        Self {
            start: a.min(b),
            end: a.max(b),
        }
    }

    pub fn union(self, other: YearSpan) -> YearSpan {
        YearSpan {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn union_opt(a: Option<YearSpan>, b: Option<YearSpan>) -> Option<YearSpan> {
        match (a, b) {
            (Some(a), Some(b)) => Some(a.union(b)),
            (a, None) => a,
            (None, b) => b,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParagraphRange {
    pub start: u32,
    pub end: u32,
}

impl ParagraphRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            start: start.min(end),
            end: start.max(end),
        }
    }

    pub fn union(self, other: ParagraphRange) -> ParagraphRange {
        ParagraphRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn touches(self, other: ParagraphRange) -> bool {
        self.start <= other.end.saturating_add(1) && other.start <= self.end.saturating_add(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChunk {
    pub text: String,
    pub source_document: String,
    pub paragraph_range: ParagraphRange,
    pub year_span: Option<YearSpan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub source_document: String,
    pub paragraph_range: ParagraphRange,
    pub year_span: Option<YearSpan>,
    pub provenance: Provenance,
}

impl Chunk {
    pub fn from_stored(id: impl Into<String>, stored: StoredChunk, provenance: Provenance) -> Self {
        Self {
            id: id.into(),
            text: stored.text,
            source_document: stored.source_document,
            paragraph_range: stored.paragraph_range,
            year_span: stored.year_span,
            provenance,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    EntitySpecific,
    BroadIdentity,
    ControlInfluence,
    Other,
}

impl QueryType {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryType::EntitySpecific => "entity_specific",
            QueryType::BroadIdentity => "broad_identity",
            QueryType::ControlInfluence => "control_influence",
            QueryType::Other => "other",
        }
    }

    /// Query shapes that pull in far more evidence than a narrative can use.
    pub fn is_pathologically_broad(self) -> bool {
        matches!(self, QueryType::BroadIdentity | QueryType::ControlInfluence)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub raw_text: String,
    pub query_type: QueryType,
    pub subject_terms: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpanFragment {
    pub index: usize,
    pub count: usize,
}

/// One surviving span of the evidence set, with the raw chunk ids it subsumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidenceSpan {
    pub id: String,
    pub text: String,
    pub source_document: String,
    pub paragraph_range: ParagraphRange,
    pub year_span: Option<YearSpan>,
    pub provenance: Provenance,
    pub contributors: BTreeSet<String>,
    /// Set only on pieces of a span split to fit a batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment: Option<SpanFragment>,
}

impl From<Chunk> for EvidenceSpan {
    fn from(chunk: Chunk) -> Self {
        let mut contributors = BTreeSet::new();
        contributors.insert(chunk.id.clone());
        Self {
            id: chunk.id,
            text: chunk.text,
            source_document: chunk.source_document,
            paragraph_range: chunk.paragraph_range,
            year_span: chunk.year_span,
            provenance: chunk.provenance,
            contributors,
            fragment: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidenceSet {
    pub spans: Vec<EvidenceSpan>,
    pub year_span: Option<YearSpan>,
}

impl EvidenceSet {
    pub fn new(spans: Vec<EvidenceSpan>) -> Self {
        let year_span = spans
            .iter()
            .fold(None, |acc, span| YearSpan::union_opt(acc, span.year_span));
        Self { spans, year_span }
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn latest_year(&self) -> Option<i32> {
        self.year_span.map(|span| span.end)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub index: usize,
    pub spans: Vec<EvidenceSpan>,
    pub estimated_tokens: usize,
}

impl Batch {
    pub fn chunk_ids(&self) -> Vec<String> {
        let mut ids = BTreeSet::new();
        for span in &self.spans {
            ids.extend(span.contributors.iter().cloned());
        }
        ids.into_iter().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NarrativeParagraph {
    pub text: String,
    pub batch_indices: Vec<usize>,
    pub chunk_ids: Vec<String>,
    pub years: Option<YearSpan>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NarrativeDraft {
    pub paragraphs: Vec<NarrativeParagraph>,
}

impl NarrativeDraft {
    pub fn is_empty(&self) -> bool {
        self.paragraphs.is_empty()
    }

    pub fn latest_year(&self) -> Option<i32> {
        self.paragraphs
            .iter()
            .filter_map(|paragraph| paragraph.years.map(|years| years.end))
            .max()
    }

    pub fn render(&self) -> String {
        self.paragraphs
            .iter()
            .map(|paragraph| paragraph.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ReviewCheck {
    ParagraphLength,
    Chronology,
    Coverage,
}

impl ReviewCheck {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewCheck::ParagraphLength => "paragraph_length",
            ReviewCheck::Chronology => "chronology",
            ReviewCheck::Coverage => "coverage",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CorrectiveAction {
    None,
    RePrompt,
    ReRetrieve,
    GiveUp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewVerdict {
    pub check: ReviewCheck,
    pub passed: bool,
    pub corrective_action: CorrectiveAction,
    /// Batches whose paragraphs caused the failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub batches: Vec<usize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Transient,
    InvalidRequest,
    MalformedPartial,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedBatch {
    pub batch_index: usize,
    pub chunk_ids: Vec<String>,
    pub years: Option<YearSpan>,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    pub batches_skipped: Vec<SkippedBatch>,
    pub coverage_gap_years: Option<i32>,
    pub review_iterations_used: usize,
    pub augmentation_rounds: usize,
    pub raw_chunks: usize,
    pub evidence_spans: usize,
    pub batches: usize,
    pub failed_checks: Vec<ReviewCheck>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    Answered,
    NoInformation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnswer {
    pub query_id: String,
    pub status: AnswerStatus,
    pub narrative: String,
    pub paragraphs: Vec<NarrativeParagraph>,
    pub related_questions: Vec<String>,
    pub degraded: bool,
    pub evidence_years: Option<YearSpan>,
    pub diagnostics: Diagnostics,
    pub answered_at: DateTime<Utc>,
    pub latency_ms: u128,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Number of follow-up questions to request; `None` uses the configured default.
    #[serde(default)]
    pub related_questions: Option<usize>,
    #[serde(default)]
    pub max_review_iterations: Option<usize>,
    #[serde(default, with = "optional_secs")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub options: QueryOptions,
}

mod optional_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => s.serialize_some(&duration.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
