use crate::models::{Batch, EvidenceSet, EvidenceSpan, SpanFragment};
use crate::text::{split_sentences, word_count};

/// Prompt overhead charged per span for its `[En]` tag and metadata line.
pub const SPAN_HEADER_TOKENS: usize = 12;

fn tokens_for_words(words: usize) -> usize {
    (words * 4).div_ceil(3)
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBatcher {
    max_tokens_per_batch: usize,
}

impl TokenBatcher {
    pub fn new(max_tokens_per_batch: usize) -> Self {
        Self {
            max_tokens_per_batch: max_tokens_per_batch.max(SPAN_HEADER_TOKENS + 8),
        }
    }

    pub fn max_tokens_per_batch(&self) -> usize {
        self.max_tokens_per_batch
    }

    pub fn batch(&self, evidence: &EvidenceSet) -> Vec<Batch> {
        self.batch_spans(&evidence.spans, 0)
    }

    /// Batches numbered from `first_index`, so appended batches keep unique indices.
    pub fn batch_spans(&self, spans: &[EvidenceSpan], first_index: usize) -> Vec<Batch> {
        let mut batches = Vec::new();
        let mut current: Vec<EvidenceSpan> = Vec::new();
        let mut current_tokens = 0usize;

        for span in chronological(spans) {
            for piece in self.fit(span) {
                let cost = span_cost(&piece);
                if !current.is_empty() && current_tokens + cost > self.max_tokens_per_batch {
                    batches.push(Batch {
                        index: first_index + batches.len(),
                        spans: std::mem::take(&mut current),
                        estimated_tokens: current_tokens,
                    });
                    current_tokens = 0;
                }
                current_tokens += cost;
                current.push(piece);
            }
        }

        if !current.is_empty() {
            batches.push(Batch {
                index: first_index + batches.len(),
                spans: current,
                estimated_tokens: current_tokens,
            });
        }

        tracing::debug!(
            batches = batches.len(),
            ceiling = self.max_tokens_per_batch,
            "evidence batched"
        );
        batches
    }

    /// The span itself when it fits one batch, otherwise sentence-aligned pieces.
    fn fit(&self, span: EvidenceSpan) -> Vec<EvidenceSpan> {
        if span_cost(&span) <= self.max_tokens_per_batch {
            return vec![span];
        }

        let max_words = (self.max_tokens_per_batch - SPAN_HEADER_TOKENS) * 3 / 4;
        let mut pieces: Vec<String> = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut current_words = 0usize;

        for sentence in split_sentences(&span.text) {
            let words = word_count(&sentence);
            if current_words + words > max_words && !current.is_empty() {
                pieces.push(current.join(" "));
                current.clear();
                current_words = 0;
            }
            if words > max_words {
                // A single sentence longer than a batch falls back to word boundaries.
                let split: Vec<&str> = sentence.split_whitespace().collect();
                for part in split.chunks(max_words) {
                    pieces.push(part.join(" "));
                }
                continue;
            }
            current_words += words;
            current.push(sentence);
        }
        if !current.is_empty() {
            pieces.push(current.join(" "));
        }

        let count = pieces.len();
        tracing::debug!(span_id = %span.id, pieces = count, "oversized span split");
        pieces
            .into_iter()
            .enumerate()
            .map(|(index, text)| EvidenceSpan {
                text,
                fragment: Some(SpanFragment { index, count }),
                ..span.clone()
            })
            .collect()
    }
}

pub fn span_cost(span: &EvidenceSpan) -> usize {
    tokens_for_words(word_count(&span.text)) + SPAN_HEADER_TOKENS
}

/// Stable chronological order; undated spans keep their place behind the
/// span retrieved before them.
fn chronological(spans: &[EvidenceSpan]) -> Vec<EvidenceSpan> {
    let mut last_key = i32::MIN;
    let mut keyed: Vec<(i32, usize, &EvidenceSpan)> = spans
        .iter()
        .enumerate()
        .map(|(position, span)| {
            if let Some(years) = span.year_span {
                last_key = years.start;
            }
            (last_key, position, span)
        })
        .collect();
    keyed.sort_by_key(|(key, position, _)| (*key, *position));
    keyed.into_iter().map(|(_, _, span)| span.clone()).collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::models::{Chunk, ParagraphRange, Provenance, YearSpan};

    fn span(id: &str, year: Option<i32>, text: &str) -> EvidenceSpan {
        EvidenceSpan::from(Chunk {
            id: id.to_string(),
            text: text.to_string(),
            source_document: "a.pdf".to_string(),
            paragraph_range: ParagraphRange::new(1, 1),
            year_span: year.map(|y| YearSpan::new(y, y)),
            provenance: Provenance::Keyword,
        })
    }

    fn reassemble(batches: &[Batch]) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = Vec::new();
        for span in batches.iter().flat_map(|batch| batch.spans.iter()) {
            match span.fragment {
                Some(fragment) if fragment.index > 0 => {
                    let last = out.last_mut().expect("fragment follows its head");
                    assert_eq!(last.0, span.id);
                    last.1.push(' ');
                    last.1.push_str(&span.text);
                }
                _ => out.push((span.id.clone(), span.text.clone())),
            }
        }
        out
    }

    fn normalized(text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn orders_chronologically_with_undated_spans_following_neighbours() {
        let spans = vec![
            span("c", Some(1900), "late text"),
            span("u", None, "undated text"),
            span("a", Some(1800), "early text"),
        ];
        let batches = TokenBatcher::new(1_000).batch(&EvidenceSet::new(spans));

        let ids: Vec<&str> = batches[0].spans.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "u"]);
    }

    #[test]
    fn closes_batch_before_exceeding_ceiling() {
        let text = vec!["word"; 30].join(" ");
        let spans: Vec<EvidenceSpan> = (0..5)
            .map(|i| span(&format!("s{i}"), Some(1800 + i), &text))
            .collect();
        // 30 words -> 40 tokens + 12 overhead = 52 per span.
        let batches = TokenBatcher::new(110).batch(&EvidenceSet::new(spans));

        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.estimated_tokens <= 110));
        assert_eq!(batches[0].estimated_tokens, 104);
        let indices: Vec<usize> = batches.iter().map(|b| b.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn oversized_span_splits_at_sentence_boundaries() {
        let text = "The bank opened in 1798 with a small counting house. \
                    It financed the allied armies in 1815 through bills. \
                    The founder died in 1836 and the sons took over.";
        let batches = TokenBatcher::new(30).batch(&EvidenceSet::new(vec![span("big", Some(1798), text)]));

        assert!(batches.len() > 1);
        let first = &batches[0].spans[0];
        assert_eq!(first.text, "The bank opened in 1798 with a small counting house.");
        assert_eq!(first.fragment, Some(SpanFragment { index: 0, count: 3 }));
        assert_eq!(reassemble(&batches), vec![("big".to_string(), normalized(text))]);
    }

    #[test]
    fn appended_batches_continue_numbering() {
        let batches = TokenBatcher::new(100).batch_spans(&[span("x", Some(1900), "late")], 4);
        assert_eq!(batches[0].index, 4);
    }

    fn arb_spans() -> impl Strategy<Value = Vec<EvidenceSpan>> {
        prop::collection::vec(
            (
                prop::option::of(1700i32..1950),
                prop::collection::vec(
                    prop::sample::select(vec!["bank", "war.", "loan", "Paris", "1815.", "the"]),
                    1..120,
                ),
            ),
            0..12,
        )
        .prop_map(|raw| {
            raw.into_iter()
                .enumerate()
                .map(|(idx, (year, words))| span(&format!("s{idx}"), year, &words.join(" ")))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn batches_respect_ceiling_and_reconstruct_evidence(
            spans in arb_spans(),
            ceiling in 24usize..300,
        ) {
            let batcher = TokenBatcher::new(ceiling);
            let batches = batcher.batch(&EvidenceSet::new(spans.clone()));

            for batch in &batches {
                prop_assert!(batch.estimated_tokens <= batcher.max_tokens_per_batch());
                let recomputed: usize = batch.spans.iter().map(span_cost).sum();
                prop_assert_eq!(recomputed, batch.estimated_tokens);
            }

            let expected: Vec<(String, String)> = chronological(&spans)
                .into_iter()
                .map(|span| (span.id, normalized(&span.text)))
                .collect();
            prop_assert_eq!(reassemble(&batches), expected);
        }
    }
}
