use std::collections::HashMap;

use crate::models::{Chunk, EvidenceSpan, YearSpan};
use crate::text::{boundary_overlap, contains_words, normalize_words};

#[derive(Debug, Clone)]
struct Entry {
    span: EvidenceSpan,
    words: Vec<String>,
}

impl Entry {
    fn new(span: EvidenceSpan) -> Self {
        let words = normalize_words(&span.text);
        Self { span, words }
    }

    /// Folds `other`'s bookkeeping into `self`; the text stays `self`'s.
    fn absorb(&mut self, other: Entry) {
        self.span.contributors.extend(other.span.contributors);
        self.span.provenance = self.span.provenance.merge(other.span.provenance);
        self.span.year_span = YearSpan::union_opt(self.span.year_span, other.span.year_span);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OverlapCollapser {
    window_words: usize,
    min_overlap_words: usize,
}

impl OverlapCollapser {
    pub fn new(window_words: usize, min_overlap_words: usize) -> Self {
        Self {
            window_words: window_words.max(1),
            min_overlap_words: min_overlap_words.max(1),
        }
    }

    pub fn collapse(&self, chunks: &[Chunk]) -> Vec<EvidenceSpan> {
        self.collapse_spans(chunks.iter().cloned().map(EvidenceSpan::from).collect())
    }

    /// Adds freshly retrieved chunks to an existing evidence set. Existing
    /// spans keep their position ahead of the new material.
    pub fn absorb(&self, existing: Vec<EvidenceSpan>, incoming: &[Chunk]) -> Vec<EvidenceSpan> {
        let mut spans = existing;
        spans.extend(incoming.iter().cloned().map(EvidenceSpan::from));
        self.collapse_spans(spans)
    }

    /// Collapses to a fixpoint, so the result is stable under a second pass.
    pub fn collapse_spans(&self, spans: Vec<EvidenceSpan>) -> Vec<EvidenceSpan> {
        let mut entries = drop_exact_duplicates(spans);

        // A merged span can reach entries scanned before it, so sweep until a
        // full pass changes nothing.
        loop {
            let mut changed = false;
            let mut i = 0;
            while i < entries.len() {
                let mut j = 0;
                while j < entries.len() {
                    if i == j {
                        j += 1;
                        continue;
                    }
                    if let Some(merged) = self.try_merge(&entries[i], &entries[j]) {
                        let (keep, drop) = (i.min(j), i.max(j));
                        entries[keep] = merged;
                        entries.remove(drop);
                        i = keep;
                        j = 0;
                        changed = true;
                        continue;
                    }
                    j += 1;
                }
                i += 1;
            }
            if !changed {
                break;
            }
        }

        entries.into_iter().map(|entry| entry.span).collect()
    }

    fn try_merge(&self, a: &Entry, b: &Entry) -> Option<Entry> {
        if a.words.len() >= b.words.len() && contains_words(&a.words, &b.words) {
            let mut host = a.clone();
            host.absorb(b.clone());
            return Some(host);
        }
        if b.words.len() > a.words.len() && contains_words(&b.words, &a.words) {
            let mut host = b.clone();
            host.absorb(a.clone());
            return Some(host);
        }

        if a.span.source_document != b.span.source_document
            || !a.span.paragraph_range.touches(b.span.paragraph_range)
        {
            return None;
        }

        let shared = boundary_overlap(
            &a.words,
            &b.words,
            self.window_words,
            self.min_overlap_words,
        )?;
        Some(splice(a, b, shared))
    }
}

fn drop_exact_duplicates(spans: Vec<EvidenceSpan>) -> Vec<Entry> {
    let mut entries: Vec<Entry> = Vec::with_capacity(spans.len());
    let mut seen: HashMap<Vec<String>, usize> = HashMap::new();

    for span in spans {
        let entry = Entry::new(span);
        match seen.get(&entry.words) {
            Some(&canonical) => entries[canonical].absorb(entry),
            None => {
                seen.insert(entry.words.clone(), entries.len());
                entries.push(entry);
            }
        }
    }

    entries
}

/// `head` followed by what `tail` adds after its first `shared` words.
fn splice(head: &Entry, tail: &Entry, shared: usize) -> Entry {
    let rest: Vec<&str> = tail.span.text.split_whitespace().skip(shared).collect();

    let mut span = head.span.clone();
    if !rest.is_empty() {
        span.text = format!("{} {}", head.span.text.trim_end(), rest.join(" "));
    }
    span.paragraph_range = span.paragraph_range.union(tail.span.paragraph_range);

    let mut words = head.words.clone();
    words.extend_from_slice(&tail.words[shared..]);

    let mut merged = Entry { span, words };
    merged.absorb(tail.clone());
    merged
}
