use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{Query, QueryType};

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9][A-Za-z0-9'\-]*").expect("valid token regex"));

static PHRASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Z][A-Za-z'\-]+(?:\s+(?:de|von|van|of|&)?\s*[A-Z][A-Za-z'\-]+)+)\b")
        .expect("valid phrase regex")
});

const CONTROL_TERMS: &[&str] = &[
    "control",
    "controlled",
    "controlling",
    "influence",
    "influenced",
    "influential",
    "dominate",
    "dominated",
    "dominance",
    "power over",
    "stranglehold",
    "monopoly",
    "monopolized",
    "grip on",
];

const BROAD_IDENTITY_PHRASES: &[&str] = &[
    "which families",
    "what families",
    "which firms",
    "what firms",
    "which people",
    "who were the",
    "who are the",
    "list of",
    "list the",
    "all the families",
    "identity of",
    "identities of",
];

impl Query {
    /// Classifies the question once; every later stage branches on
    /// `query_type` instead of re-inspecting the text.
    pub fn parse(raw_text: &str) -> PipelineResult<Query> {
        let trimmed = raw_text.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::InvalidQuery("question is empty".to_string()));
        }

        let subject_terms = extract_subject_terms(trimmed);
        if subject_terms.is_empty() {
            return Err(PipelineError::InvalidQuery(format!(
                "no subject terms found in {trimmed:?}"
            )));
        }

        let query_type = classify(trimmed);
        Ok(Query {
            raw_text: trimmed.to_string(),
            query_type,
            subject_terms,
        })
    }
}

impl Query {
    /// Subject terms drawn from capitalized words in the question, falling
    /// back to every subject term when the question names nothing.
    pub fn anchor_terms(&self) -> Vec<String> {
        let stopwords = stopwords();
        let mut named: HashSet<String> = proper_noun_phrases(&self.raw_text).into_iter().collect();
        named.extend(
            TOKEN_RE
                .find_iter(&self.raw_text)
                .map(|m| m.as_str())
                .filter(|raw| raw.chars().next().is_some_and(|c| c.is_ascii_uppercase()))
                .map(str::to_lowercase)
                .filter(|lower| !stopwords.contains(lower.as_str())),
        );

        let anchors: Vec<String> = self
            .subject_terms
            .iter()
            .filter(|term| named.contains(term.as_str()))
            .cloned()
            .collect();
        if anchors.is_empty() {
            self.subject_terms.clone()
        } else {
            anchors
        }
    }
}

fn classify(question: &str) -> QueryType {
    let lower = question.to_lowercase();

    if CONTROL_TERMS.iter().any(|term| contains_term(&lower, term)) {
        return QueryType::ControlInfluence;
    }

    if BROAD_IDENTITY_PHRASES
        .iter()
        .any(|phrase| lower.contains(phrase))
    {
        return QueryType::BroadIdentity;
    }

    if !proper_noun_phrases(question).is_empty() || has_inner_proper_noun(question) {
        return QueryType::EntitySpecific;
    }

    QueryType::Other
}

fn contains_term(lower: &str, term: &str) -> bool {
    if term.contains(' ') {
        return lower.contains(term);
    }
    TOKEN_RE
        .find_iter(lower)
        .any(|m| m.as_str() == term)
}

fn has_inner_proper_noun(question: &str) -> bool {
    let stopwords = stopwords();
    TOKEN_RE.find_iter(question).skip(1).any(|m| {
        let raw = m.as_str();
        raw.chars().next().is_some_and(|c| c.is_ascii_uppercase())
            && !stopwords.contains(raw.to_lowercase().as_str())
    })
}

fn proper_noun_phrases(question: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut phrases = Vec::new();
    for caps in PHRASE_RE.captures_iter(question) {
        let Some(m) = caps.get(1) else {
            continue;
        };
        let phrase = m
            .as_str()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        let leading = phrase.split_whitespace().next().unwrap_or_default();
        if stopwords().contains(leading) || phrase.len() < 5 {
            continue;
        }
        if seen.insert(phrase.clone()) {
            phrases.push(phrase);
        }
    }
    phrases
}

pub fn extract_subject_terms(question: &str) -> Vec<String> {
    let stopwords = stopwords();
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for phrase in proper_noun_phrases(question) {
        if seen.insert(phrase.clone()) {
            out.push(phrase);
        }
    }

    for m in TOKEN_RE.find_iter(question) {
        let raw = m.as_str();
        let lower = raw.to_lowercase();
        if stopwords.contains(lower.as_str()) {
            continue;
        }

        let has_digit = raw.chars().any(|c| c.is_ascii_digit());
        let capitalized = raw.chars().next().is_some_and(|c| c.is_ascii_uppercase());
        if !has_digit && !capitalized && raw.len() < 4 {
            continue;
        }
        if has_digit && raw.len() < 3 {
            continue;
        }

        if seen.insert(lower.clone()) {
            out.push(lower);
        }
    }

    out
}

fn stopwords() -> HashSet<&'static str> {
    [
        "when", "what", "who", "whom", "whose", "where", "why", "how", "which", "did", "does",
        "do", "is", "are", "was", "were", "the", "a", "an", "in", "on", "to", "of", "for", "it",
        "its", "and", "or", "if", "then", "about", "tell", "me", "please", "give", "more",
        "information", "history", "describe", "explain", "over", "from", "with", "that", "this",
        "they", "them", "their", "there", "have", "has", "had", "been", "into", "time", "during",
        "list", "families", "family", "people", "firms", "control", "controlled", "influence",
        "influenced", "all", "some", "any", "i", "we", "you", "happen", "happened", "happens",
        "become", "became", "becomes", "change", "changed", "changes", "evolve", "evolved",
        "house", "houses", "role", "part", "play", "played", "known", "after", "before",
        "later", "early", "year", "years", "century", "between", "under", "made", "make",
        "come", "came", "doing", "done", "much", "many", "most", "other", "such", "also",
        "would", "could", "should", "like", "what's", "who's", "end", "ended", "start",
        "started", "begin", "began", "rise", "fall", "story", "background", "overview",
    ]
    .into_iter()
    .collect()
}
