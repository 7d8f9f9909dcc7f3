use std::sync::LazyLock;

use regex::Regex;

use crate::models::YearSpan;

static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(1[0-9]{3}|20[0-9]{2})\b").expect("valid year regex"));

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^```[a-zA-Z]*\n(.*)\n```$").expect("valid code fence regex")
});

const ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "st", "co", "ltd", "inc", "jr", "sr", "vs", "etc", "gen", "col",
    "capt", "rev", "hon", "messrs", "mme", "mlle", "no", "vol", "ca", "c",
];

pub fn normalize_words(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|word| word.to_lowercase())
        .collect()
}

pub fn contains_words(haystack: &[String], needle: &[String]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Longest suffix of `head` that equals a prefix of `tail`, bounded by
/// `max_window` words and ignored below `min_overlap` words.
pub fn boundary_overlap(
    head: &[String],
    tail: &[String],
    max_window: usize,
    min_overlap: usize,
) -> Option<usize> {
    let upper = max_window.min(head.len()).min(tail.len());
    let lower = min_overlap.max(1);
    if upper < lower {
        return None;
    }

    (lower..=upper)
        .rev()
        .find(|&k| head[head.len() - k..] == tail[..k])
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Rough token estimate for budget checks: four tokens per three words.
pub fn estimate_tokens(text: &str) -> usize {
    let words = word_count(text);
    (words * 4).div_ceil(3)
}

pub fn split_sentences(text: &str) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let mut sentences = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for (idx, word) in words.iter().enumerate() {
        current.push(word);
        let is_last = idx + 1 == words.len();
        if is_last || ends_sentence(word) {
            sentences.push(current.join(" "));
            current.clear();
        }
    }

    sentences
}

fn ends_sentence(word: &str) -> bool {
    let trimmed = word.trim_end_matches(['"', '\'', ')', ']', '\u{201D}', '\u{2019}']);
    let Some(last) = trimmed.chars().last() else {
        return false;
    };
    if !matches!(last, '.' | '!' | '?') {
        return false;
    }
    if last != '.' {
        return true;
    }

    let stem = trimmed.trim_end_matches('.');
    let bare = stem.trim_start_matches(['"', '\'', '(', '[', '\u{201C}', '\u{2018}']);
    // Initials ("J.") and honorifics do not end a sentence.
    if bare.chars().count() == 1 && bare.chars().all(|c| c.is_alphabetic()) {
        return false;
    }
    !ABBREVIATIONS.contains(&bare.to_lowercase().as_str())
}

pub fn extract_years(text: &str) -> Vec<i32> {
    YEAR_RE
        .find_iter(text)
        .filter_map(|m| m.as_str().parse::<i32>().ok())
        .collect()
}

pub fn year_span_of(text: &str) -> Option<YearSpan> {
    let years = extract_years(text);
    let start = years.iter().copied().min()?;
    let end = years.iter().copied().max()?;
    Some(YearSpan::new(start, end))
}

pub fn sanitize_model_output(answer: &str) -> String {
    let mut text = answer.trim().to_string();
    if text.starts_with("```") {
        if let Some(body) = FENCE_RE.captures(&text).and_then(|caps| caps.get(1)) {
            text = body.as_str().trim().to_string();
        } else {
            text = text.replace("```", "").trim().to_string();
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(text: &str) -> Vec<String> {
        normalize_words(text)
    }

    #[test]
    fn containment_is_case_and_whitespace_insensitive() {
        let haystack = words("The firm   EXPANDED to Paris\nin 1850.");
        assert!(contains_words(&haystack, &words("expanded to paris")));
        assert!(!contains_words(&haystack, &words("expanded to london")));
    }

    #[test]
    fn boundary_overlap_finds_longest_shared_run() {
        let head = words("the firm expanded to Paris in 1850.");
        let tail = words("in 1850. Operations in Paris continued until 1870");
        assert_eq!(boundary_overlap(&head, &tail, 80, 2), Some(2));
        assert_eq!(boundary_overlap(&head, &tail, 1, 1), None);
        assert_eq!(boundary_overlap(&head, &tail, 80, 3), None);
    }

    #[test]
    fn sentences_respect_initials_and_honorifics() {
        let sentences = split_sentences(
            "Mr. N. M. Rothschild arrived in 1798. He opened a counting house! Did it last?",
        );
        assert_eq!(sentences.len(), 3);
        assert_eq!(sentences[0], "Mr. N. M. Rothschild arrived in 1798.");
    }

    #[test]
    fn year_span_covers_all_mentions() {
        let span = year_span_of("Founded 1810, merged in 1875 and closed 1931.").unwrap();
        assert_eq!(span, YearSpan::new(1810, 1931));
        assert!(year_span_of("no dates here").is_none());
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens("one two three"), 4);
        assert_eq!(estimate_tokens("one"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn strips_markdown_fences() {
        assert_eq!(sanitize_model_output("```markdown\nHello world\n```"), "Hello world");
    }
}
