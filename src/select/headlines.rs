// src/select/headlines.rs
//! Semantic-duplicate check between a candidate headline and headlines that
//! already ran recently.

use std::collections::HashSet;

/// Decides whether a headline repeats one of `recent`.
pub trait HeadlineMatcher: Send + Sync {
    fn is_duplicate(&self, headline: &str, recent: &[String]) -> bool;
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "in", "is",
    "it", "its", "of", "on", "or", "that", "the", "to", "was", "will", "with", "after", "over",
    "new", "says",
];

/// Token Jaccard overlap or normalized Levenshtein similarity above a threshold.
#[derive(Debug, Clone, Copy)]
pub struct SimilarHeadlines {
    pub jaccard_threshold: f64,
    pub levenshtein_threshold: f64,
}

impl Default for SimilarHeadlines {
    fn default() -> Self {
        Self {
            jaccard_threshold: 0.6,
            levenshtein_threshold: 0.85,
        }
    }
}

fn tokens(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|t| t.len() > 1 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

fn flat(s: &str) -> String {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn jaccard(a: &str, b: &str) -> f64 {
    let (ta, tb) = (tokens(a), tokens(b));
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let inter = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    inter / union
}

impl SimilarHeadlines {
    pub fn similar(&self, a: &str, b: &str) -> bool {
        let (fa, fb) = (flat(a), flat(b));
        if fa.is_empty() || fb.is_empty() {
            return false;
        }
        fa == fb
            || jaccard(a, b) >= self.jaccard_threshold
            || strsim::normalized_levenshtein(&fa, &fb) >= self.levenshtein_threshold
    }
}

impl HeadlineMatcher for SimilarHeadlines {
    fn is_duplicate(&self, headline: &str, recent: &[String]) -> bool {
        recent.iter().any(|r| self.similar(headline, r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewordings_of_the_same_story_match() {
        let m = SimilarHeadlines::default();
        assert!(m.similar(
            "Nvidia unveils Blackwell Ultra chip at GTC",
            "Nvidia unveils the Blackwell Ultra chip at GTC"
        ));
        assert!(m.similar("Acme acquires Beta for $2B", "Acme acquires Beta for $2B!"));
    }

    #[test]
    fn different_stories_do_not_match() {
        let m = SimilarHeadlines::default();
        assert!(!m.similar(
            "Nvidia unveils Blackwell Ultra chip",
            "EU fines Apple over App Store rules"
        ));
        assert!(!m.is_duplicate("Anything", &[]));
        assert!(!m.similar("", "x"));
    }

    #[test]
    fn jaccard_ignores_stopwords_and_case() {
        assert!((jaccard("The Fed holds rates", "fed HOLDS rates") - 1.0).abs() < 1e-9);
    }
}
