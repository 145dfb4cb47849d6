//! # Source Weights
//!
//! Credibility weights for news outlets, in `[0.0, 1.0]`.
//!
//! A weight only orders otherwise-equal candidates during selection; it never
//! disqualifies one.
//!
//! - Loads from JSON (weights + aliases) or falls back to a built-in seed.
//! - Case-insensitive lookup with punctuation/dash normalization.
//! - Fallback order: alias → exact → longest whole-word match → default.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{collections::HashMap, fs, path::Path};

const ENV_PATH: &str = "SOURCE_WEIGHTS_PATH";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceWeightsConfig {
    /// Weight for outlets with no entry.
    #[serde(default = "default_default_weight")]
    pub default_weight: f32,
    /// Weights keyed by canonical outlet name.
    #[serde(default)]
    pub weights: HashMap<String, f32>,
    /// Alternative spellings/domains → canonical outlet name.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

fn default_default_weight() -> f32 {
    0.50
}

impl SourceWeightsConfig {
    /// Parse a JSON weights file. Keys are normalized on load.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let s = fs::read_to_string(path)
            .with_context(|| format!("reading source weights from {}", path.display()))?;
        let raw: Self = serde_json::from_str(&s)
            .with_context(|| format!("parsing source weights in {}", path.display()))?;
        Ok(raw.normalized())
    }

    /// 1) `explicit` 2) $SOURCE_WEIGHTS_PATH 3) built-in seed.
    pub fn load_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::load_from_file(p);
        }
        if let Ok(p) = std::env::var(ENV_PATH) {
            return Self::load_from_file(p);
        }
        Ok(Self::default_seed())
    }

    fn normalized(self) -> Self {
        Self {
            default_weight: clamp01(self.default_weight),
            weights: self
                .weights
                .into_iter()
                .map(|(k, v)| (normalize(&k), clamp01(v)))
                .collect(),
            aliases: self
                .aliases
                .into_iter()
                .map(|(k, v)| (normalize(&k), normalize(&v)))
                .collect(),
        }
    }

    /// Weight for a source name.
    pub fn weight_for(&self, source: &str) -> f32 {
        let s = normalize(source);

        if let Some(canon) = self.aliases.get(&s) {
            if let Some(&w) = self.weights.get(canon) {
                return w;
            }
        }

        if let Some(&w) = self.weights.get(&s) {
            return w;
        }

        // Whole-word containment, longest key wins ("the verge daily" → "the verge").
        let padded = format!(" {s} ");
        self.weights
            .iter()
            .filter(|(k, _)| padded.contains(&format!(" {k} ")))
            .max_by_key(|(k, _)| k.len())
            .map(|(_, &w)| w)
            .unwrap_or(self.default_weight)
    }

    /// Built-in seed with common outlets.
    pub fn default_seed() -> Self {
        let mut weights = HashMap::new();
        let mut aliases = HashMap::new();

        for (k, v) in [
            ("reuters", 0.92),
            ("associated press", 0.92),
            ("bloomberg", 0.90),
            ("financial times", 0.90),
            ("wall street journal", 0.90),
            ("the information", 0.88),
            ("new york times", 0.87),
            ("the verge", 0.80),
            ("ars technica", 0.82),
            ("techcrunch", 0.78),
            ("wired", 0.78),
            ("cnbc", 0.76),
            ("axios", 0.76),
            ("engadget", 0.70),
            ("hacker news", 0.55),
            ("press release", 0.40),
        ] {
            weights.insert(k.to_string(), v);
        }

        for (a, c) in [
            ("ap", "associated press"),
            ("ap news", "associated press"),
            ("wsj", "wall street journal"),
            ("wsj com", "wall street journal"),
            ("ft", "financial times"),
            ("ft com", "financial times"),
            ("nyt", "new york times"),
            ("nytimes", "new york times"),
            ("theverge com", "the verge"),
            ("arstechnica", "ars technica"),
            ("tc", "techcrunch"),
            ("hn", "hacker news"),
            ("businesswire", "press release"),
            ("pr newswire", "press release"),
        ] {
            aliases.insert(a.to_string(), c.to_string());
        }

        Self {
            default_weight: 0.50,
            weights,
            aliases,
        }
    }
}

/// Lowercase, separators/punctuation to spaces, single-spaced.
fn normalize(s: &str) -> String {
    let mut out = s.trim().to_lowercase();
    for ch in ['—', '–', '-', '_', '/', '\\'] {
        out = out.replace(ch, " ");
    }
    out = out.replace(['\n', '\r', '\t', '.', ',', '‚', '’', '\''], " ");
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clamp01(x: f32) -> f32 {
    x.clamp(0.0, 1.0)
}
