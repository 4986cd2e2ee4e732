//! Query complexity analysis.
//!
//! Scores a query in [0, 1] across five weighted factors and buckets the
//! result into simple/moderate/complex for the router. Scoring is pure and
//! deterministic: identical text always produces identical scores.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Complexity bucket derived from the weighted score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    Simple,
    Moderate,
    Complex,
}

impl ComplexityLevel {
    /// Fixed thresholds: < 0.3 simple, < 0.6 moderate, else complex.
    pub fn from_score(score: f64) -> Self {
        if score < 0.3 {
            Self::Simple
        } else if score < 0.6 {
            Self::Moderate
        } else {
            Self::Complex
        }
    }
}

impl std::fmt::Display for ComplexityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Moderate => write!(f, "moderate"),
            Self::Complex => write!(f, "complex"),
        }
    }
}

/// Per-factor scores, each in [0, 1], before weighting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplexityFactors {
    pub entity_count: f64,
    pub depth: f64,
    pub specificity: f64,
    pub technical_terms: f64,
    pub ambiguity: f64,
}

/// Result of complexity analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityScore {
    pub level: ComplexityLevel,
    /// Weighted aggregate in [0, 1]
    pub score: f64,
    pub factors: ComplexityFactors,
    pub reasoning: String,
}

const ENTITY_WEIGHT: f64 = 0.30;
const DEPTH_WEIGHT: f64 = 0.25;
const SPECIFICITY_WEIGHT: f64 = 0.20;
const TECHNICAL_WEIGHT: f64 = 0.15;
const AMBIGUITY_WEIGHT: f64 = 0.10;

/// Score forced by the simple-pattern short-circuit.
const SIMPLE_PATTERN_SCORE: f64 = 0.2;

/// Closed vocabulary of domain terms that signal a substantive query.
const TECHNICAL_VOCABULARY: &[&str] = &[
    "algorithm",
    "analytics",
    "api",
    "architecture",
    "async",
    "authentication",
    "cache",
    "compiler",
    "compliance",
    "concurrency",
    "container",
    "database",
    "deployment",
    "encryption",
    "endpoint",
    "enterprise",
    "framework",
    "index",
    "kubernetes",
    "latency",
    "marketing",
    "microservice",
    "middleware",
    "orchestration",
    "protocol",
    "query",
    "replication",
    "runtime",
    "scalability",
    "schema",
    "serialization",
    "server",
    "sharding",
    "strategy",
    "throughput",
    "transaction",
    "webhook",
];

/// Two-word compound technical terms.
const COMPOUND_TERMS: &[&str] = &[
    "machine learning",
    "neural network",
    "load balancer",
    "message queue",
    "rate limit",
    "connection pool",
    "vector database",
    "prompt caching",
    "data pipeline",
    "state machine",
    "dependency injection",
    "garbage collection",
];

const MULTI_STEP_INDICATORS: &[&str] = &[
    "first",
    "then",
    "finally",
    "step by step",
    "walk through",
    "explain how",
    "what happens when",
    "because",
];

const VAGUE_TERMS: &[&str] = &["thing", "stuff", "something", "anything", "everything"];

const SPECIFIC_MARKERS: &[&str] = &["exactly", "specifically", "precisely", "particular"];

const HEDGING_TOKENS: &[&str] = &[
    "maybe",
    "possibly",
    "might",
    "could",
    "perhaps",
    "not sure",
    "unclear",
];

const WH_WORDS: &[&str] = &["what", "when", "where", "who", "why", "which", "how"];

const CONJUNCTIONS: &[&str] = &["and", "or", "but"];

/// Keywords signalling the query references visual input.
const VISION_KEYWORDS: &[&str] = &[
    "image",
    "picture",
    "photo",
    "screenshot",
    "diagram",
    "visual",
    "see",
    "look at",
    "show me",
    "what's in",
];

static SIMPLE_FACTUAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(what|when|where|who|which)\s+(is|are|was|were)\b").expect("invalid regex")
});

static YES_NO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(is|are|was|were|do|does|did|can|could|will|would|should|has|have)\s+\w+")
        .expect("invalid regex")
});

static DEFINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^define\s+\S+").expect("invalid regex"));

fn count_occurrences(haystack: &str, needles: &[&str]) -> usize {
    needles
        .iter()
        .map(|needle| haystack.matches(needle).count())
        .sum()
}

fn count_word_occurrences(words: &[&str], vocabulary: &[&str]) -> usize {
    words
        .iter()
        .filter(|word| vocabulary.contains(&word.to_lowercase().as_str()))
        .count()
}

/// Complexity analyzer. Stateless; one instance can score any number of
/// queries concurrently.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComplexityAnalyzer;

impl ComplexityAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Score a query. The short-circuit for simple factual patterns runs
    /// before weighted aggregation and forces the score to 0.2.
    pub fn analyze(&self, text: &str) -> ComplexityScore {
        let trimmed = text.trim();
        let factors = self.compute_factors(trimmed);

        if SIMPLE_FACTUAL.is_match(trimmed) || YES_NO.is_match(trimmed) || DEFINE.is_match(trimmed)
        {
            return ComplexityScore {
                level: ComplexityLevel::from_score(SIMPLE_PATTERN_SCORE),
                score: SIMPLE_PATTERN_SCORE,
                factors,
                reasoning: "matched simple factual pattern".to_string(),
            };
        }

        let score = (factors.entity_count * ENTITY_WEIGHT
            + factors.depth * DEPTH_WEIGHT
            + factors.specificity * SPECIFICITY_WEIGHT
            + factors.technical_terms * TECHNICAL_WEIGHT
            + factors.ambiguity * AMBIGUITY_WEIGHT)
            .clamp(0.0, 1.0);
        let level = ComplexityLevel::from_score(score);

        ComplexityScore {
            level,
            score,
            factors,
            reasoning: format!(
                "entities={:.2} depth={:.2} specificity={:.2} technical={:.2} ambiguity={:.2} -> {} ({:.2})",
                factors.entity_count,
                factors.depth,
                factors.specificity,
                factors.technical_terms,
                factors.ambiguity,
                level,
                score,
            ),
        }
    }

    fn compute_factors(&self, text: &str) -> ComplexityFactors {
        let lower = text.to_lowercase();
        let words: Vec<&str> = lower
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
            .filter(|w| !w.is_empty())
            .collect();

        let vocabulary_hits = count_word_occurrences(&words, TECHNICAL_VOCABULARY);
        let compound_hits = count_occurrences(&lower, COMPOUND_TERMS);

        ComplexityFactors {
            entity_count: self.entity_factor(text, vocabulary_hits, compound_hits),
            depth: self.depth_factor(text, &lower, &words),
            specificity: self.specificity_factor(text, &lower),
            technical_terms: ((vocabulary_hits + compound_hits).min(3) as f64) / 3.0,
            ambiguity: self.ambiguity_factor(&lower, &words),
        }
    }

    fn entity_factor(&self, text: &str, vocabulary_hits: usize, compound_hits: usize) -> f64 {
        let proper_nouns = text
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
            .filter(|w| w.len() > 1 && w.chars().next().is_some_and(char::is_uppercase))
            .count();

        let entities = proper_nouns + vocabulary_hits + compound_hits;
        (entities.min(5) as f64) / 5.0
    }

    fn depth_factor(&self, text: &str, lower: &str, words: &[&str]) -> f64 {
        let indicators = count_occurrences(lower, MULTI_STEP_INDICATORS);

        let clause_markers = text.matches(',').count()
            + text.matches(';').count()
            + count_word_occurrences(words, CONJUNCTIONS);

        let questions = text.matches('?').count();
        let extra_questions = questions.saturating_sub(1);

        let depth = indicators + clause_markers / 3 + extra_questions;
        (depth.min(5) as f64) / 5.0
    }

    // Rewards vagueness: specific phrasing and numbers pull this down.
    fn specificity_factor(&self, text: &str, lower: &str) -> f64 {
        let mut score = 0.5;
        score += 0.20 * count_occurrences(lower, VAGUE_TERMS) as f64;
        score -= 0.10 * count_occurrences(lower, SPECIFIC_MARKERS) as f64;
        if text.chars().any(|c| c.is_ascii_digit()) {
            score -= 0.15;
        }
        score.clamp(0.0, 1.0)
    }

    fn ambiguity_factor(&self, lower: &str, words: &[&str]) -> f64 {
        let mut score = 0.15 * count_occurrences(lower, HEDGING_TOKENS) as f64;
        if count_word_occurrences(words, WH_WORDS) > 2 {
            score += 0.20;
        }
        score.clamp(0.0, 1.0)
    }
}

/// Whether the text references visual input and should be routed to a
/// vision-capable model. Checked against the last user message.
pub fn requires_vision_model(text: &str) -> bool {
    let lower = text.to_lowercase();
    VISION_KEYWORDS.iter().any(|kw| lower.contains(kw))
}
