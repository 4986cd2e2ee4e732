//! Response quality scoring.
//!
//! Grounds a response against retrieved evidence, checks citations and
//! cross-turn consistency, and classifies hallucinations. A separate
//! RAGAS-style batch scorer reuses the same surface heuristics for
//! observability output; it never gates a response.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use crate::llm::types::{ChatMessage, ChatRole};

/// What the checker advises doing with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityRecommendation {
    Approve,
    FlagForReview,
    Reject,
}

/// Evidence scores and the verdict for one response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// Fraction of response claims supported by the retrieved chunks
    pub kb_alignment: f64,
    /// 1.0 when citation requirements are met or not applicable
    pub citation: f64,
    /// Penalized per contradiction against prior assistant turns
    pub consistency: f64,
    /// External fact-check adapter score
    pub fact_check: f64,
    /// Weighted aggregate in [0, 1]
    pub confidence: f64,
    pub is_hallucination: bool,
    pub recommendation: QualityRecommendation,
}

const KB_WEIGHT: f64 = 0.4;
const CITATION_WEIGHT: f64 = 0.3;
const CONSISTENCY_WEIGHT: f64 = 0.2;
const FACT_WEIGHT: f64 = 0.1;

/// Claim support requires this keyword-overlap fraction.
const SUPPORT_OVERLAP: f64 = 0.5;
/// Contradiction detection requires this shared content-word fraction.
const CONTRADICTION_OVERLAP: f64 = 0.6;

static CITATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\[\d+\]|\(source:[^)]*\)|according to|based on|as stated in|referenced in)")
        .expect("invalid regex")
});

const NEGATION_MARKERS: &[&str] = &["not", "no", "never", "cannot", "n't", "without"];

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "to", "of", "in", "on",
    "at", "by", "for", "with", "and", "or", "but", "it", "its", "this", "that", "these", "those",
    "as", "from", "will", "would", "can", "could", "should", "has", "have", "had", "do", "does",
    "did", "so", "than", "then", "there", "their", "they", "we", "you", "i",
];

fn content_words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 1)
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Fraction of `claim`'s content words present in `evidence`.
fn keyword_overlap(claim: &HashSet<String>, evidence: &HashSet<String>) -> f64 {
    if claim.is_empty() {
        return 0.0;
    }
    claim.intersection(evidence).count() as f64 / claim.len() as f64
}

/// Declarative sentences longer than 20 characters.
fn declarative_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if c == '.' || c == '!' || c == '?' {
            let sentence = text[start..i].trim();
            if c != '?' && sentence.len() > 20 {
                sentences.push(sentence);
            }
            start = i + c.len_utf8();
        }
    }
    let tail = text[start..].trim();
    if tail.len() > 20 {
        sentences.push(tail);
    }
    sentences
}

fn contains_negation(text: &str) -> bool {
    let lower = text.to_lowercase();
    NEGATION_MARKERS.iter().any(|marker| {
        if *marker == "n't" {
            lower.contains("n't")
        } else {
            lower
                .split(|c: char| !c.is_alphanumeric() && c != '\'')
                .any(|w| w == *marker)
        }
    })
}

/// External fact-checking adapter.
///
/// The default returns a fixed score; a real adapter can be slotted in by
/// the embedding application.
pub trait FactChecker: Send + Sync {
    fn check(&self, response: &str, query: &str) -> f64;
}

/// Placeholder fact-checker returning a constant score.
#[derive(Debug, Clone, Copy)]
pub struct FixedFactChecker(pub f64);

impl Default for FixedFactChecker {
    fn default() -> Self {
        Self(0.8)
    }
}

impl FactChecker for FixedFactChecker {
    fn check(&self, _response: &str, _query: &str) -> f64 {
        self.0.clamp(0.0, 1.0)
    }
}

/// Response quality checker. Pure CPU, never suspends.
#[derive(Clone)]
pub struct QualityChecker {
    /// Reject below this weighted confidence (default 0.6)
    hallucination_threshold: f64,
    /// Approve at or above this weighted confidence (default 0.7)
    confidence_threshold: f64,
    require_citations: bool,
    minimum_citations: usize,
    fact_checker: Arc<dyn FactChecker>,
}

impl QualityChecker {
    pub fn new(
        hallucination_threshold: f64,
        confidence_threshold: f64,
        require_citations: bool,
        minimum_citations: usize,
    ) -> Self {
        Self {
            hallucination_threshold,
            confidence_threshold,
            require_citations,
            minimum_citations,
            fact_checker: Arc::new(FixedFactChecker::default()),
        }
    }

    /// Replace the placeholder fact-checker with an external adapter.
    pub fn with_fact_checker(mut self, checker: Arc<dyn FactChecker>) -> Self {
        self.fact_checker = checker;
        self
    }

    /// Score a response against its evidence and conversation.
    pub fn check(
        &self,
        response: &str,
        query: &str,
        history: &[ChatMessage],
        chunks: &[String],
    ) -> QualityReport {
        let kb_alignment = self.kb_alignment(response, chunks);
        let citation = self.citation_score(response, chunks);
        let consistency = self.consistency_score(response, history);
        let fact_check = self.fact_checker.check(response, query);

        let confidence = (kb_alignment * KB_WEIGHT
            + citation * CITATION_WEIGHT
            + consistency * CONSISTENCY_WEIGHT
            + fact_check * FACT_WEIGHT)
            .clamp(0.0, 1.0);

        let is_hallucination = confidence < self.hallucination_threshold;
        let recommendation = if is_hallucination {
            QualityRecommendation::Reject
        } else if confidence >= self.confidence_threshold {
            QualityRecommendation::Approve
        } else {
            QualityRecommendation::FlagForReview
        };

        QualityReport {
            kb_alignment,
            citation,
            consistency,
            fact_check,
            confidence,
            is_hallucination,
            recommendation,
        }
    }

    /// Fraction of declarative claims whose content words overlap the
    /// concatenated evidence by more than half.
    fn kb_alignment(&self, response: &str, chunks: &[String]) -> f64 {
        if chunks.is_empty() {
            // Nothing was retrieved: alignment cannot be judged.
            return 1.0;
        }

        let evidence = content_words(&chunks.join(" "));
        let claims = declarative_sentences(response);
        if claims.is_empty() {
            return 1.0;
        }

        let supported = claims
            .iter()
            .filter(|claim| keyword_overlap(&content_words(claim), &evidence) > SUPPORT_OVERLAP)
            .count();
        supported as f64 / claims.len() as f64
    }

    fn citation_score(&self, response: &str, chunks: &[String]) -> f64 {
        // Citations only apply to responses grounded in retrieved context.
        if !self.require_citations || chunks.is_empty() {
            return 1.0;
        }
        let count = CITATION_PATTERN.find_iter(response).count();
        if count >= self.minimum_citations {
            1.0
        } else {
            0.0
        }
    }

    /// 1 − 0.2 per contradiction against previous assistant turns.
    fn consistency_score(&self, response: &str, history: &[ChatMessage]) -> f64 {
        let prior: Vec<&ChatMessage> = history
            .iter()
            .filter(|m| m.role == ChatRole::Assistant)
            .collect();
        if prior.is_empty() {
            return 1.0;
        }

        let response_sentences: Vec<(String, bool, HashSet<String>)> = declarative_sentences(
            response,
        )
        .into_iter()
        .map(|s| (s.to_string(), contains_negation(s), content_words(s)))
        .collect();

        let mut contradictions = 0usize;
        for message in prior {
            for prev in declarative_sentences(&message.content) {
                let prev_negated = contains_negation(prev);
                let prev_words = content_words(prev);
                if prev_words.is_empty() {
                    continue;
                }
                for (_, negated, words) in &response_sentences {
                    if words.is_empty() {
                        continue;
                    }
                    let shared = words.intersection(&prev_words).count() as f64;
                    let denom = words.len().min(prev_words.len()) as f64;
                    if shared / denom > CONTRADICTION_OVERLAP && (*negated != prev_negated) {
                        contradictions += 1;
                    }
                }
            }
        }

        (1.0 - 0.2 * contradictions as f64).max(0.0)
    }
}

/// RAGAS-style batch scores. Observability output only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagasScores {
    /// Claims supported by the provided contexts
    pub faithfulness: f64,
    /// Keyword overlap between answer and question
    pub answer_relevancy: f64,
    /// Mean question-overlap across contexts
    pub context_relevancy: f64,
    /// Fraction of the top-K contexts relevant to the question
    pub context_precision: f64,
    /// Ground-truth coverage by the contexts; None without ground truth
    pub context_recall: Option<f64>,
}

/// Batch scorer over the same surface heuristics as [`QualityChecker`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RagasScorer {
    /// K used for context precision (0 = all contexts)
    pub precision_k: usize,
}

impl RagasScorer {
    pub fn new(precision_k: usize) -> Self {
        Self { precision_k }
    }

    pub fn score(
        &self,
        question: &str,
        answer: &str,
        contexts: &[String],
        ground_truth: Option<&str>,
    ) -> RagasScores {
        let question_words = content_words(question);
        let evidence = content_words(&contexts.join(" "));

        let claims = declarative_sentences(answer);
        let faithfulness = if claims.is_empty() || contexts.is_empty() {
            1.0
        } else {
            claims
                .iter()
                .filter(|c| keyword_overlap(&content_words(c), &evidence) > SUPPORT_OVERLAP)
                .count() as f64
                / claims.len() as f64
        };

        let answer_relevancy = keyword_overlap(&question_words, &content_words(answer));

        let per_context: Vec<f64> = contexts
            .iter()
            .map(|c| keyword_overlap(&question_words, &content_words(c)))
            .collect();
        let context_relevancy = if per_context.is_empty() {
            0.0
        } else {
            per_context.iter().sum::<f64>() / per_context.len() as f64
        };

        let k = if self.precision_k == 0 {
            per_context.len()
        } else {
            self.precision_k.min(per_context.len())
        };
        let context_precision = if k == 0 {
            0.0
        } else {
            per_context[..k].iter().filter(|&&r| r > SUPPORT_OVERLAP).count() as f64 / k as f64
        };

        let context_recall = ground_truth.map(|truth| {
            let truth_words = content_words(truth);
            keyword_overlap(&truth_words, &evidence)
        });

        RagasScores {
            faithfulness,
            answer_relevancy,
            context_relevancy,
            context_precision,
            context_recall,
        }
    }
}
