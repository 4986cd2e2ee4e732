//! Post-hoc confidence scoring over response text.
//!
//! No external calls: four surface indicators are combined into a single
//! score that drives tier escalation and low-confidence disclaimers.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::llm::types::ModelTier;

/// Per-indicator scores, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceIndicators {
    /// Higher means fewer hedges
    pub uncertainty: f64,
    pub specificity: f64,
    pub consistency: f64,
    pub factuality: f64,
}

/// Result of confidence evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceMetrics {
    /// Weighted aggregate in [0, 1]
    pub score: f64,
    pub indicators: ConfidenceIndicators,
    /// True when the score is below threshold and a higher tier exists
    pub requires_escalation: bool,
    pub reasoning: String,
}

const UNCERTAINTY_WEIGHT: f64 = 0.30;
const SPECIFICITY_WEIGHT: f64 = 0.30;
const CONSISTENCY_WEIGHT: f64 = 0.20;
const FACTUALITY_WEIGHT: f64 = 0.20;

const HEDGING_TOKENS: &[&str] = &[
    "maybe",
    "possibly",
    "might",
    "could",
    "perhaps",
    "likely",
    "probably",
    "seems",
    "appears",
    "may",
    "uncertain",
    "not sure",
    "unclear",
    "don't know",
    "cannot confirm",
];

const HEDGING_PHRASES: &[&str] = &[
    "i think",
    "i believe",
    "in my opinion",
    "it seems",
    "it appears",
    "as far as i know",
    "to my understanding",
    "from what i can tell",
];

const CONFIDENCE_INDICATORS: &[&str] = &[
    "definitely",
    "certainly",
    "absolutely",
    "clearly",
    "specifically",
    "exactly",
    "precisely",
    "confirmed",
    "verified",
];

const VAGUE_TERMS: &[&str] = &["thing", "stuff", "something", "anything", "everything"];

const CONTRASTIVE_MARKERS: &[&str] = &[
    "however",
    "but",
    "although",
    "on the other hand",
    "conversely",
    "in contrast",
];

const SELF_CORRECTION_MARKERS: &[&str] = &["actually", "rather", "correction", "more accurately"];

const OPINION_MARKERS: &[&str] = &["i think", "i believe", "in my opinion", "i feel", "personally"];

static DIGIT_SEQUENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(\.\d+)?").expect("invalid regex"));

static CITATION_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\[\d+\]|\(source:|according to|based on|as stated in|referenced in)")
        .expect("invalid regex")
});

/// Disclaimer appended below the high-confidence threshold.
pub const LOW_CONFIDENCE_DISCLAIMER: &str =
    "\n\nNote: this answer may be incomplete; please verify important details.";

/// Stronger disclaimer appended below the escalation threshold.
pub const VERY_LOW_CONFIDENCE_DISCLAIMER: &str = "\n\nNote: confidence in this answer is low \
     and it could not be verified against a more capable model; treat it as a starting point \
     and verify independently.";

fn count_occurrences(haystack: &str, needles: &[&str]) -> usize {
    needles
        .iter()
        .map(|needle| haystack.matches(needle).count())
        .sum()
}

/// Heuristic confidence evaluator. Pure CPU, never suspends.
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceEvaluator {
    /// Escalate below this score (default 0.7)
    threshold: f64,
}

impl Default for ConfidenceEvaluator {
    fn default() -> Self {
        Self { threshold: 0.7 }
    }
}

impl ConfidenceEvaluator {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Score a response produced by a model of `current_tier`.
    pub fn evaluate(&self, text: &str, current_tier: ModelTier) -> ConfidenceMetrics {
        let lower = text.to_lowercase();

        let indicators = ConfidenceIndicators {
            uncertainty: self.uncertainty_indicator(&lower),
            specificity: self.specificity_indicator(text, &lower),
            consistency: self.consistency_indicator(&lower),
            factuality: self.factuality_indicator(text, &lower),
        };

        let score = (indicators.uncertainty * UNCERTAINTY_WEIGHT
            + indicators.specificity * SPECIFICITY_WEIGHT
            + indicators.consistency * CONSISTENCY_WEIGHT
            + indicators.factuality * FACTUALITY_WEIGHT)
            .clamp(0.0, 1.0);

        let requires_escalation = score < self.threshold && current_tier != ModelTier::Powerful;

        ConfidenceMetrics {
            score,
            indicators,
            requires_escalation,
            reasoning: format!(
                "uncertainty={:.2} specificity={:.2} consistency={:.2} factuality={:.2} -> {:.2}{}",
                indicators.uncertainty,
                indicators.specificity,
                indicators.consistency,
                indicators.factuality,
                score,
                if requires_escalation {
                    " (escalation recommended)"
                } else {
                    ""
                },
            ),
        }
    }

    /// Append the appropriate disclaimer when escalation is exhausted.
    /// Never substitutes the response text.
    pub fn apply_disclaimer(&self, text: &str, score: f64, high_threshold: f64) -> String {
        if score < self.threshold {
            format!("{text}{VERY_LOW_CONFIDENCE_DISCLAIMER}")
        } else if score < high_threshold {
            format!("{text}{LOW_CONFIDENCE_DISCLAIMER}")
        } else {
            text.to_string()
        }
    }

    fn uncertainty_indicator(&self, lower: &str) -> f64 {
        let tokens = count_occurrences(lower, HEDGING_TOKENS);
        let phrases = count_occurrences(lower, HEDGING_PHRASES);
        1.0 - (0.1 * (tokens + 2 * phrases) as f64).min(0.5)
    }

    fn specificity_indicator(&self, text: &str, lower: &str) -> f64 {
        let mut score = 0.5;

        let digits = DIGIT_SEQUENCE.find_iter(text).count();
        score += (0.05 * digits as f64).min(0.20);

        if text.contains("```") {
            score += 0.15;
        }

        let citations = CITATION_MARKER.find_iter(text).count();
        score += (0.05 * citations as f64).min(0.15);

        score += 0.03 * count_occurrences(lower, CONFIDENCE_INDICATORS) as f64;
        score -= 0.05 * count_occurrences(lower, VAGUE_TERMS) as f64;

        score.clamp(0.0, 1.0)
    }

    fn consistency_indicator(&self, lower: &str) -> f64 {
        let mut score = 0.8;

        if count_occurrences(lower, CONTRASTIVE_MARKERS) > 3 {
            score -= 0.2;
        }
        score -= 0.1 * count_occurrences(lower, SELF_CORRECTION_MARKERS) as f64;

        score.clamp(0.0, 1.0)
    }

    fn factuality_indicator(&self, text: &str, lower: &str) -> f64 {
        let mut score = 0.5;

        let citations = CITATION_MARKER.find_iter(text).count();
        score += (0.1 * citations as f64).min(0.3);

        let data_points = DIGIT_SEQUENCE.find_iter(text).count();
        score += (0.05 * data_points as f64).min(0.2);

        score -= 0.1 * count_occurrences(lower, OPINION_MARKERS) as f64;

        score.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confident_response_scores_high() {
        let evaluator = ConfidenceEvaluator::default();
        let metrics = evaluator.evaluate(
            "The function returns exactly 42. Specifically, according to the \
             documentation [1], the timeout is 30 seconds and retries are capped at 3.",
            ModelTier::Fast,
        );
        assert!(metrics.score >= 0.7, "score: {}", metrics.score);
        assert!(!metrics.requires_escalation);
    }

    #[test]
    fn test_hedged_response_requires_escalation() {
        let evaluator = ConfidenceEvaluator::default();
        let metrics = evaluator.evaluate(
            "I think it might possibly work, but I'm not sure. It seems like it \
             could depend on something in the configuration, maybe. I believe \
             perhaps the stuff in there is relevant, as far as I know.",
            ModelTier::Fast,
        );
        assert!(metrics.score < 0.7, "score: {}", metrics.score);
        assert!(metrics.requires_escalation);
    }

    #[test]
    fn test_powerful_tier_never_escalates() {
        let evaluator = ConfidenceEvaluator::default();
        let metrics = evaluator.evaluate(
            "I think it might possibly work, but I'm not sure about anything.",
            ModelTier::Powerful,
        );
        assert!(metrics.score < 0.7);
        assert!(!metrics.requires_escalation);
    }

    #[test]
    fn test_uncertainty_floor() {
        let evaluator = ConfidenceEvaluator::default();
        // Pile on hedges: the penalty is capped at 0.5.
        let text = "maybe possibly might could perhaps likely probably seems \
                    appears may uncertain unclear i think i believe it seems";
        let metrics = evaluator.evaluate(text, ModelTier::Fast);
        assert!(metrics.indicators.uncertainty >= 0.5);
    }

    #[test]
    fn test_code_block_raises_specificity() {
        let evaluator = ConfidenceEvaluator::default();
        let with_code = evaluator.evaluate("Use this:\n```rust\nfn main() {}\n```", ModelTier::Fast);
        let without = evaluator.evaluate("Use the main function", ModelTier::Fast);
        assert!(with_code.indicators.specificity > without.indicators.specificity);
    }

    #[test]
    fn test_self_corrections_lower_consistency() {
        let evaluator = ConfidenceEvaluator::default();
        let metrics = evaluator.evaluate(
            "It is blue. Actually, rather, more accurately it is green. Correction: teal.",
            ModelTier::Balanced,
        );
        assert!(metrics.indicators.consistency < 0.8);
    }

    #[test]
    fn test_citations_bump_both_specificity_and_factuality() {
        // The double-counting is intentional and preserved.
        let evaluator = ConfidenceEvaluator::default();
        let cited = evaluator.evaluate("According to the manual [1], use flag X.", ModelTier::Fast);
        let bare = evaluator.evaluate("Use flag X.", ModelTier::Fast);
        assert!(cited.indicators.specificity > bare.indicators.specificity);
        assert!(cited.indicators.factuality > bare.indicators.factuality);
    }

    #[test]
    fn test_disclaimer_applied_by_band() {
        let evaluator = ConfidenceEvaluator::default();

        let strong = evaluator.apply_disclaimer("Answer.", 0.65, 0.8);
        assert!(strong.starts_with("Answer."));
        assert!(strong.contains("confidence in this answer is low"));

        let mild = evaluator.apply_disclaimer("Answer.", 0.75, 0.8);
        assert!(mild.contains("may be incomplete"));
        assert!(!mild.contains("confidence in this answer is low"));

        let none = evaluator.apply_disclaimer("Answer.", 0.9, 0.8);
        assert_eq!(none, "Answer.");
    }

    #[test]
    fn test_score_bounds() {
        let evaluator = ConfidenceEvaluator::default();
        for text in ["", "ok", "definitely verified [1] ```code``` 1 2 3 4 5"] {
            let metrics = evaluator.evaluate(text, ModelTier::Fast);
            assert!((0.0..=1.0).contains(&metrics.score));
        }
    }
}
