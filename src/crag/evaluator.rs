//! Query evaluation: surface heuristics over the raw query text.
//!
//! No model call is made here; the evaluation decides whether refinement
//! and multi-hop reasoning are worth their cost before anything is spent.

use regex::Regex;
use std::sync::LazyLock;
use uuid::Uuid;

use crate::crag::types::{
    ConfidenceLevel, CragEvaluation, IssueSeverity, IssueType, QueryIssue, ReasoningType,
    RefinementStrategy,
};
use crate::llm::types::Query;

/// Word count above which a query counts as overly narrow.
const NARROW_WORD_COUNT: usize = 20;
/// AND-connective count above which a query counts as overly narrow.
const NARROW_CONNECTIVES: usize = 3;
/// Word count below which a query counts as vague.
const VAGUE_WORD_COUNT: usize = 4;

const HEDGING_TOKENS: &[&str] = &["maybe", "possibly", "might", "perhaps", "not sure", "unclear"];

const BREADTH_MARKERS: &[&str] = &["everything", "all", "general"];

const REFERENTIAL_PRONOUNS: &[&str] = &["it", "this", "that", "they", "them", "those", "these"];

static COMPARATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(compare|versus|vs\.?|difference between|better than|worse than|pros and cons)\b")
        .expect("invalid regex")
});

static TEMPORAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(before|after|timeline|history|evolution|since|until|over time)\b")
        .expect("invalid regex")
});

static CAUSAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(why|because|cause[ds]?|reason|leads? to|results? in|due to)\b")
        .expect("invalid regex")
});

static AGGREGATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(how many|count|total|average|sum|list (all|every)|enumerate)\b")
        .expect("invalid regex")
});

fn words(text: &str) -> Vec<&str> {
    text.split_whitespace().collect()
}

fn has_repeated_word(text: &str) -> bool {
    let normalized: Vec<String> = text
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect();
    normalized.windows(2).any(|pair| pair[0] == pair[1])
}

fn has_referential_pronoun(text: &str) -> bool {
    text.split(|c: char| !c.is_alphanumeric())
        .any(|w| REFERENTIAL_PRONOUNS.contains(&w.to_lowercase().as_str()))
}

/// Pure query evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryEvaluator;

impl QueryEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, query: &Query) -> CragEvaluation {
        let text = query.text.trim();
        let lower = text.to_lowercase();
        let word_count = words(text).len();
        let has_history = !query.history.is_empty();

        let mut issues = Vec::new();
        let mut recommendations = Vec::new();

        if has_repeated_word(text) {
            issues.push(QueryIssue {
                issue_type: IssueType::Malformed,
                severity: IssueSeverity::Low,
            });
            recommendations.push(RefinementStrategy::Correction);
        }

        let referential = has_referential_pronoun(text);
        if referential && !has_history {
            issues.push(QueryIssue {
                issue_type: IssueType::Ambiguous,
                severity: IssueSeverity::High,
            });
            recommendations.push(RefinementStrategy::Clarification);
        } else if referential && has_history {
            issues.push(QueryIssue {
                issue_type: IssueType::MissingContext,
                severity: IssueSeverity::Low,
            });
            recommendations.push(RefinementStrategy::Contextualization);
        }

        if HEDGING_TOKENS.iter().any(|t| lower.contains(t)) {
            issues.push(QueryIssue {
                issue_type: IssueType::Ambiguous,
                severity: IssueSeverity::Medium,
            });
            if !recommendations.contains(&RefinementStrategy::Clarification) {
                recommendations.push(RefinementStrategy::Clarification);
            }
        }

        let breadth = BREADTH_MARKERS.iter().any(|m| {
            lower
                .split(|c: char| !c.is_alphanumeric())
                .any(|w| w == *m)
        });
        if breadth {
            issues.push(QueryIssue {
                issue_type: IssueType::TooBroad,
                severity: IssueSeverity::Medium,
            });
            recommendations.push(RefinementStrategy::Decomposition);
        }

        let connectives = lower.matches(" and ").count();
        if word_count > NARROW_WORD_COUNT || connectives > NARROW_CONNECTIVES {
            issues.push(QueryIssue {
                issue_type: IssueType::TooNarrow,
                severity: IssueSeverity::Low,
            });
            recommendations.push(RefinementStrategy::Simplification);
        }

        if word_count < VAGUE_WORD_COUNT && !referential {
            issues.push(QueryIssue {
                issue_type: IssueType::Vague,
                severity: IssueSeverity::Medium,
            });
            recommendations.push(RefinementStrategy::Expansion);
        }

        let confidence = Self::confidence_from_issues(&issues);
        let confidence_level = ConfidenceLevel::from_confidence(confidence);
        let reasoning_type = Self::classify_reasoning(text, &lower, connectives);

        let should_refine = confidence < 0.6
            || issues.iter().any(|i| i.severity == IssueSeverity::High);
        let should_use_multi_hop = reasoning_type != ReasoningType::SingleHop;

        let reasoning = if issues.is_empty() {
            format!("no surface issues; {reasoning_type:?} reasoning")
        } else {
            format!(
                "{} issue(s) detected; confidence {:.2}; {reasoning_type:?} reasoning",
                issues.len(),
                confidence,
            )
        };

        CragEvaluation {
            query_id: Uuid::new_v4(),
            original_query: text.to_string(),
            confidence,
            confidence_level,
            should_refine,
            should_use_multi_hop,
            reasoning_type,
            issues,
            recommendations,
            reasoning,
        }
    }

    fn confidence_from_issues(issues: &[QueryIssue]) -> f64 {
        let mut confidence: f64 = 1.0;
        for issue in issues {
            confidence -= match issue.severity {
                IssueSeverity::High => 0.3,
                IssueSeverity::Medium => 0.15,
                IssueSeverity::Low => 0.05,
            };
        }
        confidence.clamp(0.0, 1.0)
    }

    fn classify_reasoning(text: &str, lower: &str, connectives: usize) -> ReasoningType {
        if COMPARATIVE.is_match(text) {
            ReasoningType::Comparative
        } else if TEMPORAL.is_match(text) {
            ReasoningType::Temporal
        } else if CAUSAL.is_match(text) {
            ReasoningType::Causal
        } else if AGGREGATIVE.is_match(text) {
            ReasoningType::Aggregative
        } else if connectives > 0 || lower.contains(';') || text.matches('?').count() > 1 {
            ReasoningType::MultiHop
        } else {
            ReasoningType::SingleHop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ChatMessage;

    fn evaluate(text: &str) -> CragEvaluation {
        QueryEvaluator::new().evaluate(&Query::new(text, "tenant-1"))
    }

    #[test]
    fn test_clean_query_high_confidence() {
        let eval = evaluate("Explain the retry policy of the payment gateway");
        assert!(eval.issues.is_empty());
        assert_eq!(eval.confidence_level, ConfidenceLevel::High);
        assert!(!eval.should_refine);
    }

    #[test]
    fn test_anaphora_without_antecedent_flags_high_severity_ambiguity() {
        let eval = evaluate("Why did it fail?");
        assert!(eval.issues.iter().any(|i| {
            i.issue_type == IssueType::Ambiguous && i.severity == IssueSeverity::High
        }));
        assert!(eval.should_refine);
        assert!(eval
            .recommendations
            .contains(&RefinementStrategy::Clarification));
    }

    #[test]
    fn test_anaphora_with_history_recommends_contextualization() {
        let query = Query::new("Why did it fail?", "tenant-1").with_history(vec![
            ChatMessage::user("Tell me about the nightly deploy"),
            ChatMessage::assistant("The nightly deploy pushes to staging."),
        ]);
        let eval = QueryEvaluator::new().evaluate(&query);
        assert!(eval
            .issues
            .iter()
            .any(|i| i.issue_type == IssueType::MissingContext));
        assert!(eval
            .recommendations
            .contains(&RefinementStrategy::Contextualization));
    }

    #[test]
    fn test_breadth_markers_flag_too_broad() {
        let eval = evaluate("Tell me everything about databases");
        assert!(eval.issues.iter().any(|i| i.issue_type == IssueType::TooBroad));
        assert!(eval
            .recommendations
            .contains(&RefinementStrategy::Decomposition));
    }

    #[test]
    fn test_long_query_flags_too_narrow() {
        let eval = evaluate(
            "Explain the configuration of the primary database and the replica \
             and the cache and the load balancer and the message broker in the \
             staging environment of the payments cluster",
        );
        assert!(eval.issues.iter().any(|i| i.issue_type == IssueType::TooNarrow));
        assert!(eval
            .recommendations
            .contains(&RefinementStrategy::Simplification));
    }

    #[test]
    fn test_repeated_word_flags_malformed() {
        let eval = evaluate("Explain the the retry policy");
        assert!(eval.issues.iter().any(|i| i.issue_type == IssueType::Malformed));
        assert_eq!(eval.recommendations[0], RefinementStrategy::Correction);
    }

    #[test]
    fn test_reasoning_type_classification() {
        assert_eq!(
            evaluate("Compare Postgres and MySQL replication").reasoning_type,
            ReasoningType::Comparative
        );
        assert_eq!(
            evaluate("How has the schema evolved since the v2 migration").reasoning_type,
            ReasoningType::Temporal
        );
        assert_eq!(
            evaluate("Why does the cache miss rate spike at noon").reasoning_type,
            ReasoningType::Causal
        );
        assert_eq!(
            evaluate("How many tenants exceeded their quota last month").reasoning_type,
            ReasoningType::Aggregative
        );
        assert_eq!(
            evaluate("Describe the ingest pipeline and the export pipeline").reasoning_type,
            ReasoningType::MultiHop
        );
        assert_eq!(
            evaluate("Describe the ingest pipeline").reasoning_type,
            ReasoningType::SingleHop
        );
    }

    #[test]
    fn test_multi_hop_gate() {
        assert!(evaluate("Compare the ingest and export pipelines").should_use_multi_hop);
        assert!(!evaluate("Describe the ingest pipeline").should_use_multi_hop);
    }

    #[test]
    fn test_confidence_in_bounds() {
        for text in [
            "x",
            "Why did it fail?",
            "maybe tell me everything about all the things and and and",
        ] {
            let eval = evaluate(text);
            assert!((0.0..=1.0).contains(&eval.confidence), "query: {text}");
        }
    }
}
