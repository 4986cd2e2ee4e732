//! Rule-based query refinement.
//!
//! Each strategy is a deterministic text transform; no model call is spent
//! on rewriting. The coordinator loops refinement until evaluation
//! confidence recovers or the attempt budget runs out.

use crate::crag::types::{CragEvaluation, Refinement, RefinementStrategy};
use crate::llm::types::{ChatMessage, ChatRole, Query};

/// Longest history snippet folded into a refined query.
const CONTEXT_SNIPPET_CHARS: usize = 80;

const HEDGING_TOKENS: &[&str] = &["maybe", "possibly", "might", "perhaps"];

fn collapse_repeated_words(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for word in text.split_whitespace() {
        let normalized = word
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        let previous = out
            .last()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase());
        if !normalized.is_empty() && previous.as_deref() == Some(normalized.as_str()) {
            continue;
        }
        out.push(word);
    }
    out.join(" ")
}

fn snippet(message: &ChatMessage) -> String {
    let content = message.content.trim();
    if content.len() <= CONTEXT_SNIPPET_CHARS {
        content.to_string()
    } else {
        let mut cut = CONTEXT_SNIPPET_CHARS;
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &content[..cut])
    }
}

fn last_of_role(history: &[ChatMessage], role: ChatRole) -> Option<&ChatMessage> {
    history.iter().rev().find(|m| m.role == role)
}

/// Rule-based refiner.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryRefiner;

impl QueryRefiner {
    pub fn new() -> Self {
        Self
    }

    /// Apply the highest-priority recommended strategy. Returns None when
    /// the evaluation carries no recommendation.
    pub fn refine(&self, query: &Query, evaluation: &CragEvaluation) -> Option<Refinement> {
        let strategy = evaluation.recommendations.iter().min()?;
        Some(self.apply(*strategy, &evaluation.original_query, &query.history))
    }

    /// Apply one strategy to the query text.
    pub fn apply(
        &self,
        strategy: RefinementStrategy,
        text: &str,
        history: &[ChatMessage],
    ) -> Refinement {
        match strategy {
            RefinementStrategy::Correction => self.correct(text),
            RefinementStrategy::Clarification => self.clarify(text, history),
            RefinementStrategy::Decomposition => self.decompose(text),
            RefinementStrategy::Simplification => self.simplify(text),
            RefinementStrategy::Expansion => self.expand(text),
            RefinementStrategy::Contextualization => self.contextualize(text, history),
        }
    }

    fn correct(&self, text: &str) -> Refinement {
        let refined = collapse_repeated_words(text);
        Refinement {
            original: text.to_string(),
            reasoning: "collapsed duplicated words and normalized whitespace".to_string(),
            refined,
            strategy: RefinementStrategy::Correction,
            sub_queries: None,
            added_context: None,
            confidence: 0.9,
        }
    }

    fn clarify(&self, text: &str, history: &[ChatMessage]) -> Refinement {
        if let Some(message) = last_of_role(history, ChatRole::User) {
            let context = snippet(message);
            return Refinement {
                original: text.to_string(),
                refined: format!("{text} (referring to: {context})"),
                strategy: RefinementStrategy::Clarification,
                sub_queries: None,
                added_context: Some(context),
                confidence: 0.7,
                reasoning: "resolved referential phrasing against the previous user turn"
                    .to_string(),
            };
        }

        let stripped: String = text
            .split_whitespace()
            .filter(|w| !HEDGING_TOKENS.contains(&w.to_lowercase().as_str()))
            .collect::<Vec<_>>()
            .join(" ");
        let refined = if stripped != text && !stripped.is_empty() {
            stripped
        } else {
            format!("{text} (state the specific subject explicitly)")
        };
        Refinement {
            original: text.to_string(),
            refined,
            strategy: RefinementStrategy::Clarification,
            sub_queries: None,
            added_context: None,
            confidence: 0.6,
            reasoning: "no antecedent available; made the ambiguity explicit".to_string(),
        }
    }

    fn decompose(&self, text: &str) -> Refinement {
        let sub_queries: Vec<String> = text
            .split(|c| c == '?' || c == ';')
            .flat_map(|part| part.split(" and "))
            .map(|part| part.trim().trim_start_matches(|c: char| !c.is_alphanumeric()))
            .filter(|part| part.split_whitespace().count() >= 2)
            .map(|part| part.to_string())
            .collect();

        let refined = sub_queries.first().cloned().unwrap_or_else(|| text.to_string());
        Refinement {
            original: text.to_string(),
            refined,
            strategy: RefinementStrategy::Decomposition,
            sub_queries: (sub_queries.len() > 1).then_some(sub_queries),
            added_context: None,
            confidence: 0.75,
            reasoning: "split compound query into independent sub-queries".to_string(),
        }
    }

    fn simplify(&self, text: &str) -> Refinement {
        let first_clause = text
            .split(|c| c == ',' || c == ';')
            .next()
            .unwrap_or(text)
            .trim();
        let refined = if first_clause.len() < text.trim().len() && !first_clause.is_empty() {
            first_clause.to_string()
        } else {
            // Single long clause: keep the leading words.
            text.split_whitespace().take(15).collect::<Vec<_>>().join(" ")
        };
        Refinement {
            original: text.to_string(),
            refined,
            strategy: RefinementStrategy::Simplification,
            sub_queries: None,
            added_context: None,
            confidence: 0.7,
            reasoning: "reduced the query to its leading clause".to_string(),
        }
    }

    fn expand(&self, text: &str) -> Refinement {
        Refinement {
            original: text.to_string(),
            refined: format!("{text} (include relevant background and define key terms)"),
            strategy: RefinementStrategy::Expansion,
            sub_queries: None,
            added_context: None,
            confidence: 0.6,
            reasoning: "broadened an under-specified query".to_string(),
        }
    }

    fn contextualize(&self, text: &str, history: &[ChatMessage]) -> Refinement {
        let context = last_of_role(history, ChatRole::Assistant)
            .or_else(|| last_of_role(history, ChatRole::User))
            .map(snippet);
        let refined = match &context {
            Some(context) => format!("{text} (context: {context})"),
            None => text.to_string(),
        };
        Refinement {
            original: text.to_string(),
            refined,
            strategy: RefinementStrategy::Contextualization,
            sub_queries: None,
            added_context: context,
            confidence: 0.75,
            reasoning: "folded conversation context into the query".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crag::evaluator::QueryEvaluator;

    #[test]
    fn test_correction_collapses_duplicates() {
        let refiner = QueryRefiner::new();
        let refinement =
            refiner.apply(RefinementStrategy::Correction, "explain the the retry policy", &[]);
        assert_eq!(refinement.refined, "explain the retry policy");
        assert_ne!(refinement.refined, refinement.original);
    }

    #[test]
    fn test_clarification_uses_history_when_available() {
        let refiner = QueryRefiner::new();
        let history = vec![
            ChatMessage::user("Tell me about the nightly deploy"),
            ChatMessage::assistant("It pushes to staging at 02:00."),
        ];
        let refinement =
            refiner.apply(RefinementStrategy::Clarification, "Why did it fail?", &history);
        assert!(refinement.refined.contains("nightly deploy"));
        assert!(refinement.added_context.is_some());
    }

    #[test]
    fn test_clarification_without_history_still_rewrites() {
        let refiner = QueryRefiner::new();
        let refinement = refiner.apply(RefinementStrategy::Clarification, "Why did it fail?", &[]);
        assert_ne!(refinement.refined, refinement.original);
    }

    #[test]
    fn test_decomposition_produces_sub_queries() {
        let refiner = QueryRefiner::new();
        let refinement = refiner.apply(
            RefinementStrategy::Decomposition,
            "describe the ingest pipeline and explain the export pipeline",
            &[],
        );
        let subs = refinement.sub_queries.unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(refinement.refined, subs[0]);
    }

    #[test]
    fn test_simplification_keeps_leading_clause() {
        let refiner = QueryRefiner::new();
        let refinement = refiner.apply(
            RefinementStrategy::Simplification,
            "explain the cache topology, including eviction, warmup, and sharding",
            &[],
        );
        assert_eq!(refinement.refined, "explain the cache topology");
    }

    #[test]
    fn test_refine_picks_highest_priority_recommendation() {
        let refiner = QueryRefiner::new();
        let evaluator = QueryEvaluator::new();
        // Malformed + ambiguous: correction outranks clarification.
        let query = Query::new("why did it it fail?", "tenant-1");
        let evaluation = evaluator.evaluate(&query);
        let refinement = refiner.refine(&query, &evaluation).unwrap();
        assert_eq!(refinement.strategy, RefinementStrategy::Correction);
    }

    #[test]
    fn test_refine_none_without_recommendations() {
        let refiner = QueryRefiner::new();
        let evaluator = QueryEvaluator::new();
        let query = Query::new("Explain the retry policy of the payment gateway", "tenant-1");
        let evaluation = evaluator.evaluate(&query);
        assert!(refiner.refine(&query, &evaluation).is_none());
    }

    #[test]
    fn test_contextualization_prefers_assistant_turn() {
        let refiner = QueryRefiner::new();
        let history = vec![
            ChatMessage::user("how does ingest work?"),
            ChatMessage::assistant("Ingest batches documents every five minutes."),
        ];
        let refinement = refiner.apply(RefinementStrategy::Contextualization, "and export?", &history);
        assert!(refinement.refined.contains("Ingest batches documents"));
    }
}
