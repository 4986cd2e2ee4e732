//! Types for the corrective-RAG pipeline.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::retrieval::RetrievedChunk;

/// Confidence band for an evaluated query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
    VeryLow,
}

impl ConfidenceLevel {
    /// Band thresholds: >= 0.8 high, >= 0.6 medium, >= 0.4 low.
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.8 {
            Self::High
        } else if confidence >= 0.6 {
            Self::Medium
        } else if confidence >= 0.4 {
            Self::Low
        } else {
            Self::VeryLow
        }
    }
}

/// How a query needs to be reasoned about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningType {
    SingleHop,
    MultiHop,
    Comparative,
    Temporal,
    Causal,
    Aggregative,
}

/// A problem detected in the query surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    /// Referential or hedged phrasing with no resolvable antecedent
    Ambiguous,
    /// Sweeping scope markers
    TooBroad,
    /// Long multi-clause phrasing
    TooNarrow,
    /// Too little content to retrieve against
    Vague,
    /// Referential phrasing that prior turns can resolve
    MissingContext,
    /// Malformed text (duplicated words, stray whitespace)
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryIssue {
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub severity: IssueSeverity,
}

/// How a query can be rewritten. Ordered by selection priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementStrategy {
    Correction,
    Clarification,
    Decomposition,
    Simplification,
    Expansion,
    Contextualization,
}

impl std::fmt::Display for RefinementStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Correction => "correction",
            Self::Clarification => "clarification",
            Self::Decomposition => "decomposition",
            Self::Simplification => "simplification",
            Self::Expansion => "expansion",
            Self::Contextualization => "contextualization",
        };
        write!(f, "{s}")
    }
}

/// Result of the evaluation phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CragEvaluation {
    pub query_id: Uuid,
    pub original_query: String,
    /// Evaluation confidence in [0, 1]
    pub confidence: f64,
    pub confidence_level: ConfidenceLevel,
    pub should_refine: bool,
    pub should_use_multi_hop: bool,
    pub reasoning_type: ReasoningType,
    pub issues: Vec<QueryIssue>,
    /// Refinement strategies worth trying, by detected issue
    pub recommendations: Vec<RefinementStrategy>,
    pub reasoning: String,
}

/// One applied refinement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refinement {
    pub original: String,
    pub refined: String,
    pub strategy: RefinementStrategy,
    /// Sub-queries produced by decomposition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_queries: Option<Vec<String>>,
    /// Context text folded in by contextualization
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added_context: Option<String>,
    /// Refiner's confidence that the rewrite helps
    pub confidence: f64,
    pub reasoning: String,
}

/// One multi-hop reasoning step. Steps are strictly sequential; step N+1
/// starts only after step N terminated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    /// 1-based step number
    pub step_number: u32,
    pub query: String,
    pub retrieved_docs: Vec<RetrievedChunk>,
    pub intermediate_answer: String,
    /// clamp(mean(doc score) * 1.2, 0, 1)
    pub confidence: f64,
    pub reasoning: String,
}
