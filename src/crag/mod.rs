//! Corrective retrieval-augmented generation.
//!
//! Evaluate the query, refine it when the surface form is weak, chain
//! retrieval steps for multi-hop questions, synthesize through the
//! cascading executor, and score the result for grounding.

pub mod coordinator;
pub mod evaluator;
pub mod multihop;
pub mod refiner;
pub mod types;

pub use coordinator::CragCoordinator;
pub use evaluator::QueryEvaluator;
pub use multihop::{MultiHopOutcome, MultiHopReasoner};
pub use refiner::QueryRefiner;
pub use types::{
    ConfidenceLevel, CragEvaluation, IssueSeverity, IssueType, QueryIssue, ReasoningStep,
    ReasoningType, Refinement, RefinementStrategy,
};
