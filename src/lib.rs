//! # crag-core
//!
//! Corrective-RAG query orchestration: given a conversational query and a
//! tenant's knowledge corpus, produce a grounded response by classifying
//! query complexity, routing to a cost-appropriate model, retrieving
//! supporting passages, optionally refining the query and chaining
//! multi-hop reasoning, streaming the model's output, and scoring the
//! response for faithfulness before returning it.
//!
//! ## Core Components
//!
//! - **Complexity**: five-factor query scoring that drives routing
//! - **Router**: deterministic tier/model selection with fallback chains
//! - **Gateway**: one completion contract over three LLM backends
//! - **Cascade**: primary-to-fallback execution with confidence escalation
//! - **CRAG**: evaluate, refine, multi-hop, synthesize, quality-check
//! - **Stats**: per-tenant prompt-cache accounting
//!
//! ## Example
//!
//! ```rust,ignore
//! use crag_core::{Backend, ClientConfig, AnthropicBackend, Orchestrator, Query};
//!
//! let orchestrator = Orchestrator::builder()
//!     .backend(Backend::Anthropic(AnthropicBackend::new(
//!         ClientConfig::new(std::env::var("ANTHROPIC_API_KEY")?),
//!     )))
//!     .build();
//!
//! let query = Query::new("Why did the nightly ingest fail?", "tenant-42");
//! let decision = orchestrator.route(&query);
//! println!("routing to {}", decision.model.model_id);
//!
//! let response = orchestrator.complete(&query).await?;
//! println!("{} (${:.6})", response.content, response.cost);
//! ```

pub mod cascade;
pub mod complexity;
pub mod config;
pub mod confidence;
pub mod crag;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod quality;
pub mod retrieval;
pub mod stats;

// Re-exports for convenience
pub use cascade::CascadingExecutor;
pub use complexity::{
    requires_vision_model, ComplexityAnalyzer, ComplexityFactors, ComplexityLevel, ComplexityScore,
};
pub use config::OrchestratorConfig;
pub use confidence::{ConfidenceEvaluator, ConfidenceIndicators, ConfidenceMetrics};
pub use crag::{
    ConfidenceLevel, CragCoordinator, CragEvaluation, IssueSeverity, IssueType, QueryEvaluator,
    QueryIssue, QueryRefiner, ReasoningStep, ReasoningType, Refinement, RefinementStrategy,
};
pub use error::{Error, Result};
pub use llm::{
    AnthropicBackend, Backend, BackendClient, BackendId, Capability, ChatMessage, ChatRole,
    ClientConfig, CompletionGateway, CompletionRequest, CompletionResult, CompletionStream,
    FinishReason, GeminiBackend, ModelConfig, ModelRegistry, ModelRouter, ModelTier, OpenAiBackend,
    ProviderGateway, Query, QueryHints, RoutingDecision, StreamEvent, TokenUsage,
};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, SavingsEstimate};
pub use quality::{
    FactChecker, FixedFactChecker, QualityChecker, QualityRecommendation, QualityReport,
    RagasScorer, RagasScores,
};
pub use retrieval::{RetrievalResult, RetrievedChunk, Retriever, RetrieverAdapter};
pub use stats::{CacheStats, CacheStatsRegistry};
