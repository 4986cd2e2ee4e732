//! Multi-hop reasoning: chained retrieve-and-synthesize steps.
//!
//! Steps run strictly in sequence; each retrieves against its own
//! sub-query, synthesizes an intermediate answer with everything learned
//! so far, and feeds the accumulated knowledge forward.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cascade::CascadingExecutor;
use crate::config::OrchestratorConfig;
use crate::confidence::ConfidenceEvaluator;
use crate::crag::refiner::QueryRefiner;
use crate::crag::types::{CragEvaluation, ReasoningStep, ReasoningType, RefinementStrategy};
use crate::error::{Error, Result};
use crate::llm::gateway::CompletionGateway;
use crate::llm::router::RoutingDecision;
use crate::llm::types::{ChatMessage, CompletionRequest, Query};
use crate::retrieval::{RetrievedChunk, RetrieverAdapter};

/// Multiplier from mean chunk relevance to step confidence.
const STEP_CONFIDENCE_FACTOR: f64 = 1.2;

/// What a multi-hop run produced.
#[derive(Debug, Clone)]
pub struct MultiHopOutcome {
    pub steps: Vec<ReasoningStep>,
    /// Knowledge accumulated across steps, used as synthesis context
    pub accumulated_context: String,
    /// Every chunk retrieved across all steps
    pub chunks: Vec<RetrievedChunk>,
}

/// Sequential retrieve-and-synthesize reasoner.
pub struct MultiHopReasoner<G> {
    executor: Arc<CascadingExecutor<G>>,
    retriever: Arc<RetrieverAdapter>,
    config: Arc<OrchestratorConfig>,
    evaluator: ConfidenceEvaluator,
}

impl<G: CompletionGateway + 'static> MultiHopReasoner<G> {
    pub fn new(
        executor: Arc<CascadingExecutor<G>>,
        retriever: Arc<RetrieverAdapter>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        let evaluator = ConfidenceEvaluator::new(config.confidence_threshold);
        Self {
            executor,
            retriever,
            config,
            evaluator,
        }
    }

    /// Derive the per-step queries: decomposition sub-queries when the
    /// query splits, the query itself otherwise.
    fn step_queries(&self, query_text: &str) -> Vec<String> {
        let decomposition =
            QueryRefiner::new().apply(RefinementStrategy::Decomposition, query_text, &[]);
        let mut queries = decomposition
            .sub_queries
            .unwrap_or_else(|| vec![query_text.to_string()]);
        queries.truncate(self.config.max_reasoning_steps as usize);
        queries
    }

    /// Run the reasoning loop. Errors propagate so the coordinator can
    /// degrade to single-shot retrieval.
    pub async fn run(
        &self,
        query: &Query,
        working_query: &str,
        decision: &RoutingDecision,
        evaluation: &CragEvaluation,
        cancel: &CancellationToken,
    ) -> Result<MultiHopOutcome> {
        let step_queries = self.step_queries(working_query);
        let mut steps: Vec<ReasoningStep> = Vec::new();
        let mut chunks: Vec<RetrievedChunk> = Vec::new();
        let mut knowledge = String::new();

        for (i, step_query) in step_queries.iter().enumerate() {
            let step_number = (i + 1) as u32;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let retrieval = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                retrieval = self.retriever.retrieve(
                    &query.tenant_id,
                    step_query,
                    self.config.retrieval_top_k,
                ) => retrieval?,
            };

            let step_confidence =
                (retrieval.mean_score() * STEP_CONFIDENCE_FACTOR).clamp(0.0, 1.0);

            let mut system = String::from(
                "Answer the question using only the provided context. \
                 Cite the context you rely on.",
            );
            if !knowledge.is_empty() {
                system.push_str("\n\nEstablished so far:\n");
                system.push_str(&knowledge);
            }
            if !retrieval.context_string.is_empty() {
                system.push_str("\n\nContext:\n");
                system.push_str(&retrieval.context_string);
            }

            let request = CompletionRequest::new(&query.tenant_id)
                .with_system(system)
                .with_message(ChatMessage::user(step_query.clone()))
                .with_caching(self.config.enable_caching);

            let result = self.executor.execute(decision, &request, cancel).await?;
            let answer_confidence = self
                .evaluator
                .evaluate(&result.content, decision.model.tier)
                .score;

            debug!(
                step = step_number,
                query = %step_query,
                chunks = retrieval.chunks.len(),
                confidence = step_confidence,
                "reasoning step complete"
            );

            knowledge.push_str(&format!(
                "Step {step_number}: {step_query}\n{}\n\n",
                result.content
            ));
            let mean_score = retrieval.mean_score();
            let chunk_count = retrieval.chunks.len();
            chunks.extend(retrieval.chunks.iter().cloned());
            steps.push(ReasoningStep {
                step_number,
                query: step_query.clone(),
                retrieved_docs: retrieval.chunks,
                intermediate_answer: result.content,
                confidence: step_confidence,
                reasoning: format!(
                    "retrieved {chunk_count} chunk(s), mean relevance {mean_score:.2}"
                ),
            });

            if evaluation.reasoning_type == ReasoningType::SingleHop {
                break;
            }
            if answer_confidence >= self.config.high_confidence_threshold {
                debug!(step = step_number, "answer judged complete, terminating early");
                break;
            }
        }

        Ok(MultiHopOutcome {
            steps,
            accumulated_context: knowledge,
            chunks,
        })
    }
}
