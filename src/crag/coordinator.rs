//! The corrective-RAG pipeline: evaluate, refine, reason, synthesize,
//! quality-check.
//!
//! Pre-synthesis phases degrade silently: a failed retrieval or reasoning
//! run is logged and the pipeline continues with what it has. Only
//! synthesis failures, cancellation, and deadlines surface to the caller.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cascade::CascadingExecutor;
use crate::config::OrchestratorConfig;
use crate::crag::evaluator::QueryEvaluator;
use crate::crag::multihop::{MultiHopOutcome, MultiHopReasoner};
use crate::crag::refiner::QueryRefiner;
use crate::crag::types::{CragEvaluation, Refinement};
use crate::error::{Error, Result};
use crate::llm::gateway::CompletionGateway;
use crate::llm::router::RoutingDecision;
use crate::llm::stream::{CompletionStream, StreamEvent};
use crate::llm::types::{ChatMessage, CompletionRequest, CompletionResult, Query};
use crate::quality::QualityChecker;
use crate::retrieval::{RetrievalResult, RetrieverAdapter};

/// Synthesis instruction prefixed to retrieved context.
const SYNTHESIS_PROMPT: &str = "Use the context below to answer the user's question. \
     Cite the context you rely on (for example \"according to\" or [n] markers). \
     If the context does not cover the question, say so.";

/// What the pre-synthesis phases produced.
struct PipelineState {
    evaluation: CragEvaluation,
    working_text: String,
    refinements: Vec<Refinement>,
    multihop: Option<MultiHopOutcome>,
    retrieval: RetrievalResult,
}

impl PipelineState {
    fn context(&self) -> &str {
        match &self.multihop {
            Some(outcome) => &outcome.accumulated_context,
            None => &self.retrieval.context_string,
        }
    }

    fn chunk_texts(&self) -> Vec<String> {
        match &self.multihop {
            Some(outcome) => outcome.chunks.iter().map(|c| c.content.clone()).collect(),
            None => self.retrieval.chunk_texts(),
        }
    }
}

/// Coordinator over the executor, retriever, and quality checker.
pub struct CragCoordinator<G> {
    executor: Arc<CascadingExecutor<G>>,
    retriever: Option<Arc<RetrieverAdapter>>,
    quality: QualityChecker,
    config: Arc<OrchestratorConfig>,
    evaluator: QueryEvaluator,
    refiner: QueryRefiner,
}

impl<G: CompletionGateway + 'static> CragCoordinator<G> {
    pub fn new(
        executor: Arc<CascadingExecutor<G>>,
        retriever: Option<Arc<RetrieverAdapter>>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        let quality = QualityChecker::new(
            config.hallucination_threshold,
            config.confidence_threshold,
            config.require_citations,
            config.minimum_citations,
        );
        Self {
            executor,
            retriever,
            quality,
            config,
            evaluator: QueryEvaluator::new(),
            refiner: QueryRefiner::new(),
        }
    }

    /// Replace the default quality checker (e.g., to install an external
    /// fact-check adapter).
    pub fn with_quality_checker(mut self, quality: QualityChecker) -> Self {
        self.quality = quality;
        self
    }

    /// In-place variant of [`Self::with_quality_checker`].
    pub fn set_quality_checker(&mut self, quality: QualityChecker) {
        self.quality = quality;
    }

    /// Run every pre-synthesis phase.
    async fn prepare(
        &self,
        query: &Query,
        decision: &RoutingDecision,
        cancel: &CancellationToken,
    ) -> Result<PipelineState> {
        let evaluation = self.evaluator.evaluate(query);

        // Refinement loop: stop once confidence recovers or the budget
        // runs out.
        let mut working = query.clone();
        let mut refinements = Vec::new();
        if evaluation.should_refine {
            let mut current = evaluation.clone();
            for _ in 0..self.config.max_refinement_attempts {
                let Some(refinement) = self.refiner.refine(&working, &current) else {
                    break;
                };
                if refinement.refined == working.text {
                    break;
                }
                working.text = refinement.refined.clone();
                let reevaluation = self.evaluator.evaluate(&working);
                let improved = reevaluation.confidence > current.confidence;
                let recovered =
                    reevaluation.confidence >= self.config.medium_confidence_threshold;
                refinements.push(refinement);
                current = reevaluation;
                if improved || recovered {
                    break;
                }
            }
        }

        // Multi-hop reasoning, degrading to single retrieval on failure.
        let mut multihop = None;
        if evaluation.should_use_multi_hop
            && evaluation.confidence >= self.config.multi_hop_confidence_threshold
        {
            if let Some(retriever) = &self.retriever {
                let reasoner = MultiHopReasoner::new(
                    Arc::clone(&self.executor),
                    Arc::clone(retriever),
                    Arc::clone(&self.config),
                );
                match reasoner
                    .run(query, &working.text, decision, &evaluation, cancel)
                    .await
                {
                    Ok(outcome) if !outcome.steps.is_empty() => multihop = Some(outcome),
                    Ok(_) => {}
                    Err(err) if err.is_terminal() => return Err(err),
                    Err(err) => {
                        warn!(error = %err, "multi-hop reasoning failed, using single retrieval");
                    }
                }
            }
        }

        // Single retrieval when multi-hop did not run.
        let mut retrieval = RetrievalResult::empty();
        if multihop.is_none() {
            if let Some(retriever) = &self.retriever {
                let attempt = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    attempt = retriever.retrieve(
                        &query.tenant_id,
                        &working.text,
                        self.config.retrieval_top_k,
                    ) => attempt,
                };
                match attempt {
                    Ok(result) => retrieval = result,
                    Err(err) if err.is_terminal() => return Err(err),
                    Err(err) => {
                        warn!(error = %err, "retrieval failed, synthesizing without context");
                    }
                }
            }
        }

        Ok(PipelineState {
            evaluation,
            working_text: working.text,
            refinements,
            multihop,
            retrieval,
        })
    }

    /// Build the synthesis request from the pipeline state.
    fn synthesis_request(&self, query: &Query, state: &PipelineState) -> CompletionRequest {
        let mut request = CompletionRequest::new(&query.tenant_id)
            .with_messages(query.history.clone())
            .with_caching(self.config.enable_caching);
        let context = state.context();
        if !context.is_empty() {
            request = request.with_system(format!("{SYNTHESIS_PROMPT}\n\n{context}"));
        }
        request.with_message(ChatMessage::user(state.working_text.clone()))
    }

    /// Annotate the result with pipeline observability data and the
    /// quality verdict.
    fn annotate(&self, result: &mut CompletionResult, query: &Query, state: &PipelineState) {
        result.annotate("crag_confidence", state.evaluation.confidence);
        if let Ok(value) = serde_json::to_value(state.evaluation.reasoning_type) {
            result.annotate("reasoning_type", value);
        }
        if let Some(refinement) = state.refinements.last() {
            if let Ok(value) = serde_json::to_value(refinement) {
                result.annotate("query_refinement", value);
            }
        }
        if let Some(outcome) = &state.multihop {
            result.annotate("multi_hop_steps", outcome.steps.len() as u64);
        }

        let report = self.quality.check(
            &result.content,
            &query.text,
            &query.history,
            &state.chunk_texts(),
        );
        result.annotate("quality_confidence", report.confidence);
        if let Ok(value) = serde_json::to_value(report.recommendation) {
            result.annotate("quality_recommendation", value);
        }
        if report.is_hallucination && self.config.auto_flag_low_confidence {
            result.annotate("flagged_for_review", true);
        }
    }

    /// Run the pipeline and return the completed response.
    pub async fn run(
        &self,
        query: &Query,
        decision: &RoutingDecision,
        cancel: &CancellationToken,
    ) -> Result<CompletionResult> {
        let state = self.prepare(query, decision, cancel).await?;
        let request = self.synthesis_request(query, &state);
        let mut result = self.executor.execute(decision, &request, cancel).await?;
        self.annotate(&mut result, query, &state);
        Ok(result)
    }

    /// Run the pipeline, streaming the synthesis.
    ///
    /// Pre-synthesis phases run before the first chunk; the quality
    /// verdict is attached to the terminal result.
    pub fn run_stream(
        self: Arc<Self>,
        query: Query,
        decision: RoutingDecision,
        cancel: CancellationToken,
    ) -> CompletionStream {
        use futures::StreamExt;

        let (tx, stream) = CompletionStream::channel();
        let coordinator = self;

        tokio::spawn(async move {
            let state = match coordinator.prepare(&query, &decision, &cancel).await {
                Ok(state) => state,
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            };

            let request = coordinator.synthesis_request(&query, &state);
            let mut inner =
                coordinator
                    .executor
                    .execute_stream(decision, request, cancel.clone());

            while let Some(event) = inner.next().await {
                let event = match event {
                    Ok(StreamEvent::Done(mut result)) => {
                        coordinator.annotate(&mut result, &query, &state);
                        Ok(StreamEvent::Done(result))
                    }
                    other => other,
                };
                let terminal = matches!(&event, Ok(StreamEvent::Done(_)) | Err(_));
                if tx.send(event).await.is_err() {
                    return;
                }
                if terminal {
                    return;
                }
            }
        });

        stream
    }
}
