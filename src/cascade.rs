//! Cascading execution with fallback, escalation, and stream gating.
//!
//! Walks a routing decision's candidate list: primary first, then the
//! fallback chain. Transient failures advance the cascade after an
//! exponential backoff; confidence-driven escalation skips forward to a
//! higher tier. Streamed output commits to a single backend on the first
//! delivered chunk, so a consumer never observes interleaved output from
//! two backends.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::OrchestratorConfig;
use crate::confidence::{ConfidenceEvaluator, ConfidenceMetrics};
use crate::error::{Error, Result};
use crate::llm::gateway::CompletionGateway;
use crate::llm::router::RoutingDecision;
use crate::llm::stream::{CompletionStream, StreamEvent, StreamSender};
use crate::llm::types::{BackendId, CompletionRequest, CompletionResult, ModelConfig};

/// Initial backoff before the first fallback transition.
const INITIAL_BACKOFF_MS: u64 = 250;
/// Backoff ceiling.
const BACKOFF_CAP_MS: u64 = 4_000;
/// Jitter applied to every backoff delay, +/- this fraction.
const BACKOFF_JITTER: f64 = 0.25;

/// Backoff for the given transition count, honoring a backend's
/// retry-after recommendation when it is longer.
fn backoff_delay(transitions: u32, retry_after_ms: Option<u64>) -> Duration {
    let exp = INITIAL_BACKOFF_MS.saturating_mul(1u64 << transitions.min(8));
    let base = exp.min(BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(-BACKOFF_JITTER..=BACKOFF_JITTER);
    let jittered = (base as f64 * (1.0 + jitter)).max(0.0) as u64;
    Duration::from_millis(jittered.max(retry_after_ms.unwrap_or(0)))
}

/// Per-request cascade state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CascadeState {
    TryingPrimary,
    TryingFallback(usize),
}

impl CascadeState {
    fn candidate_index(self) -> usize {
        match self {
            Self::TryingPrimary => 0,
            Self::TryingFallback(i) => i,
        }
    }

    fn at(index: usize) -> Self {
        if index == 0 {
            Self::TryingPrimary
        } else {
            Self::TryingFallback(index)
        }
    }
}

/// Executor over a completion gateway.
pub struct CascadingExecutor<G> {
    gateway: Arc<G>,
    config: Arc<OrchestratorConfig>,
    evaluator: ConfidenceEvaluator,
}

impl<G: CompletionGateway + 'static> CascadingExecutor<G> {
    pub fn new(gateway: Arc<G>, config: Arc<OrchestratorConfig>) -> Self {
        let evaluator = ConfidenceEvaluator::new(config.confidence_threshold);
        Self {
            gateway,
            config,
            evaluator,
        }
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    /// Candidate list the cascade walks: primary, then the fallback chain
    /// unless fallback is disabled.
    fn candidates(&self, decision: &RoutingDecision) -> Vec<ModelConfig> {
        let mut candidates = vec![decision.model.clone()];
        if self.config.enable_fallback {
            candidates.extend(decision.fallback_chain.iter().cloned());
        }
        candidates
    }

    /// First candidate after `index` with a strictly higher tier.
    fn escalation_target(candidates: &[ModelConfig], index: usize) -> Option<usize> {
        let current = candidates[index].tier;
        candidates
            .iter()
            .enumerate()
            .skip(index + 1)
            .find(|(_, m)| m.tier > current)
            .map(|(i, _)| i)
    }

    fn annotate(result: &mut CompletionResult, metrics: &ConfidenceMetrics, attempts: u32) {
        result.annotate("confidence", metrics.score);
        result.annotate("attempts", attempts);
    }

    /// Accept a result: append a disclaimer when confidence stayed low and
    /// no further escalation will happen.
    fn accept(
        &self,
        mut result: CompletionResult,
        metrics: ConfidenceMetrics,
        attempts: u32,
    ) -> CompletionResult {
        Self::annotate(&mut result, &metrics, attempts);
        if metrics.score < self.config.high_confidence_threshold {
            result.content = self.evaluator.apply_disclaimer(
                &result.content,
                metrics.score,
                self.config.high_confidence_threshold,
            );
            result.annotate("low_confidence", true);
        }
        result
    }

    /// Execute the decision, returning the full completion.
    pub async fn execute(
        &self,
        decision: &RoutingDecision,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResult> {
        let candidates = self.candidates(decision);
        let deadline = Instant::now() + self.config.request_timeout();

        let mut state = CascadeState::TryingPrimary;
        let mut transitions: u32 = 0;
        let mut attempts: u32 = 0;
        let mut disabled: Vec<BackendId> = Vec::new();
        let mut held: Option<(CompletionResult, ConfidenceMetrics)> = None;
        let mut last_error: Option<Error> = None;

        loop {
            let index = state.candidate_index();
            let Some(candidate) = candidates.get(index) else {
                break;
            };

            if disabled.contains(&candidate.backend_id) {
                state = CascadeState::at(index + 1);
                continue;
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // Deadlines always surface, even over a held result.
                return Err(Error::DeadlineExceeded {
                    elapsed_ms: self.config.request_timeout_ms,
                });
            }
            let attempt_budget = remaining.min(self.config.attempt_timeout());

            attempts += 1;
            debug!(
                model = %candidate.model_id,
                state = ?state,
                attempt = attempts,
                "cascade attempt"
            );

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                attempt = timeout(
                    attempt_budget,
                    self.gateway.complete(&candidate.model_id, request),
                ) => match attempt {
                    Ok(result) => result,
                    Err(_) if Instant::now() >= deadline => {
                        return Err(Error::DeadlineExceeded {
                            elapsed_ms: self.config.request_timeout_ms,
                        });
                    }
                    Err(_) => Err(Error::backend_unavailable(
                        candidate.backend_id.to_string(),
                        format!("attempt timed out after {}ms", attempt_budget.as_millis()),
                    )),
                },
            };

            match outcome {
                Ok(result) => {
                    let metrics = self.evaluator.evaluate(&result.content, candidate.tier);

                    if metrics.requires_escalation && transitions < self.config.max_retries {
                        if let Some(target) = Self::escalation_target(&candidates, index) {
                            debug!(
                                from = %candidate.model_id,
                                to = %candidates[target].model_id,
                                confidence = metrics.score,
                                "confidence escalation"
                            );
                            held = Some((result, metrics));
                            transitions += 1;
                            state = CascadeState::at(target);
                            continue;
                        }
                    }

                    return Ok(self.accept(result, metrics, attempts));
                }
                Err(err) if err.is_terminal() => return Err(err),
                Err(Error::QuotaExhausted { backend }) => {
                    warn!(%backend, "backend quota exhausted, disabling for this request");
                    disabled.push(candidate.backend_id);
                    last_error = Some(Error::QuotaExhausted { backend });
                    transitions += 1;
                    if transitions > self.config.max_retries || !self.config.enable_fallback {
                        break;
                    }
                    state = CascadeState::at(index + 1);
                }
                Err(err) => {
                    let retry_after = match &err {
                        Error::RateLimited { retry_after_ms, .. } => *retry_after_ms,
                        _ => None,
                    };
                    warn!(
                        model = %candidate.model_id,
                        error = %err,
                        "attempt failed"
                    );
                    last_error = Some(err);
                    transitions += 1;
                    if transitions > self.config.max_retries || !self.config.enable_fallback {
                        break;
                    }

                    let delay = backoff_delay(transitions - 1, retry_after);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    state = CascadeState::at(index + 1);
                }
            }
        }

        // Cascade exhausted: a held low-confidence success beats an error.
        if let Some((result, metrics)) = held {
            return Ok(self.accept(result, metrics, attempts));
        }
        Err(Error::SynthesisFailed {
            attempts,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no candidates available".to_string()),
        })
    }

    /// Execute the decision as a stream.
    ///
    /// The attempt commits on its first delivered chunk: failures before
    /// commit advance the cascade with nothing delivered; failures after
    /// commit surface without retry, so chunks from two backends never
    /// interleave.
    pub fn execute_stream(
        &self,
        decision: RoutingDecision,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> CompletionStream {
        let (tx, stream) = CompletionStream::channel();
        let gateway = Arc::clone(&self.gateway);
        let config = Arc::clone(&self.config);
        let evaluator = self.evaluator;
        let candidates = self.candidates(&decision);

        tokio::spawn(async move {
            let outcome = run_stream_cascade(
                gateway,
                config,
                evaluator,
                candidates,
                request,
                cancel,
                tx.clone(),
            )
            .await;
            if let Err(err) = outcome {
                // Best effort: the consumer may already be gone.
                let _ = tx.send(Err(err)).await;
            }
        });

        stream
    }
}

/// Drive the streaming cascade, sending events through `tx`.
async fn run_stream_cascade<G: CompletionGateway>(
    gateway: Arc<G>,
    config: Arc<OrchestratorConfig>,
    evaluator: ConfidenceEvaluator,
    candidates: Vec<ModelConfig>,
    request: CompletionRequest,
    cancel: CancellationToken,
    tx: StreamSender,
) -> Result<()> {
    use futures::StreamExt;

    let deadline = Instant::now() + config.request_timeout();
    let mut transitions: u32 = 0;
    let mut disabled: Vec<BackendId> = Vec::new();
    let mut last_error: Option<Error> = None;
    let mut index = 0usize;

    'cascade: while let Some(candidate) = candidates.get(index) {
        if disabled.contains(&candidate.backend_id) {
            index += 1;
            continue;
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let attempt_started = Instant::now();
        let attempt_deadline =
            (attempt_started + config.attempt_timeout()).min(deadline);

        let remaining = attempt_deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::DeadlineExceeded {
                elapsed_ms: config.request_timeout_ms,
            });
        }

        let setup = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            setup = timeout(
                remaining,
                gateway.stream_complete(&candidate.model_id, &request),
            ) => match setup {
                Ok(result) => result,
                Err(_) => Err(Error::backend_unavailable(
                    candidate.backend_id.to_string(),
                    "stream setup timed out",
                )),
            },
        };

        let mut events = match setup {
            Ok(events) => events,
            Err(err) => {
                match advance_cascade(&config, &mut transitions, &mut disabled, candidate, err)? {
                    Advance::Next => {
                        let delay = backoff_delay(transitions.saturating_sub(1), None);
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(Error::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        index += 1;
                        continue 'cascade;
                    }
                    Advance::NextNoDelay => {
                        index += 1;
                        continue 'cascade;
                    }
                    Advance::Exhausted(err) => {
                        last_error = Some(err);
                        break 'cascade;
                    }
                }
            }
        };

        let mut committed = false;
        loop {
            let budget = attempt_deadline.saturating_duration_since(Instant::now());
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                event = timeout(budget, events.next()) => match event {
                    Ok(event) => event,
                    Err(_) => Some(Err(Error::backend_unavailable(
                        candidate.backend_id.to_string(),
                        "stream stalled past the attempt timeout",
                    ))),
                },
            };

            match event {
                Some(Ok(StreamEvent::Chunk(chunk))) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        sent = tx.send(Ok(StreamEvent::Chunk(chunk))) => {
                            if sent.is_err() {
                                // Consumer dropped the stream.
                                return Ok(());
                            }
                        }
                    }
                    committed = true;
                }
                Some(Ok(StreamEvent::Done(mut result))) => {
                    let metrics = evaluator.evaluate(&result.content, candidate.tier);
                    result.annotate("confidence", metrics.score);
                    if metrics.score < config.high_confidence_threshold {
                        // Chunks are already delivered, so escalation is
                        // off the table; disclose instead.
                        let disclosed = evaluator.apply_disclaimer(
                            &result.content,
                            metrics.score,
                            config.high_confidence_threshold,
                        );
                        let suffix = disclosed[result.content.len()..].to_string();
                        if !suffix.is_empty() {
                            if tx.send(Ok(StreamEvent::Chunk(suffix))).await.is_err() {
                                return Ok(());
                            }
                            result.content = disclosed;
                            result.annotate("low_confidence", true);
                        }
                    }
                    let _ = tx.send(Ok(StreamEvent::Done(result))).await;
                    return Ok(());
                }
                other => {
                    let err = match other {
                        Some(Err(err)) => err,
                        _ => Error::backend_unavailable(
                            candidate.backend_id.to_string(),
                            "stream ended without a terminal result",
                        ),
                    };

                    // A committed attempt surfaces its failure as-is; the
                    // consumer already saw this backend's chunks.
                    if committed {
                        return Err(err);
                    }

                    match advance_cascade(
                        &config,
                        &mut transitions,
                        &mut disabled,
                        candidate,
                        err,
                    )? {
                        Advance::Next => {
                            let delay = backoff_delay(transitions.saturating_sub(1), None);
                            tokio::select! {
                                biased;
                                _ = cancel.cancelled() => return Err(Error::Cancelled),
                                _ = tokio::time::sleep(delay) => {}
                            }
                            index += 1;
                            continue 'cascade;
                        }
                        Advance::NextNoDelay => {
                            index += 1;
                            continue 'cascade;
                        }
                        Advance::Exhausted(err) => {
                            last_error = Some(err);
                            break 'cascade;
                        }
                    }
                }
            }
        }
    }

    Err(Error::SynthesisFailed {
        attempts: transitions + 1,
        last_error: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no candidates available".to_string()),
    })
}

/// What the streaming cascade does after a pre-commit failure.
enum Advance {
    /// Back off, then try the next candidate.
    Next,
    /// Try the next candidate immediately (quota-disabled backend).
    NextNoDelay,
    /// No candidates or retries left.
    Exhausted(Error),
}

fn advance_cascade(
    config: &OrchestratorConfig,
    transitions: &mut u32,
    disabled: &mut Vec<BackendId>,
    candidate: &ModelConfig,
    err: Error,
) -> Result<Advance> {
    if err.is_terminal() {
        return Err(err);
    }

    *transitions += 1;
    let exhausted = *transitions > config.max_retries || !config.enable_fallback;

    match err {
        Error::QuotaExhausted { backend } => {
            warn!(%backend, "backend quota exhausted, disabling for this request");
            disabled.push(candidate.backend_id);
            if exhausted {
                Ok(Advance::Exhausted(Error::QuotaExhausted { backend }))
            } else {
                Ok(Advance::NextNoDelay)
            }
        }
        err => {
            warn!(model = %candidate.model_id, error = %err, "stream attempt failed");
            if exhausted {
                Ok(Advance::Exhausted(err))
            } else {
                Ok(Advance::Next)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::router::ModelRouter;
    use crate::llm::types::{ChatMessage, FinishReason, ModelRegistry, QueryHints, TokenUsage};
    use crate::complexity::{ComplexityFactors, ComplexityLevel, ComplexityScore};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const CONFIDENT: &str = "The answer is exactly 42, verified against the documentation [1]. \
                             Specifically, the documented limit is 30 seconds.";
    const HEDGED: &str = "I think it might possibly be 42, but I'm not sure. It seems \
                          like it could be something else, maybe. Perhaps check the stuff \
                          in the configuration, as far as I know.";

    /// One scripted behavior per gateway call, consumed in order per model.
    enum Script {
        Reply(&'static str),
        ReplyChunks(Vec<&'static str>),
        Fail(fn() -> Error),
        Hang,
    }

    struct MockGateway {
        scripts: Mutex<HashMap<String, Vec<Script>>>,
        calls: Mutex<Vec<String>>,
    }

    impl MockGateway {
        fn new() -> Self {
            Self {
                scripts: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn script(self, model_id: &str, script: Script) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .entry(model_id.to_string())
                .or_default()
                .push(script);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn next_script(&self, model_id: &str) -> Script {
            self.calls.lock().unwrap().push(model_id.to_string());
            let mut scripts = self.scripts.lock().unwrap();
            let queue = scripts.entry(model_id.to_string()).or_default();
            if queue.is_empty() {
                Script::Fail(|| Error::backend_unavailable("mock", "unscripted call"))
            } else {
                queue.remove(0)
            }
        }

        fn result_for(model_id: &str, content: &str) -> CompletionResult {
            CompletionResult {
                content: content.to_string(),
                backend_id: ModelRegistry::default_catalog()
                    .get(model_id)
                    .map(|m| m.backend_id)
                    .unwrap_or(crate::llm::types::BackendId::Anthropic),
                model_id: model_id.to_string(),
                finish_reason: FinishReason::Stop,
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 10,
                    ..Default::default()
                },
                cost: 0.0,
                metadata: HashMap::new(),
                timestamp: Utc::now(),
            }
        }
    }

    #[async_trait]
    impl CompletionGateway for MockGateway {
        async fn complete(
            &self,
            model_id: &str,
            _request: &CompletionRequest,
        ) -> Result<CompletionResult> {
            match self.next_script(model_id) {
                Script::Reply(content) => Ok(Self::result_for(model_id, content)),
                Script::ReplyChunks(chunks) => {
                    Ok(Self::result_for(model_id, &chunks.concat()))
                }
                Script::Fail(make) => Err(make()),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(Error::Internal("unreachable".to_string()))
                }
            }
        }

        async fn stream_complete(
            &self,
            model_id: &str,
            _request: &CompletionRequest,
        ) -> Result<crate::llm::gateway::GatewayStream> {
            match self.next_script(model_id) {
                Script::Reply(content) => {
                    let result = Self::result_for(model_id, content);
                    let chunk = content.to_string();
                    Ok(Box::pin(async_stream::try_stream! {
                        yield StreamEvent::Chunk(chunk);
                        yield StreamEvent::Done(Box::new(result));
                    }))
                }
                Script::ReplyChunks(chunks) => {
                    let result = Self::result_for(model_id, &chunks.concat());
                    let owned: Vec<String> =
                        chunks.into_iter().map(|c| c.to_string()).collect();
                    Ok(Box::pin(async_stream::try_stream! {
                        for chunk in owned {
                            yield StreamEvent::Chunk(chunk);
                        }
                        yield StreamEvent::Done(Box::new(result));
                    }))
                }
                Script::Fail(make) => Err(make()),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(Error::Internal("unreachable".to_string()))
                }
            }
        }
    }

    fn decision_for(level: ComplexityLevel, score: f64) -> RoutingDecision {
        let router = ModelRouter::new(Arc::new(ModelRegistry::default_catalog()));
        router.route(
            &ComplexityScore {
                level,
                score,
                factors: ComplexityFactors::default(),
                reasoning: String::new(),
            },
            &QueryHints::default(),
        )
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new("tenant-1").with_message(ChatMessage::user("hello"))
    }

    fn executor(gateway: MockGateway) -> CascadingExecutor<MockGateway> {
        CascadingExecutor::new(
            Arc::new(gateway),
            Arc::new(OrchestratorConfig::default()),
        )
    }

    fn executor_with(
        gateway: MockGateway,
        config: OrchestratorConfig,
    ) -> CascadingExecutor<MockGateway> {
        CascadingExecutor::new(Arc::new(gateway), Arc::new(config))
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_success() {
        let decision = decision_for(ComplexityLevel::Simple, 0.2);
        let primary = decision.model.model_id.clone();
        let exec = executor(MockGateway::new().script(&primary, Script::Reply(CONFIDENT)));

        let result = exec
            .execute(&decision, &request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.content, CONFIDENT);
        assert_eq!(result.model_id, primary);
        assert_eq!(exec.gateway().calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_primary_failure_advances_to_fallback() {
        let decision = decision_for(ComplexityLevel::Simple, 0.2);
        let primary = decision.model.model_id.clone();
        let fallback = decision.fallback_chain[0].model_id.clone();
        let exec = executor(
            MockGateway::new()
                .script(&primary, Script::Fail(|| {
                    Error::backend_unavailable("anthropic", "503")
                }))
                .script(&fallback, Script::Reply(CONFIDENT)),
        );

        let result = exec
            .execute(&decision, &request(), &CancellationToken::new())
            .await
            .unwrap();
        // The caller observes exactly the fallback's content.
        assert_eq!(result.content, CONFIDENT);
        assert_eq!(result.model_id, fallback);
        assert_eq!(exec.gateway().calls(), vec![primary, fallback]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_request_fails_immediately() {
        let decision = decision_for(ComplexityLevel::Simple, 0.2);
        let primary = decision.model.model_id.clone();
        let exec = executor(MockGateway::new().script(&primary, Script::Fail(|| {
            Error::invalid_request("bad schema")
        })));

        let err = exec
            .execute(&decision, &request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(exec.gateway().calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_exhaustion_disables_backend_for_request() {
        // Primary and first same-tier fallback are on different backends;
        // craft a chain where a same-backend candidate follows the failed one.
        let registry = ModelRegistry::default_catalog();
        let decision = RoutingDecision {
            model: registry.get("claude-3-5-haiku-20241022").unwrap().clone(),
            reasoning: String::new(),
            estimated_cost: 0.0,
            fallback_chain: vec![
                registry.get("claude-3-5-sonnet-20241022").unwrap().clone(),
                registry.get("gpt-4o-mini").unwrap().clone(),
            ],
        };
        let exec = executor(
            MockGateway::new()
                .script("claude-3-5-haiku-20241022", Script::Fail(|| {
                    Error::quota_exhausted("anthropic")
                }))
                .script("gpt-4o-mini", Script::Reply(CONFIDENT)),
        );

        let result = exec
            .execute(&decision, &request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.model_id, "gpt-4o-mini");
        // The same-backend sonnet candidate was skipped entirely.
        assert_eq!(
            exec.gateway().calls(),
            vec!["claude-3-5-haiku-20241022", "gpt-4o-mini"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cascade_exhaustion_returns_synthesis_failed() {
        let decision = decision_for(ComplexityLevel::Simple, 0.2);
        let mut gateway = MockGateway::new();
        for model in std::iter::once(&decision.model).chain(&decision.fallback_chain) {
            gateway = gateway.script(&model.model_id, Script::Fail(|| {
                Error::backend_unavailable("mock", "503")
            }));
        }
        let exec = executor(gateway);

        let err = exec
            .execute(&decision, &request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SynthesisFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_retries_bounds_transitions() {
        let decision = decision_for(ComplexityLevel::Simple, 0.2);
        let mut gateway = MockGateway::new();
        for model in std::iter::once(&decision.model).chain(&decision.fallback_chain) {
            gateway = gateway.script(&model.model_id, Script::Fail(|| {
                Error::backend_unavailable("mock", "503")
            }));
        }
        let config = OrchestratorConfig::default().with_max_retries(1);
        let exec = executor_with(gateway, config);

        let err = exec
            .execute(&decision, &request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SynthesisFailed { .. }));
        // Primary plus one retry transition.
        assert_eq!(exec.gateway().calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_disabled_fails_after_primary() {
        let decision = decision_for(ComplexityLevel::Simple, 0.2);
        let primary = decision.model.model_id.clone();
        let gateway = MockGateway::new().script(&primary, Script::Fail(|| {
            Error::backend_unavailable("mock", "503")
        }));
        let exec = executor_with(gateway, OrchestratorConfig::default().with_fallback(false));

        let err = exec
            .execute(&decision, &request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SynthesisFailed { .. }));
        assert_eq!(exec.gateway().calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_confidence_escalates_to_higher_tier() {
        let decision = decision_for(ComplexityLevel::Simple, 0.2);
        let primary = decision.model.model_id.clone();
        // First higher-tier candidate in the chain.
        let target = decision
            .fallback_chain
            .iter()
            .find(|m| m.tier > decision.model.tier)
            .unwrap()
            .model_id
            .clone();
        let exec = executor(
            MockGateway::new()
                .script(&primary, Script::Reply(HEDGED))
                .script(&target, Script::Reply(CONFIDENT)),
        );

        let result = exec
            .execute(&decision, &request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.model_id, target);
        assert_eq!(result.content, CONFIDENT);
        assert_eq!(exec.gateway().calls(), vec![primary, target]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalation_exhausted_returns_held_result_with_disclaimer() {
        let decision = decision_for(ComplexityLevel::Simple, 0.2);
        let primary = decision.model.model_id.clone();
        let mut gateway = MockGateway::new().script(&primary, Script::Reply(HEDGED));
        // Every escalation/fallback candidate fails.
        for model in &decision.fallback_chain {
            gateway = gateway.script(&model.model_id, Script::Fail(|| {
                Error::backend_unavailable("mock", "503")
            }));
        }
        let exec = executor(gateway);

        let result = exec
            .execute(&decision, &request(), &CancellationToken::new())
            .await
            .unwrap();
        // The hedged primary answer survives, with the disclaimer appended.
        assert!(result.content.starts_with(HEDGED));
        assert!(result.content.len() > HEDGED.len());
        assert_eq!(
            result.metadata.get("low_confidence"),
            Some(&serde_json::Value::Bool(true))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_powerful_tier_low_confidence_gets_disclaimer_without_escalation() {
        let decision = decision_for(ComplexityLevel::Complex, 0.7);
        let primary = decision.model.model_id.clone();
        let exec = executor(MockGateway::new().script(&primary, Script::Reply(HEDGED)));

        let result = exec
            .execute(&decision, &request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.model_id, primary);
        assert!(result.content.starts_with(HEDGED));
        assert!(result.content.contains("Note:"));
        assert_eq!(exec.gateway().calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_deadline_exceeded() {
        let decision = decision_for(ComplexityLevel::Simple, 0.2);
        let mut gateway = MockGateway::new();
        for model in std::iter::once(&decision.model).chain(&decision.fallback_chain) {
            gateway = gateway.script(&model.model_id, Script::Hang);
        }
        let exec = executor(gateway);

        let err = exec
            .execute(&decision, &request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_surfaces_over_held_low_confidence_result() {
        let decision = decision_for(ComplexityLevel::Simple, 0.2);
        let primary = decision.model.model_id.clone();
        // A hedged primary reply populates the held escalation result, then
        // every remaining candidate hangs until the request deadline fires.
        let mut gateway = MockGateway::new().script(&primary, Script::Reply(HEDGED));
        for model in &decision.fallback_chain {
            gateway = gateway.script(&model.model_id, Script::Hang);
        }
        let exec = executor(gateway);

        let err = exec
            .execute(&decision, &request(), &CancellationToken::new())
            .await
            .unwrap_err();
        // The held result does not soften the deadline.
        assert!(matches!(err, Error::DeadlineExceeded { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_advances_cascade() {
        let decision = decision_for(ComplexityLevel::Simple, 0.2);
        let primary = decision.model.model_id.clone();
        let fallback = decision.fallback_chain[0].model_id.clone();
        let config = OrchestratorConfig::default()
            .with_attempt_timeout(Duration::from_secs(1))
            .with_request_timeout(Duration::from_secs(60));
        let exec = executor_with(
            MockGateway::new()
                .script(&primary, Script::Hang)
                .script(&fallback, Script::Reply(CONFIDENT)),
            config,
        );

        let result = exec
            .execute(&decision, &request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.model_id, fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_surfaces_cancelled() {
        let decision = decision_for(ComplexityLevel::Simple, 0.2);
        let primary = decision.model.model_id.clone();
        let exec = executor(MockGateway::new().script(&primary, Script::Hang));
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let err = exec
            .execute(&decision, &request(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_chunks_concatenate_to_final_content() {
        use futures::StreamExt;

        let decision = decision_for(ComplexityLevel::Simple, 0.2);
        let primary = decision.model.model_id.clone();
        let exec = executor(MockGateway::new().script(
            &primary,
            Script::ReplyChunks(vec![
                "The answer is exactly 42, ",
                "verified against the documentation [1]. ",
                "Specifically, the documented limit is 30 seconds.",
            ]),
        ));

        let mut stream =
            exec.execute_stream(decision, request(), CancellationToken::new());
        let mut chunks = String::new();
        let mut done = None;
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                StreamEvent::Chunk(c) => chunks.push_str(&c),
                StreamEvent::Done(result) => done = Some(result),
            }
        }
        let done = done.expect("terminal result");
        assert_eq!(chunks, done.content);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_fallback_delivers_only_fallback_chunks() {
        let decision = decision_for(ComplexityLevel::Simple, 0.2);
        let primary = decision.model.model_id.clone();
        let fallback = decision.fallback_chain[0].model_id.clone();
        let exec = executor(
            MockGateway::new()
                .script(&primary, Script::Fail(|| {
                    Error::backend_unavailable("anthropic", "503")
                }))
                .script(
                    &fallback,
                    Script::ReplyChunks(vec![
                        "The answer is exactly 42, verified [1]. ",
                        "Specifically, the documented limit is 30 seconds.",
                    ]),
                ),
        );

        let stream = exec.execute_stream(decision, request(), CancellationToken::new());
        let result = stream.collect().await.unwrap();
        assert_eq!(result.model_id, fallback);
        assert!(result.content.starts_with("The answer is exactly 42"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_low_confidence_disclaimer_is_chunked() {
        use futures::StreamExt;

        let decision = decision_for(ComplexityLevel::Complex, 0.7);
        let primary = decision.model.model_id.clone();
        let exec = executor(
            MockGateway::new().script(&primary, Script::ReplyChunks(vec![HEDGED])),
        );

        let mut stream =
            exec.execute_stream(decision, request(), CancellationToken::new());
        let mut chunks = String::new();
        let mut done = None;
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                StreamEvent::Chunk(c) => chunks.push_str(&c),
                StreamEvent::Done(result) => done = Some(result),
            }
        }
        let done = done.unwrap();
        // Disclaimer arrives as its own chunk; concatenation still matches.
        assert_eq!(chunks, done.content);
        assert!(done.content.contains("Note:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_cancellation_terminates_after_buffered_chunk() {
        use futures::StreamExt;

        let decision = decision_for(ComplexityLevel::Simple, 0.2);
        let primary = decision.model.model_id.clone();
        let exec = executor(MockGateway::new().script(
            &primary,
            Script::ReplyChunks(vec!["one ", "two ", "three ", "four "]),
        ));
        let cancel = CancellationToken::new();

        let mut stream = exec.execute_stream(decision, request(), cancel.clone());
        // Take one chunk, then cancel.
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, StreamEvent::Chunk(_)));
        cancel.cancel();

        let mut extra_chunks = 0;
        while let Some(event) = stream.next().await {
            match event {
                Ok(StreamEvent::Chunk(_)) => extra_chunks += 1,
                Ok(StreamEvent::Done(_)) => panic!("stream completed after cancel"),
                Err(Error::Cancelled) => break,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        // At most the one already-buffered chunk leaks out.
        assert!(extra_chunks <= 1, "saw {extra_chunks} chunks after cancel");
    }

    #[test]
    fn test_backoff_delay_bounds() {
        for transitions in 0..10 {
            let delay = backoff_delay(transitions, None).as_millis() as u64;
            // Cap plus max jitter.
            assert!(delay <= 5_000, "delay {delay} at {transitions}");
        }
        // First transition stays near the initial delay.
        let first = backoff_delay(0, None).as_millis() as u64;
        assert!((187..=313).contains(&first), "first delay {first}");

        // A retry-after hint extends the delay.
        let hinted = backoff_delay(0, Some(2_000)).as_millis() as u64;
        assert!(hinted >= 2_000);
    }

    #[test]
    fn test_cascade_state_indexing() {
        assert_eq!(CascadeState::TryingPrimary.candidate_index(), 0);
        assert_eq!(CascadeState::TryingFallback(2).candidate_index(), 2);
        assert_eq!(CascadeState::at(0), CascadeState::TryingPrimary);
        assert_eq!(CascadeState::at(3), CascadeState::TryingFallback(3));
    }
}
