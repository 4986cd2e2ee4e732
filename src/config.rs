//! Orchestrator configuration.
//!
//! Every knob the pipeline consults lives here with a documented default.
//! Absent keys in a deserialized config take the same defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the query orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Try fallback candidates after a primary failure (default: true).
    pub enable_fallback: bool,
    /// Emit a log record for every routing decision (default: false).
    pub log_routing: bool,
    /// Demote the routed tier by one step (default: false).
    pub prefer_cheaper_models: bool,
    /// Request prompt caching on backends that support it (default: true).
    pub enable_caching: bool,

    /// Below this post-hoc confidence the executor escalates (default: 0.7).
    pub confidence_threshold: f64,
    /// Below this weighted quality score a response is flagged as a
    /// hallucination (default: 0.6).
    pub hallucination_threshold: f64,
    /// High-confidence band floor (default: 0.8).
    pub high_confidence_threshold: f64,
    /// Medium-confidence band floor (default: 0.6).
    pub medium_confidence_threshold: f64,
    /// Low-confidence band floor (default: 0.4).
    pub low_confidence_threshold: f64,

    /// Maximum query refinement iterations (default: 3).
    pub max_refinement_attempts: u32,
    /// Maximum multi-hop reasoning steps (default: 5).
    pub max_reasoning_steps: u32,
    /// Minimum evaluation confidence to attempt multi-hop (default: 0.7).
    pub multi_hop_confidence_threshold: f64,

    /// Chunks requested per retrieval (default: 10).
    pub retrieval_top_k: usize,
    /// Chunks scoring below this are dropped after retrieval (default: 0.5).
    pub min_relevance_score: f64,

    /// Whether responses grounded in retrieved context must cite it
    /// (default: true).
    pub require_citations: bool,
    /// Minimum citation markers when citations are required (default: 1).
    pub minimum_citations: usize,
    /// Attach a review flag to responses judged hallucinated instead of
    /// rejecting them outright (default: true).
    pub auto_flag_low_confidence: bool,

    /// Timeout for a single backend attempt in milliseconds (default: 30000).
    pub attempt_timeout_ms: u64,
    /// Hard cap for the whole request in milliseconds (default: 60000).
    pub request_timeout_ms: u64,
    /// Maximum cascade transitions, counting both fallbacks and
    /// confidence-driven escalations (default: 3).
    pub max_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enable_fallback: true,
            log_routing: false,
            prefer_cheaper_models: false,
            enable_caching: true,
            confidence_threshold: 0.7,
            hallucination_threshold: 0.6,
            high_confidence_threshold: 0.8,
            medium_confidence_threshold: 0.6,
            low_confidence_threshold: 0.4,
            max_refinement_attempts: 3,
            max_reasoning_steps: 5,
            multi_hop_confidence_threshold: 0.7,
            retrieval_top_k: 10,
            min_relevance_score: 0.5,
            require_citations: true,
            minimum_citations: 1,
            auto_flag_low_confidence: true,
            attempt_timeout_ms: 30_000,
            request_timeout_ms: 60_000,
            max_retries: 3,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(mut self, enable: bool) -> Self {
        self.enable_fallback = enable;
        self
    }

    pub fn with_routing_logs(mut self, enable: bool) -> Self {
        self.log_routing = enable;
        self
    }

    pub fn preferring_cheaper_models(mut self) -> Self {
        self.prefer_cheaper_models = true;
        self
    }

    pub fn with_caching(mut self, enable: bool) -> Self {
        self.enable_caching = enable;
        self
    }

    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_hallucination_threshold(mut self, threshold: f64) -> Self {
        self.hallucination_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_refinement_attempts(mut self, attempts: u32) -> Self {
        self.max_refinement_attempts = attempts;
        self
    }

    pub fn with_max_reasoning_steps(mut self, steps: u32) -> Self {
        self.max_reasoning_steps = steps;
        self
    }

    pub fn with_retrieval_top_k(mut self, top_k: usize) -> Self {
        self.retrieval_top_k = top_k.max(1);
        self
    }

    pub fn with_min_relevance_score(mut self, score: f64) -> Self {
        self.min_relevance_score = score.clamp(0.0, 1.0);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Per-attempt timeout as a [`Duration`].
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Per-request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
