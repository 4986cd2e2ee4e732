//! The orchestrator facade.
//!
//! One entry point over the whole pipeline: complexity analysis, routing,
//! corrective retrieval, cascading execution, and quality scoring. This is
//! the only surface collaborators call; transports live outside the crate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cascade::CascadingExecutor;
use crate::complexity::{requires_vision_model, ComplexityAnalyzer};
use crate::config::OrchestratorConfig;
use crate::crag::CragCoordinator;
use crate::error::{Error, Result};
use crate::llm::backend::Backend;
use crate::llm::gateway::{CompletionGateway, ProviderGateway};
use crate::llm::router::{ModelRouter, RoutingDecision};
use crate::llm::stream::CompletionStream;
use crate::llm::types::{ModelRegistry, ModelTier, Query, TokenUsage};
use crate::quality::QualityChecker;
use crate::retrieval::{Retriever, RetrieverAdapter};
use crate::stats::{CacheStats, CacheStatsRegistry};

/// Nominal per-request usage for savings projections.
const EST_USAGE: TokenUsage = TokenUsage {
    input_tokens: 1000,
    output_tokens: 500,
    cache_read_tokens: 0,
    cache_write_tokens: 0,
};

/// Assumed complexity mix for savings projections: most traffic is
/// simple-to-moderate.
const TIER_MIX: &[(ModelTier, f64)] = &[
    (ModelTier::Fast, 0.4),
    (ModelTier::Balanced, 0.4),
    (ModelTier::Powerful, 0.2),
];

/// Projected spend with and without routing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SavingsEstimate {
    /// Monthly cost with every query on the powerful default, USD
    pub baseline: f64,
    /// Monthly cost with tier routing, USD
    pub optimized: f64,
    /// baseline - optimized, USD
    pub absolute: f64,
    /// absolute / baseline * 100
    pub percent: f64,
}

/// Query orchestrator over a completion gateway.
pub struct Orchestrator<G = ProviderGateway> {
    config: Arc<OrchestratorConfig>,
    registry: Arc<ModelRegistry>,
    analyzer: ComplexityAnalyzer,
    router: ModelRouter,
    coordinator: Arc<CragCoordinator<G>>,
    stats: Arc<CacheStatsRegistry>,
}

impl Orchestrator<ProviderGateway> {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }
}

impl<G: CompletionGateway + 'static> Orchestrator<G> {
    /// Assemble an orchestrator over an arbitrary gateway implementation.
    pub fn with_gateway(
        gateway: Arc<G>,
        registry: Arc<ModelRegistry>,
        stats: Arc<CacheStatsRegistry>,
        retriever: Option<Arc<dyn Retriever>>,
        config: OrchestratorConfig,
    ) -> Self {
        let config = Arc::new(config);
        let router = ModelRouter::new(Arc::clone(&registry))
            .preferring_cheaper_models(config.prefer_cheaper_models)
            .with_routing_logs(config.log_routing);
        let executor = Arc::new(CascadingExecutor::new(gateway, Arc::clone(&config)));
        let adapter = retriever
            .map(|r| Arc::new(RetrieverAdapter::new(r, config.min_relevance_score)));
        let coordinator = Arc::new(CragCoordinator::new(
            executor,
            adapter,
            Arc::clone(&config),
        ));

        Self {
            config,
            registry,
            analyzer: ComplexityAnalyzer::new(),
            router,
            coordinator,
            stats,
        }
    }

    /// Install an external fact-check adapter. Must be called before the
    /// orchestrator serves its first request.
    pub fn with_fact_checker(mut self, checker: Arc<dyn crate::quality::FactChecker>) -> Self {
        let quality = QualityChecker::new(
            self.config.hallucination_threshold,
            self.config.confidence_threshold,
            self.config.require_citations,
            self.config.minimum_citations,
        )
        .with_fact_checker(checker);
        Arc::get_mut(&mut self.coordinator)
            .expect("fact checker must be installed before the orchestrator is shared")
            .set_quality_checker(quality);
        self
    }

    fn validate(query: &Query) -> Result<()> {
        if query.text.trim().is_empty() {
            return Err(Error::invalid_request("empty query text"));
        }
        if query.tenant_id.is_empty() {
            return Err(Error::invalid_request("missing tenant id"));
        }
        Ok(())
    }

    /// Route a query without executing it. Pure inspection: no side
    /// effects, equal queries yield equal decisions.
    pub fn route(&self, query: &Query) -> RoutingDecision {
        let complexity = self.analyzer.analyze(&query.text);
        let mut hints = query.hints;
        hints.requires_vision =
            hints.requires_vision || requires_vision_model(query.last_user_text());
        self.router.route(&complexity, &hints)
    }

    /// Run the full pipeline for a query.
    pub async fn complete(&self, query: &Query) -> Result<crate::llm::types::CompletionResult> {
        self.complete_with(query, &CancellationToken::new()).await
    }

    /// Run the full pipeline with caller-controlled cancellation.
    pub async fn complete_with(
        &self,
        query: &Query,
        cancel: &CancellationToken,
    ) -> Result<crate::llm::types::CompletionResult> {
        Self::validate(query)?;
        let decision = self.route(query);
        self.coordinator.run(query, &decision, cancel).await
    }

    /// Run the full pipeline, streaming the synthesis.
    pub fn stream_complete(&self, query: Query) -> CompletionStream {
        self.stream_complete_with(query, CancellationToken::new())
    }

    /// Streaming variant with caller-controlled cancellation.
    pub fn stream_complete_with(
        &self,
        query: Query,
        cancel: CancellationToken,
    ) -> CompletionStream {
        if let Err(err) = Self::validate(&query) {
            let (tx, stream) = CompletionStream::channel();
            let _ = tx.try_send(Err(err));
            return stream;
        }
        let decision = self.route(&query);
        Arc::clone(&self.coordinator).run_stream(query, decision, cancel)
    }

    /// Project monthly savings from tier routing versus a single powerful
    /// model.
    pub fn estimate_savings(&self, monthly_queries: u64) -> SavingsEstimate {
        let powerful_cost = self
            .registry
            .by_tier(ModelTier::Powerful)
            .next()
            .or_else(|| self.registry.models().first())
            .map(|m| m.calculate_cost(&EST_USAGE))
            .unwrap_or(0.0);

        let per_query_optimized: f64 = TIER_MIX
            .iter()
            .map(|(tier, share)| {
                let cost = self
                    .registry
                    .by_tier(*tier)
                    .next()
                    .map(|m| m.calculate_cost(&EST_USAGE))
                    .unwrap_or(powerful_cost);
                cost * share
            })
            .sum();

        let baseline = powerful_cost * monthly_queries as f64;
        let optimized = per_query_optimized * monthly_queries as f64;
        let absolute = baseline - optimized;
        let percent = if baseline > 0.0 {
            absolute / baseline * 100.0
        } else {
            0.0
        };

        SavingsEstimate {
            baseline,
            optimized,
            absolute,
            percent,
        }
    }

    /// Snapshot one tenant's cache statistics.
    pub async fn cache_stats(&self, tenant_id: &str) -> CacheStats {
        self.stats.get(tenant_id).await
    }

    /// Snapshot every tenant's cache statistics.
    pub async fn all_cache_stats(&self) -> HashMap<String, CacheStats> {
        self.stats.all().await
    }

    /// Drop one tenant's cache statistics.
    pub async fn clear_stats(&self, tenant_id: &str) {
        self.stats.clear(tenant_id).await;
    }

    /// Drop every tenant's cache statistics.
    pub async fn clear_all_stats(&self) {
        self.stats.clear_all().await;
    }
}

/// Builder wiring the default provider gateway.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    registry: ModelRegistry,
    backends: Vec<Backend>,
    retriever: Option<Arc<dyn Retriever>>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            registry: ModelRegistry::default_catalog(),
            backends: Vec::new(),
            retriever: None,
        }
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn build(self) -> Orchestrator<ProviderGateway> {
        let registry = Arc::new(self.registry);
        let stats = Arc::new(CacheStatsRegistry::new());
        let mut gateway = ProviderGateway::new(Arc::clone(&registry), Arc::clone(&stats));
        for backend in self.backends {
            gateway = gateway.with_backend(backend);
        }
        Orchestrator::with_gateway(
            Arc::new(gateway),
            registry,
            stats,
            self.retriever,
            self.config,
        )
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
