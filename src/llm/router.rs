//! Deterministic model routing.
//!
//! Maps a complexity score and caller hints onto a model via a fixed,
//! total policy table, then builds the fallback chain the executor walks
//! on failure. Routing is pure: equal inputs yield equal decisions.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::complexity::{ComplexityLevel, ComplexityScore};
use crate::llm::types::{Capability, ModelConfig, ModelRegistry, ModelTier, QueryHints};

/// Nominal request size used for the routing-time cost estimate.
const EST_INPUT_TOKENS: u64 = 1000;
const EST_OUTPUT_TOKENS: u64 = 500;

/// Threshold above which a complex query is routed to the expert model.
const EXPERT_SCORE_THRESHOLD: f64 = 0.8;

/// Routing decision output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Selected model
    pub model: ModelConfig,
    /// Why this model was selected
    pub reasoning: String,
    /// Cost estimate for a nominal request, USD
    pub estimated_cost: f64,
    /// Candidates the executor may fall back to, in order. Never contains
    /// the primary and holds no duplicates.
    pub fallback_chain: Vec<ModelConfig>,
}

/// Capability the routed model must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Requirement {
    None,
    Vision,
    Code,
    Expert,
}

/// Router over the process-wide model registry.
pub struct ModelRouter {
    registry: Arc<ModelRegistry>,
    prefer_cheaper: bool,
    log_routing: bool,
}

impl ModelRouter {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            prefer_cheaper: false,
            log_routing: false,
        }
    }

    pub fn preferring_cheaper_models(mut self, prefer: bool) -> Self {
        self.prefer_cheaper = prefer;
        self
    }

    pub fn with_routing_logs(mut self, log: bool) -> Self {
        self.log_routing = log;
        self
    }

    /// Route a query. Vision hints win over everything; otherwise the
    /// complexity level picks the tier and capability requirement.
    pub fn route(&self, complexity: &ComplexityScore, hints: &QueryHints) -> RoutingDecision {
        let (tier, requirement, rule) = if hints.requires_vision {
            (ModelTier::Fast, Requirement::Vision, "vision query")
        } else {
            match complexity.level {
                ComplexityLevel::Simple if !hints.requires_code_generation => {
                    (ModelTier::Fast, Requirement::None, "simple query")
                }
                // Code generation wants at least the balanced tier, even
                // for otherwise simple queries.
                ComplexityLevel::Simple | ComplexityLevel::Moderate
                    if hints.requires_code_generation =>
                {
                    (ModelTier::Balanced, Requirement::Code, "code generation")
                }
                ComplexityLevel::Moderate => {
                    (ModelTier::Balanced, Requirement::None, "moderate query")
                }
                ComplexityLevel::Complex if complexity.score > EXPERT_SCORE_THRESHOLD => {
                    (ModelTier::Powerful, Requirement::Expert, "expert-level query")
                }
                ComplexityLevel::Complex => {
                    (ModelTier::Powerful, Requirement::None, "complex query")
                }
                ComplexityLevel::Simple => unreachable!("guarded above"),
            }
        };

        let (tier, demoted) = if hints.prefer_cheap || self.prefer_cheaper {
            (tier.demoted(), true)
        } else {
            (tier, false)
        };

        let model = self.select(tier, requirement);
        let fallback_chain = self.build_fallback_chain(&model);

        let usage = crate::llm::types::TokenUsage {
            input_tokens: EST_INPUT_TOKENS,
            output_tokens: EST_OUTPUT_TOKENS,
            ..Default::default()
        };
        let decision = RoutingDecision {
            reasoning: format!(
                "{rule} -> {} tier{} ({})",
                tier,
                if demoted { ", demoted for cost" } else { "" },
                model.model_id,
            ),
            estimated_cost: model.calculate_cost(&usage),
            fallback_chain,
            model,
        };

        if self.log_routing {
            debug!(
                model = %decision.model.model_id,
                tier = %decision.model.tier,
                score = complexity.score,
                reasoning = %decision.reasoning,
                "routing decision"
            );
        }

        decision
    }

    /// First registry-order model of the tier satisfying the requirement.
    /// Falls back to any model of the tier, then to any model at all, so
    /// selection is total for non-empty registries.
    fn select(&self, tier: ModelTier, requirement: Requirement) -> ModelConfig {
        let satisfies = |m: &&ModelConfig| match requirement {
            Requirement::None => true,
            Requirement::Vision => m.supports(Capability::Vision),
            Requirement::Code => m.supports(Capability::CodeGeneration),
            Requirement::Expert => m.supports(Capability::Expert),
        };

        self.registry
            .by_tier(tier)
            .find(satisfies)
            .or_else(|| self.registry.by_tier(tier).next())
            .or_else(|| self.registry.models().first())
            .cloned()
            .expect("model registry is empty")
    }

    /// Default model for a tier (first in registry order).
    fn tier_default(&self, tier: ModelTier) -> Option<&ModelConfig> {
        self.registry.by_tier(tier).next()
    }

    /// Same-tier different-backend alternative first, then the fixed tier
    /// escalation ladder, deduplicated and excluding the primary.
    fn build_fallback_chain(&self, primary: &ModelConfig) -> Vec<ModelConfig> {
        let mut chain: Vec<&ModelConfig> = Vec::new();

        if let Some(alternative) = self
            .registry
            .by_tier(primary.tier)
            .find(|m| m.backend_id != primary.backend_id)
        {
            chain.push(alternative);
        }

        match primary.tier {
            ModelTier::Fast => {
                chain.extend(self.tier_default(ModelTier::Balanced));
                chain.extend(self.tier_default(ModelTier::Powerful));
            }
            ModelTier::Balanced => {
                chain.extend(self.tier_default(ModelTier::Powerful));
                chain.extend(
                    self.registry
                        .by_tier(ModelTier::Powerful)
                        .find(|m| m.supports(Capability::Expert)),
                );
            }
            ModelTier::Powerful => {
                chain.extend(
                    self.registry
                        .by_tier(ModelTier::Powerful)
                        .find(|m| m.model_id != primary.model_id),
                );
            }
        }

        let mut seen = vec![primary.model_id.as_str()];
        let mut deduped: Vec<ModelConfig> = Vec::new();
        for model in chain {
            if !seen.contains(&model.model_id.as_str()) {
                seen.push(model.model_id.as_str());
                deduped.push(model.clone());
            }
        }

        if deduped.is_empty() {
            // Degenerate registries still get a chain when any other
            // model exists.
            if let Some(other) = self
                .registry
                .models()
                .iter()
                .find(|m| m.model_id != primary.model_id)
            {
                deduped.push(other.clone());
            }
        }

        deduped
    }
}
