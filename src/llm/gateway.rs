//! Provider gateway: one completion contract over the three backends.
//!
//! The gateway owns the backend handles, validates requests, derives cost
//! from usage and model rates, updates per-tenant cache statistics, and
//! emits one structured log record per completed call.

use async_trait::async_trait;
use chrono::Utc;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::llm::backend::{Backend, RawStreamEvent};
use crate::llm::stream::StreamEvent;
use crate::llm::types::{
    BackendId, Capability, CompletionRequest, CompletionResult, FinishReason, ModelConfig,
    ModelRegistry, TokenUsage,
};
use crate::stats::CacheStatsRegistry;

/// Boxed gateway-level event stream.
pub type GatewayStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Completion contract consumed by the executor and the CRAG pipeline.
#[async_trait]
pub trait CompletionGateway: Send + Sync {
    /// Blocking call for a full completion.
    async fn complete(
        &self,
        model_id: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionResult>;

    /// Lazy chunk sequence terminated by a [`StreamEvent::Done`].
    async fn stream_complete(
        &self,
        model_id: &str,
        request: &CompletionRequest,
    ) -> Result<GatewayStream>;
}

/// Gateway over the configured backends.
pub struct ProviderGateway {
    backends: Vec<Backend>,
    registry: Arc<ModelRegistry>,
    stats: Arc<CacheStatsRegistry>,
}

impl ProviderGateway {
    pub fn new(registry: Arc<ModelRegistry>, stats: Arc<CacheStatsRegistry>) -> Self {
        Self {
            backends: Vec::new(),
            registry,
            stats,
        }
    }

    /// Register a backend. One handle per backend id; later registrations
    /// for the same backend replace the earlier one.
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backends.retain(|b| b.id() != backend.id());
        self.backends.push(backend);
        self
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    fn backend_for(&self, id: BackendId) -> Option<&Backend> {
        self.backends.iter().find(|b| b.id() == id)
    }

    /// Resolve a model id to its config and serving backend.
    fn resolve(&self, model_id: &str) -> Result<(&ModelConfig, &Backend)> {
        let model = self
            .registry
            .get(model_id)
            .ok_or_else(|| Error::invalid_request(format!("unknown model: {model_id}")))?;
        let backend = self.backend_for(model.backend_id).ok_or_else(|| {
            Error::invalid_request(format!(
                "model {model_id} is served by unconfigured backend {}",
                model.backend_id
            ))
        })?;
        Ok((model, backend))
    }

    /// Whether cache accounting applies to this request/model pair.
    fn caching_active(model: &ModelConfig, request: &CompletionRequest) -> bool {
        request.enable_caching && model.supports(Capability::PromptCaching)
    }
}

/// Derive cost and savings, update tenant stats, and log the call.
pub(crate) async fn finalize_completion(
    model: &ModelConfig,
    stats: &CacheStatsRegistry,
    tenant_id: &str,
    caching_active: bool,
    content: String,
    finish_reason: FinishReason,
    usage: TokenUsage,
    latency_ms: u64,
) -> CompletionResult {
    let cost = model.calculate_cost(&usage);

    if caching_active {
        let savings = (model.calculate_uncached_cost(&usage) - cost).max(0.0);
        let hit = usage.cache_read_tokens > 0;
        stats
            .record(tenant_id, hit, usage.cache_read_tokens, savings)
            .await;
    }

    info!(
        backend = %model.backend_id,
        model = %model.model_id,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        cache_read_tokens = usage.cache_read_tokens,
        cache_write_tokens = usage.cache_write_tokens,
        cost_usd = cost,
        latency_ms,
        "completion finished"
    );

    CompletionResult {
        content,
        backend_id: model.backend_id,
        model_id: model.model_id.clone(),
        finish_reason,
        usage,
        cost,
        metadata: HashMap::new(),
        timestamp: Utc::now(),
    }
}

/// Short fingerprint of the cacheable prompt prefix, for log correlation.
pub(crate) fn prompt_fingerprint(system: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(system.as_bytes());
    let digest = hasher.finalize();
    format!("{:x}", digest)[..16].to_string()
}

#[async_trait]
impl CompletionGateway for ProviderGateway {
    async fn complete(
        &self,
        model_id: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionResult> {
        request.validate()?;
        let (model, backend) = self.resolve(model_id)?;
        let caching = Self::caching_active(model, request);
        if caching {
            if let Some(system) = &request.system {
                debug!(
                    model = %model.model_id,
                    prompt_fingerprint = %prompt_fingerprint(system),
                    "prompt caching requested"
                );
            }
        }

        let started = Instant::now();
        let raw = backend.complete(model, request).await?;

        Ok(finalize_completion(
            model,
            &self.stats,
            &request.tenant_id,
            caching,
            raw.content,
            raw.finish_reason,
            raw.usage,
            started.elapsed().as_millis() as u64,
        )
        .await)
    }

    async fn stream_complete(
        &self,
        model_id: &str,
        request: &CompletionRequest,
    ) -> Result<GatewayStream> {
        request.validate()?;
        let (model, backend) = self.resolve(model_id)?;
        let caching = Self::caching_active(model, request);

        let started = Instant::now();
        let mut raw = backend.stream(model, request).await?;

        let model = model.clone();
        let stats = Arc::clone(&self.stats);
        let tenant_id = request.tenant_id.clone();

        let stream = async_stream::try_stream! {
            let mut content = String::new();
            while let Some(event) = raw.next().await {
                match event? {
                    RawStreamEvent::Delta(chunk) => {
                        content.push_str(&chunk);
                        yield StreamEvent::Chunk(chunk);
                    }
                    RawStreamEvent::Finish {
                        finish_reason,
                        usage,
                    } => {
                        let result = finalize_completion(
                            &model,
                            &stats,
                            &tenant_id,
                            caching,
                            std::mem::take(&mut content),
                            finish_reason,
                            usage,
                            started.elapsed().as_millis() as u64,
                        )
                        .await;
                        yield StreamEvent::Done(Box::new(result));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
