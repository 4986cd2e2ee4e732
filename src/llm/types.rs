//! Core types for queries, completions, and the model registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Generative backend identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendId {
    Anthropic,
    OpenAi,
    Gemini,
}

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anthropic => write!(f, "anthropic"),
            Self::OpenAi => write!(f, "openai"),
            Self::Gemini => write!(f, "gemini"),
        }
    }
}

/// Model tier for routing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Fast and cheap (e.g., Claude Haiku, GPT-4o-mini)
    Fast = 0,
    /// Balanced capability and cost (e.g., Claude Sonnet, GPT-4o)
    Balanced = 1,
    /// Most capable, highest cost (e.g., Claude Opus, o1)
    Powerful = 2,
}

impl ModelTier {
    /// One tier down, saturating at [`ModelTier::Fast`].
    pub fn demoted(self) -> Self {
        match self {
            Self::Powerful => Self::Balanced,
            Self::Balanced | Self::Fast => Self::Fast,
        }
    }

    /// One tier up, saturating at [`ModelTier::Powerful`].
    pub fn escalated(self) -> Self {
        match self {
            Self::Fast => Self::Balanced,
            Self::Balanced | Self::Powerful => Self::Powerful,
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Balanced => write!(f, "balanced"),
            Self::Powerful => write!(f, "powerful"),
        }
    }
}

/// Capability tag carried by a model configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Vision,
    CodeGeneration,
    PromptCaching,
    /// Marks the tier's expert model, routed to for the hardest queries.
    Expert,
}

/// Model definition with pricing, latency, and capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier (e.g., "claude-3-5-sonnet-20241022")
    pub model_id: String,
    /// Backend serving this model
    pub backend_id: BackendId,
    /// Tier classification
    pub tier: ModelTier,
    /// Maximum output tokens
    pub max_tokens: u32,
    /// Input cost per million tokens (USD)
    pub cost_per_million_input: f64,
    /// Output cost per million tokens (USD)
    pub cost_per_million_output: f64,
    /// Typical end-to-end latency in milliseconds
    pub avg_latency_ms: u64,
    /// Capability tags
    pub capabilities: Vec<Capability>,
}

/// Cache-write tokens are billed at a 25% premium.
pub const CACHE_WRITE_MULTIPLIER: f64 = 1.25;
/// Cache-read tokens are billed at 10% of the input rate.
pub const CACHE_READ_MULTIPLIER: f64 = 0.10;

impl ModelConfig {
    /// Whether the model carries a capability tag.
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Cost for the given usage, with cache-write tokens at a premium and
    /// cache-read tokens at a discount.
    pub fn calculate_cost(&self, usage: &TokenUsage) -> f64 {
        let rate = self.cost_per_million_input / 1_000_000.0;
        let out_rate = self.cost_per_million_output / 1_000_000.0;
        usage.input_tokens as f64 * rate
            + usage.cache_write_tokens as f64 * rate * CACHE_WRITE_MULTIPLIER
            + usage.cache_read_tokens as f64 * rate * CACHE_READ_MULTIPLIER
            + usage.output_tokens as f64 * out_rate
    }

    /// Hypothetical cost with every input token billed at the regular rate.
    /// The difference against [`Self::calculate_cost`] is the cache savings.
    pub fn calculate_uncached_cost(&self, usage: &TokenUsage) -> f64 {
        let rate = self.cost_per_million_input / 1_000_000.0;
        let out_rate = self.cost_per_million_output / 1_000_000.0;
        usage.total_input_tokens() as f64 * rate + usage.output_tokens as f64 * out_rate
    }
}

/// Well-known models.
impl ModelConfig {
    pub fn claude_haiku() -> Self {
        Self {
            model_id: "claude-3-5-haiku-20241022".to_string(),
            backend_id: BackendId::Anthropic,
            tier: ModelTier::Fast,
            max_tokens: 8192,
            cost_per_million_input: 0.8,
            cost_per_million_output: 4.0,
            avg_latency_ms: 800,
            capabilities: vec![Capability::Vision, Capability::PromptCaching],
        }
    }

    pub fn claude_sonnet() -> Self {
        Self {
            model_id: "claude-3-5-sonnet-20241022".to_string(),
            backend_id: BackendId::Anthropic,
            tier: ModelTier::Balanced,
            max_tokens: 8192,
            cost_per_million_input: 3.0,
            cost_per_million_output: 15.0,
            avg_latency_ms: 1500,
            capabilities: vec![
                Capability::Vision,
                Capability::CodeGeneration,
                Capability::PromptCaching,
            ],
        }
    }

    pub fn claude_opus() -> Self {
        Self {
            model_id: "claude-3-opus-20240229".to_string(),
            backend_id: BackendId::Anthropic,
            tier: ModelTier::Powerful,
            max_tokens: 4096,
            cost_per_million_input: 15.0,
            cost_per_million_output: 75.0,
            avg_latency_ms: 3000,
            capabilities: vec![
                Capability::Vision,
                Capability::CodeGeneration,
                Capability::PromptCaching,
            ],
        }
    }

    pub fn gpt4o_mini() -> Self {
        Self {
            model_id: "gpt-4o-mini".to_string(),
            backend_id: BackendId::OpenAi,
            tier: ModelTier::Fast,
            max_tokens: 16384,
            cost_per_million_input: 0.15,
            cost_per_million_output: 0.60,
            avg_latency_ms: 700,
            capabilities: vec![Capability::Vision, Capability::CodeGeneration],
        }
    }

    pub fn gpt4o() -> Self {
        Self {
            model_id: "gpt-4o".to_string(),
            backend_id: BackendId::OpenAi,
            tier: ModelTier::Balanced,
            max_tokens: 16384,
            cost_per_million_input: 2.5,
            cost_per_million_output: 10.0,
            avg_latency_ms: 1400,
            capabilities: vec![Capability::Vision, Capability::CodeGeneration],
        }
    }

    pub fn o1_preview() -> Self {
        Self {
            model_id: "o1-preview".to_string(),
            backend_id: BackendId::OpenAi,
            tier: ModelTier::Powerful,
            max_tokens: 32768,
            cost_per_million_input: 15.0,
            cost_per_million_output: 60.0,
            avg_latency_ms: 8000,
            capabilities: vec![Capability::CodeGeneration, Capability::Expert],
        }
    }

    pub fn gemini_flash() -> Self {
        Self {
            model_id: "gemini-2.0-flash".to_string(),
            backend_id: BackendId::Gemini,
            tier: ModelTier::Fast,
            max_tokens: 8192,
            cost_per_million_input: 0.075,
            cost_per_million_output: 0.30,
            avg_latency_ms: 600,
            capabilities: vec![Capability::Vision, Capability::PromptCaching],
        }
    }

    pub fn gemini_pro() -> Self {
        Self {
            model_id: "gemini-1.5-pro".to_string(),
            backend_id: BackendId::Gemini,
            tier: ModelTier::Balanced,
            max_tokens: 8192,
            cost_per_million_input: 1.25,
            cost_per_million_output: 5.0,
            avg_latency_ms: 1800,
            capabilities: vec![
                Capability::Vision,
                Capability::CodeGeneration,
                Capability::PromptCaching,
            ],
        }
    }
}

/// Process-wide immutable model catalog, keyed by model id.
///
/// Insertion order is significant: the router breaks ties between otherwise
/// equivalent candidates by registry order.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: Vec<ModelConfig>,
    index: HashMap<String, usize>,
}

impl ModelRegistry {
    /// Build a registry from an ordered model list. Later duplicates of a
    /// model id are ignored.
    pub fn with_models(models: Vec<ModelConfig>) -> Self {
        let mut registry = Self {
            models: Vec::with_capacity(models.len()),
            index: HashMap::new(),
        };
        for model in models {
            if !registry.index.contains_key(&model.model_id) {
                registry.index.insert(model.model_id.clone(), registry.models.len());
                registry.models.push(model);
            }
        }
        registry
    }

    /// The default catalog: all three backends, all three tiers.
    pub fn default_catalog() -> Self {
        Self::with_models(vec![
            ModelConfig::claude_haiku(),
            ModelConfig::gpt4o_mini(),
            ModelConfig::gemini_flash(),
            ModelConfig::claude_sonnet(),
            ModelConfig::gpt4o(),
            ModelConfig::gemini_pro(),
            ModelConfig::claude_opus(),
            ModelConfig::o1_preview(),
        ])
    }

    /// Look up a model by id.
    pub fn get(&self, model_id: &str) -> Option<&ModelConfig> {
        self.index.get(model_id).map(|&i| &self.models[i])
    }

    /// All models in registry order.
    pub fn models(&self) -> &[ModelConfig] {
        &self.models
    }

    /// Models of a tier, in registry order.
    pub fn by_tier(&self, tier: ModelTier) -> impl Iterator<Item = &ModelConfig> {
        self.models.iter().filter(move |m| m.tier == tier)
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::default_catalog()
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// An attachment referenced by a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// MIME type (e.g., "image/png")
    pub media_type: String,
    /// Location or inline data reference
    pub uri: String,
}

/// A message in a conversation. History keeps insertion order, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            attachments: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            attachments: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            attachments: None,
        }
    }
}

/// Routing hints supplied by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryHints {
    /// The response will contain generated code.
    pub requires_code_generation: bool,
    /// The query references visual input.
    pub requires_vision: bool,
    /// Trade quality for cost: demote one tier after routing.
    pub prefer_cheap: bool,
}

/// An incoming conversational query. Immutable for the request's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    /// The user's query text
    pub text: String,
    /// Owning tenant; mandatory for retrieval isolation and stats
    pub tenant_id: String,
    /// Optional session identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Prior conversation turns, oldest first
    pub history: Vec<ChatMessage>,
    /// Routing hints
    pub hints: QueryHints,
}

impl Query {
    pub fn new(text: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tenant_id: tenant_id.into(),
            session_id: None,
            history: Vec::new(),
            hints: QueryHints::default(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_hints(mut self, hints: QueryHints) -> Self {
        self.hints = hints;
        self
    }

    /// The most recent user message, falling back to the query text.
    pub fn last_user_text(&self) -> &str {
        self.history
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or(&self.text)
    }
}

/// Completion request handed to the provider gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Conversation messages, oldest first. Must be non-empty.
    pub messages: Vec<ChatMessage>,
    /// System prompt, routed to the backend's system slot when supported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Sampling temperature (default 0.7)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Maximum tokens to generate (default 2048)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Opt in to prompt caching on supporting backends
    pub enable_caching: bool,
    /// Tenant the request is billed and accounted against
    pub tenant_id: String,
    /// Metadata for tracking
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Default sampling temperature.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
/// Default generation budget in tokens.
pub const DEFAULT_MAX_TOKENS: u32 = 2048;

impl CompletionRequest {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            messages: Vec::new(),
            system: None,
            temperature: None,
            max_tokens: None,
            enable_caching: false,
            tenant_id: tenant_id.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 1.0));
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_caching(mut self, enable: bool) -> Self {
        self.enable_caching = enable;
        self
    }

    /// Effective temperature after applying the default.
    pub fn temperature_or_default(&self) -> f64 {
        self.temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }

    /// Effective max-tokens after applying the default.
    pub fn max_tokens_or_default(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    /// Reject structurally invalid requests before any backend call.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.messages.is_empty() {
            return Err(crate::error::Error::invalid_request("empty message list"));
        }
        if self.messages.iter().any(|m| m.content.trim().is_empty()) {
            return Err(crate::error::Error::invalid_request(
                "message with empty content",
            ));
        }
        if self.tenant_id.is_empty() {
            return Err(crate::error::Error::invalid_request("missing tenant id"));
        }
        Ok(())
    }
}

/// Token usage for a single completion.
///
/// `input_tokens` counts only tokens billed at the regular input rate;
/// cache reads and writes are tracked separately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Tokens served from the backend's prompt cache
    pub cache_read_tokens: u64,
    /// Tokens written into the backend's prompt cache
    pub cache_write_tokens: u64,
}

impl TokenUsage {
    /// All input-side tokens regardless of cache treatment.
    pub fn total_input_tokens(&self) -> u64 {
        self.input_tokens + self.cache_read_tokens + self.cache_write_tokens
    }

    pub fn total(&self) -> u64 {
        self.total_input_tokens() + self.output_tokens
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
}

/// A finished completion with usage and cost accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResult {
    /// Generated content
    pub content: String,
    /// Backend that produced the completion
    pub backend_id: BackendId,
    /// Model that produced the completion
    pub model_id: String,
    /// Why generation stopped
    pub finish_reason: FinishReason,
    /// Token usage
    pub usage: TokenUsage,
    /// Cost in USD, derived from usage and the model's rates
    pub cost: f64,
    /// Annotations attached by the pipeline (routing, quality, disclaimers)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Response timestamp
    pub timestamp: DateTime<Utc>,
}

impl CompletionResult {
    /// Attach a metadata annotation.
    pub fn annotate(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.into(), value.into());
    }
}
