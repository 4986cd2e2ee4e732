//! Multi-backend LLM access: common types, wire adapters, routing, and
//! the provider gateway.
//!
//! The three backends hide behind one completion contract. Callers route
//! with [`ModelRouter`], then execute through [`ProviderGateway`] (or the
//! cascading executor, which drives the gateway with fallback).

pub mod anthropic;
pub mod backend;
pub mod gateway;
pub mod gemini;
pub mod openai;
pub mod router;
pub mod stream;
pub mod types;

pub use backend::{Backend, BackendClient, ClientConfig, RawCompletion, RawEventStream, RawStreamEvent};
pub use gateway::{CompletionGateway, GatewayStream, ProviderGateway};
pub use router::{ModelRouter, RoutingDecision};
pub use stream::{CompletionStream, StreamEvent, StreamSender, STREAM_BUFFER};
pub use types::{
    Attachment, BackendId, Capability, ChatMessage, ChatRole, CompletionRequest, CompletionResult,
    FinishReason, ModelConfig, ModelRegistry, ModelTier, Query, QueryHints, TokenUsage,
    DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE,
};
pub use anthropic::AnthropicBackend;
pub use gemini::GeminiBackend;
pub use openai::OpenAiBackend;
