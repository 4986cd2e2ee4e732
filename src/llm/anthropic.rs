//! Anthropic messages-API adapter.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::llm::backend::{
    build_http_client, classify_status, classify_transport, retry_after_ms, BackendClient,
    ClientConfig, RawCompletion, RawEventStream, RawStreamEvent,
};
use crate::llm::types::{
    BackendId, ChatRole, CompletionRequest, FinishReason, ModelConfig, TokenUsage,
};

/// Minimum system-prompt length, in characters, before cache segmentation
/// is attempted (roughly 1024 tokens at 4 chars/token).
pub(crate) const MIN_CACHEABLE_SYSTEM_CHARS: usize = 4096;

pub struct AnthropicBackend {
    config: ClientConfig,
    http: Client,
}

impl AnthropicBackend {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";

    pub fn new(config: ClientConfig) -> Self {
        let http = build_http_client(config.timeout);
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }

    fn build_request(
        &self,
        model: &ModelConfig,
        request: &CompletionRequest,
        stream: bool,
    ) -> AnthropicRequest {
        let mut system = request.system.clone().unwrap_or_default();
        let mut messages = Vec::new();
        for m in &request.messages {
            match m.role {
                ChatRole::System => {
                    if !system.is_empty() {
                        system.push_str("\n\n");
                    }
                    system.push_str(&m.content);
                }
                ChatRole::User => messages.push(AnthropicMessage {
                    role: "user",
                    content: m.content.clone(),
                }),
                ChatRole::Assistant => messages.push(AnthropicMessage {
                    role: "assistant",
                    content: m.content.clone(),
                }),
            }
        }

        let caching = request.enable_caching
            && model.supports(crate::llm::types::Capability::PromptCaching);
        let system = segment_system(&system, caching);

        AnthropicRequest {
            model: model.model_id.clone(),
            messages,
            max_tokens: request.max_tokens_or_default(),
            system,
            temperature: Some(request.temperature_or_default()),
            stream: stream.then_some(true),
        }
    }

    async fn send(&self, body: &AnthropicRequest) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.base_url());
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", Self::API_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport(BackendId::Anthropic, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_ms(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(
                BackendId::Anthropic,
                status,
                &body,
                retry_after,
            ));
        }
        Ok(response)
    }
}

/// Split the system prompt for prompt caching.
///
/// Caching needs at least two sections and a minimum overall length;
/// the final section carries the cache marker so everything before it is
/// cached as a prefix.
fn segment_system(system: &str, caching: bool) -> Option<AnthropicSystem> {
    if system.is_empty() {
        return None;
    }
    if !caching || system.len() < MIN_CACHEABLE_SYSTEM_CHARS {
        return Some(AnthropicSystem::Text(system.to_string()));
    }

    let sections: Vec<&str> = system.split("\n\n").collect();
    if sections.len() < 2 {
        return Some(AnthropicSystem::Text(system.to_string()));
    }

    let head = sections[..sections.len() - 1].join("\n\n");
    let last = sections[sections.len() - 1].to_string();
    Some(AnthropicSystem::Blocks(vec![
        SystemBlock {
            block_type: "text",
            text: head,
            cache_control: None,
        },
        SystemBlock {
            block_type: "text",
            text: last,
            cache_control: Some(CacheControl { control_type: "ephemeral" }),
        },
    ]))
}

fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        Some("refusal") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

// Wire types

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<AnthropicSystem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum AnthropicSystem {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

#[derive(Debug, Serialize)]
struct SystemBlock {
    #[serde(rename = "type")]
    block_type: &'static str,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Debug, Serialize)]
struct CacheControl {
    #[serde(rename = "type")]
    control_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
}

impl AnthropicUsage {
    fn into_usage(self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_read_tokens: self.cache_read_input_tokens.unwrap_or(0),
            cache_write_tokens: self.cache_creation_input_tokens.unwrap_or(0),
        }
    }
}

fn parse_response(body: &str) -> Result<RawCompletion> {
    let response: AnthropicResponse = serde_json::from_str(body)
        .map_err(|e| Error::invalid_request(format!("anthropic response schema: {e}")))?;

    let text_blocks: Vec<&str> = response
        .content
        .iter()
        .filter(|c| c.content_type == "text")
        .filter_map(|c| c.text.as_deref())
        .collect();
    if text_blocks.is_empty() && !response.content.is_empty() {
        return Err(Error::invalid_request(
            "anthropic response contained no text content block",
        ));
    }

    Ok(RawCompletion {
        content: text_blocks.concat(),
        finish_reason: map_stop_reason(response.stop_reason.as_deref()),
        usage: response.usage.into_usage(),
    })
}

#[async_trait]
impl BackendClient for AnthropicBackend {
    fn backend_id(&self) -> BackendId {
        BackendId::Anthropic
    }

    async fn complete(
        &self,
        model: &ModelConfig,
        request: &CompletionRequest,
    ) -> Result<RawCompletion> {
        let body = self.build_request(model, request, false);
        let response = self.send(&body).await?;
        let text = response
            .text()
            .await
            .map_err(|e| classify_transport(BackendId::Anthropic, e))?;
        parse_response(&text)
    }

    async fn stream(
        &self,
        model: &ModelConfig,
        request: &CompletionRequest,
    ) -> Result<RawEventStream> {
        let body = self.build_request(model, request, true);
        let response = self.send(&body).await?;
        let mut events = response.bytes_stream().eventsource();

        let stream = async_stream::try_stream! {
            let mut usage = TokenUsage::default();
            let mut finish_reason = FinishReason::Stop;

            while let Some(event) = events.next().await {
                let event = event.map_err(|e| {
                    Error::backend_unavailable("anthropic", format!("SSE error: {e}"))
                })?;
                let value: serde_json::Value = match serde_json::from_str(&event.data) {
                    Ok(v) => v,
                    Err(_) => continue,
                };

                match value.get("type").and_then(|t| t.as_str()) {
                    Some("message_start") => {
                        if let Some(u) = value.pointer("/message/usage") {
                            let parsed: AnthropicUsage =
                                serde_json::from_value(u.clone()).unwrap_or_default();
                            let parsed = parsed.into_usage();
                            usage.input_tokens = parsed.input_tokens;
                            usage.cache_read_tokens = parsed.cache_read_tokens;
                            usage.cache_write_tokens = parsed.cache_write_tokens;
                        }
                    }
                    Some("content_block_delta") => {
                        if let Some(text) = value.pointer("/delta/text").and_then(|t| t.as_str()) {
                            yield RawStreamEvent::Delta(text.to_string());
                        }
                    }
                    Some("message_delta") => {
                        if let Some(reason) =
                            value.pointer("/delta/stop_reason").and_then(|r| r.as_str())
                        {
                            finish_reason = map_stop_reason(Some(reason));
                        }
                        if let Some(out) =
                            value.pointer("/usage/output_tokens").and_then(|o| o.as_u64())
                        {
                            usage.output_tokens = out;
                        }
                    }
                    Some("message_stop") => break,
                    Some("error") => {
                        let message = value
                            .pointer("/error/message")
                            .and_then(|m| m.as_str())
                            .unwrap_or("stream error");
                        let failure: Result<()> =
                            Err(Error::backend_unavailable("anthropic", message));
                        failure?;
                    }
                    _ => {}
                }
            }

            yield RawStreamEvent::Finish {
                finish_reason,
                usage,
            };
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ChatMessage;

    #[test]
    fn test_parse_response() {
        let body = r#"{
            "id": "msg_1",
            "model": "claude-3-5-haiku-20241022",
            "content": [{"type": "text", "text": "Hello"}, {"type": "text", "text": " there"}],
            "stop_reason": "end_turn",
            "usage": {
                "input_tokens": 12,
                "output_tokens": 4,
                "cache_read_input_tokens": 8,
                "cache_creation_input_tokens": 2
            }
        }"#;
        let raw = parse_response(body).unwrap();
        assert_eq!(raw.content, "Hello there");
        assert_eq!(raw.finish_reason, FinishReason::Stop);
        assert_eq!(raw.usage.input_tokens, 12);
        assert_eq!(raw.usage.cache_read_tokens, 8);
        assert_eq!(raw.usage.cache_write_tokens, 2);
    }

    #[test]
    fn test_non_text_content_is_schema_mismatch() {
        let body = r#"{
            "content": [{"type": "tool_use", "text": null}],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        }"#;
        assert!(matches!(
            parse_response(body),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(map_stop_reason(Some("end_turn")), FinishReason::Stop);
        assert_eq!(map_stop_reason(Some("max_tokens")), FinishReason::Length);
        assert_eq!(map_stop_reason(Some("tool_use")), FinishReason::ToolCalls);
        assert_eq!(map_stop_reason(Some("refusal")), FinishReason::ContentFilter);
        assert_eq!(map_stop_reason(None), FinishReason::Stop);
    }

    #[test]
    fn test_system_segmentation_requires_length_and_sections() {
        // Short prompt: sent as plain text even with caching on.
        let short = segment_system("Be helpful.", true);
        assert!(matches!(short, Some(AnthropicSystem::Text(_))));

        // Long but single-section: no segmentation possible.
        let single = "x".repeat(MIN_CACHEABLE_SYSTEM_CHARS + 1);
        assert!(matches!(
            segment_system(&single, true),
            Some(AnthropicSystem::Text(_))
        ));

        // Long multi-section prompt: last section carries the cache marker.
        let long = format!(
            "{}\n\n{}\n\nAnswer using the context above.",
            "a".repeat(MIN_CACHEABLE_SYSTEM_CHARS / 2),
            "b".repeat(MIN_CACHEABLE_SYSTEM_CHARS / 2),
        );
        match segment_system(&long, true).unwrap() {
            AnthropicSystem::Blocks(blocks) => {
                assert_eq!(blocks.len(), 2);
                assert!(blocks[0].cache_control.is_none());
                assert!(blocks[1].cache_control.is_some());
                assert_eq!(blocks[1].text, "Answer using the context above.");
            }
            AnthropicSystem::Text(_) => panic!("expected segmented system"),
        }

        // Caching off: always plain text.
        assert!(matches!(
            segment_system(&long, false),
            Some(AnthropicSystem::Text(_))
        ));
    }

    #[test]
    fn test_system_messages_merge_into_system_slot() {
        let backend = AnthropicBackend::new(ClientConfig::new("test"));
        let request = CompletionRequest::new("tenant-1")
            .with_system("Base instructions")
            .with_message(ChatMessage::system("Extra instructions"))
            .with_message(ChatMessage::user("Hi"));
        let body = backend.build_request(&ModelConfig::claude_haiku(), &request, false);

        assert_eq!(body.messages.len(), 1);
        assert_eq!(body.messages[0].role, "user");
        match body.system.unwrap() {
            AnthropicSystem::Text(text) => {
                assert_eq!(text, "Base instructions\n\nExtra instructions")
            }
            AnthropicSystem::Blocks(_) => panic!("short system should stay plain"),
        }
    }

    #[test]
    fn test_request_defaults_applied() {
        let backend = AnthropicBackend::new(ClientConfig::new("test"));
        let request = CompletionRequest::new("tenant-1").with_message(ChatMessage::user("Hi"));
        let body = backend.build_request(&ModelConfig::claude_haiku(), &request, true);
        assert_eq!(body.max_tokens, 2048);
        assert_eq!(body.temperature, Some(0.7));
        assert_eq!(body.stream, Some(true));
    }
}
