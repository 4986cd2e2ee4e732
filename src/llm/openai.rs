//! OpenAI chat-completions adapter.

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

pub struct OpenAiBackend {
    config: ClientConfig,
    http: Client,
}

impl OpenAiBackend {
    const DEFAULT_BASE_URL: &'static str = "https://api.openai.com";

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
    ) -> OpenAiRequest {
        let mut messages = Vec::new();
        // The system slot is a leading system-role message.
        if let Some(system) = &request.system {
            messages.push(OpenAiMessage {
                role: "system",
                content: system.clone(),
            });
        }
        for m in &request.messages {
            messages.push(OpenAiMessage {
                role: match m.role {
                    ChatRole::System => "system",
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                },
                content: m.content.clone(),
            });
        }

        OpenAiRequest {
            model: model.model_id.clone(),
            messages,
            max_tokens: Some(request.max_tokens_or_default()),
            temperature: Some(request.temperature_or_default()),
            stream: stream.then_some(true),
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    async fn send(&self, body: &OpenAiRequest) -> Result<reqwest::Response> {
        let url = format!("{}/v1/chat/completions", self.base_url());
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport(BackendId::OpenAi, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_ms(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(BackendId::OpenAi, status, &body, retry_after));
        }
        Ok(response)
    }
}

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        Some("tool_calls") => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

// Wire types

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Default, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

impl OpenAiUsage {
    /// Cached prompt tokens are billed at the read discount; the rest of
    /// the prompt is regular input.
    fn into_usage(self) -> TokenUsage {
        let cached = self
            .prompt_tokens_details
            .as_ref()
            .map(|d| d.cached_tokens)
            .unwrap_or(0);
        TokenUsage {
            input_tokens: self.prompt_tokens.saturating_sub(cached),
            output_tokens: self.completion_tokens,
            cache_read_tokens: cached,
            cache_write_tokens: 0,
        }
    }
}

fn parse_response(body: &str) -> Result<RawCompletion> {
    let response: OpenAiResponse = serde_json::from_str(body)
        .map_err(|e| Error::invalid_request(format!("openai response schema: {e}")))?;

    let choice = response
        .choices
        .first()
        .ok_or_else(|| Error::invalid_request("openai response contained no choices"))?;
    let content = choice
        .message
        .content
        .clone()
        .ok_or_else(|| Error::invalid_request("openai response contained no text content"))?;

    Ok(RawCompletion {
        content,
        finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
        usage: response.usage.unwrap_or_default().into_usage(),
    })
}

#[async_trait]
impl BackendClient for OpenAiBackend {
    fn backend_id(&self) -> BackendId {
        BackendId::OpenAi
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
            .map_err(|e| classify_transport(BackendId::OpenAi, e))?;
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
                    Error::backend_unavailable("openai", format!("SSE error: {e}"))
                })?;
                if event.data.trim() == "[DONE]" {
                    break;
                }
                let value: serde_json::Value = match serde_json::from_str(&event.data) {
                    Ok(v) => v,
                    Err(_) => continue,
                };

                if let Some(delta) = value
                    .pointer("/choices/0/delta/content")
                    .and_then(|c| c.as_str())
                {
                    if !delta.is_empty() {
                        yield RawStreamEvent::Delta(delta.to_string());
                    }
                }
                if let Some(reason) = value
                    .pointer("/choices/0/finish_reason")
                    .and_then(|r| r.as_str())
                {
                    finish_reason = map_finish_reason(Some(reason));
                }
                if let Some(u) = value.get("usage").filter(|u| !u.is_null()) {
                    let parsed: OpenAiUsage =
                        serde_json::from_value(u.clone()).unwrap_or_default();
                    usage = parsed.into_usage();
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
