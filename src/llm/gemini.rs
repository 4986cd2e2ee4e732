//! Google Gemini generateContent adapter.

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

pub struct GeminiBackend {
    config: ClientConfig,
    http: Client,
}

impl GeminiBackend {
    const DEFAULT_BASE_URL: &'static str = "https://generativelanguage.googleapis.com";

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

    fn build_request(&self, request: &CompletionRequest) -> GeminiRequest {
        let mut system = request.system.clone().unwrap_or_default();
        let mut contents = Vec::new();
        for m in &request.messages {
            match m.role {
                ChatRole::System => {
                    if !system.is_empty() {
                        system.push_str("\n\n");
                    }
                    system.push_str(&m.content);
                }
                ChatRole::User => contents.push(GeminiContent {
                    role: "user",
                    parts: vec![GeminiPart {
                        text: m.content.clone(),
                    }],
                }),
                ChatRole::Assistant => contents.push(GeminiContent {
                    role: "model",
                    parts: vec![GeminiPart {
                        text: m.content.clone(),
                    }],
                }),
            }
        }

        GeminiRequest {
            contents,
            system_instruction: (!system.is_empty()).then(|| GeminiSystemInstruction {
                parts: vec![GeminiPart { text: system }],
            }),
            generation_config: Some(GeminiGenerationConfig {
                max_output_tokens: Some(request.max_tokens_or_default()),
                temperature: Some(request.temperature_or_default()),
            }),
        }
    }

    async fn send(
        &self,
        model: &ModelConfig,
        body: &GeminiRequest,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let method = if stream {
            "streamGenerateContent?alt=sse&key="
        } else {
            "generateContent?key="
        };
        let url = format!(
            "{}/v1beta/models/{}:{}{}",
            self.base_url(),
            model.model_id,
            method,
            self.config.api_key,
        );

        let response = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport(BackendId::Gemini, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_ms(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(BackendId::Gemini, status, &body, retry_after));
        }
        Ok(response)
    }
}

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") | Some("PROHIBITED_CONTENT") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

// Wire types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: &'static str,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiCandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: Option<u64>,
    #[serde(default)]
    cached_content_token_count: Option<u64>,
}

impl GeminiUsageMetadata {
    fn into_usage(self) -> TokenUsage {
        let cached = self.cached_content_token_count.unwrap_or(0);
        TokenUsage {
            input_tokens: self.prompt_token_count.saturating_sub(cached),
            output_tokens: self.candidates_token_count.unwrap_or(0),
            cache_read_tokens: cached,
            cache_write_tokens: 0,
        }
    }
}

fn parse_response(body: &str) -> Result<RawCompletion> {
    let response: GeminiResponse = serde_json::from_str(body)
        .map_err(|e| Error::invalid_request(format!("gemini response schema: {e}")))?;

    let candidate = response
        .candidates
        .first()
        .ok_or_else(|| Error::invalid_request("gemini response contained no candidates"))?;

    let content: String = candidate
        .content
        .as_ref()
        .map(|c| c.parts.iter().map(|p| p.text.as_str()).collect())
        .unwrap_or_default();
    if content.is_empty() && candidate.finish_reason.as_deref() != Some("SAFETY") {
        return Err(Error::invalid_request(
            "gemini response contained no text content",
        ));
    }

    Ok(RawCompletion {
        content,
        finish_reason: map_finish_reason(candidate.finish_reason.as_deref()),
        usage: response.usage_metadata.unwrap_or_default().into_usage(),
    })
}

#[async_trait]
impl BackendClient for GeminiBackend {
    fn backend_id(&self) -> BackendId {
        BackendId::Gemini
    }

    async fn complete(
        &self,
        model: &ModelConfig,
        request: &CompletionRequest,
    ) -> Result<RawCompletion> {
        let body = self.build_request(request);
        let response = self.send(model, &body, false).await?;
        let text = response
            .text()
            .await
            .map_err(|e| classify_transport(BackendId::Gemini, e))?;
        parse_response(&text)
    }

    async fn stream(
        &self,
        model: &ModelConfig,
        request: &CompletionRequest,
    ) -> Result<RawEventStream> {
        let body = self.build_request(request);
        let response = self.send(model, &body, true).await?;
        let mut events = response.bytes_stream().eventsource();

        let stream = async_stream::try_stream! {
            let mut usage = TokenUsage::default();
            let mut finish_reason = FinishReason::Stop;

            while let Some(event) = events.next().await {
                let event = event.map_err(|e| {
                    Error::backend_unavailable("gemini", format!("SSE error: {e}"))
                })?;
                let chunk: GeminiResponse = match serde_json::from_str(&event.data) {
                    Ok(c) => c,
                    Err(_) => continue,
                };

                if let Some(candidate) = chunk.candidates.first() {
                    if let Some(content) = &candidate.content {
                        for part in &content.parts {
                            if !part.text.is_empty() {
                                yield RawStreamEvent::Delta(part.text.clone());
                            }
                        }
                    }
                    if let Some(reason) = candidate.finish_reason.as_deref() {
                        finish_reason = map_finish_reason(Some(reason));
                    }
                }
                if let Some(metadata) = chunk.usage_metadata {
                    usage = metadata.into_usage();
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
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Bonjour"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {
                "promptTokenCount": 10,
                "candidatesTokenCount": 3,
                "cachedContentTokenCount": 4
            }
        }"#;
        let raw = parse_response(body).unwrap();
        assert_eq!(raw.content, "Bonjour");
        assert_eq!(raw.finish_reason, FinishReason::Stop);
        assert_eq!(raw.usage.input_tokens, 6);
        assert_eq!(raw.usage.cache_read_tokens, 4);
        assert_eq!(raw.usage.output_tokens, 3);
    }

    #[test]
    fn test_no_candidates_is_schema_mismatch() {
        let body = r#"{"candidates": []}"#;
        assert!(matches!(parse_response(body), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("STOP")), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("MAX_TOKENS")), FinishReason::Length);
        assert_eq!(map_finish_reason(Some("SAFETY")), FinishReason::ContentFilter);
        assert_eq!(map_finish_reason(None), FinishReason::Stop);
    }

    #[test]
    fn test_system_routed_to_system_instruction() {
        let backend = GeminiBackend::new(ClientConfig::new("test"));
        let request = CompletionRequest::new("tenant-1")
            .with_system("Answer in French")
            .with_message(ChatMessage::user("Hello"))
            .with_message(ChatMessage::assistant("Bonjour"))
            .with_message(ChatMessage::user("Thanks"));
        let body = backend.build_request(&request);

        assert!(body.system_instruction.is_some());
        assert_eq!(body.contents.len(), 3);
        assert_eq!(body.contents[0].role, "user");
        assert_eq!(body.contents[1].role, "model");
    }
}
