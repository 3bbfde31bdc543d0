//! Anthropic messages API provider.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::core::config::{ProviderConfig, ProviderKind};
use crate::core::errors::EngineError;

use super::provider::LlmProvider;
use super::rate_limit::RateLimiter;
use super::types::{joined_content, ChatMessage, GenerationResult, TokenUsage};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
// the messages API rejects requests without an explicit cap
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicProvider {
    name: String,
    config: ProviderConfig,
    base_url: String,
    client: Client,
    limiter: RateLimiter,
}

impl AnthropicProvider {
    pub fn new(name: impl Into<String>, config: ProviderConfig) -> Result<Self, EngineError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        // connect and inter-chunk read timeouts guard against hangs
        // without cutting off an actively-producing stream; `generate`
        // adds a per-request total deadline on top
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .read_timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(EngineError::internal)?;

        let limiter = RateLimiter::new(config.requests_per_minute, config.tokens_per_minute);

        Ok(Self {
            name: name.into(),
            base_url,
            client,
            limiter,
            config,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("anthropic-version", ANTHROPIC_VERSION);
        match &self.config.api_key {
            Some(key) => request.header("x-api-key", key),
            None => request,
        }
    }

    /// System messages move to the top-level `system` field; the
    /// messages array carries only user/assistant turns.
    fn request_body(&self, messages: &[ChatMessage], stream: bool) -> Value {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .collect();
        let wire: Vec<Value> = messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| json!({ "role": m.role, "content": m.content }))
            .collect();

        let mut body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": wire,
            "stream": stream,
        });

        if let Some(obj) = body.as_object_mut() {
            if !system.is_empty() {
                obj.insert("system".to_string(), json!(system.join("\n\n")));
            }
        }

        body
    }

    fn map_send_err(&self, err: reqwest::Error) -> EngineError {
        if err.is_timeout() {
            EngineError::Timeout(self.config.timeout_secs)
        } else {
            EngineError::internal(err)
        }
    }
}

/// Outcome of one SSE line from a messages stream.
#[derive(Debug, PartialEq)]
enum SsePayload {
    Content(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SsePayload {
    // event: lines and blanks carry no payload
    let Some(data) = line.strip_prefix("data: ") else {
        return SsePayload::Skip;
    };
    let Ok(json) = serde_json::from_str::<Value>(data) else {
        return SsePayload::Skip;
    };

    match json["type"].as_str() {
        Some("content_block_delta") => match json["delta"]["text"].as_str() {
            Some(text) if !text.is_empty() => SsePayload::Content(text.to_string()),
            _ => SsePayload::Skip,
        },
        Some("message_stop") => SsePayload::Done,
        _ => SsePayload::Skip,
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/v1/models", self.base_url);
        match self.authorize(self.client.get(&url)).send().await {
            Ok(res) => res.status().is_success(),
            Err(_) => false,
        }
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<GenerationResult, EngineError> {
        let url = format!("{}/v1/messages", self.base_url);
        let res = self
            .authorize(
                self.client
                    .post(&url)
                    .timeout(Duration::from_secs(self.config.timeout_secs))
                    .json(&self.request_body(messages, false)),
            )
            .send()
            .await
            .map_err(|err| self.map_send_err(err))?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(EngineError::Internal(format!(
                "messages request failed ({}): {}",
                status, text
            )));
        }

        let payload: Value = res.json().await.map_err(|err| self.map_send_err(err))?;
        let content = payload["content"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let prompt_tokens = payload["usage"]["input_tokens"]
            .as_u64()
            .map(|v| v as u32)
            .unwrap_or_else(|| self.estimate_tokens(&joined_content(messages)));
        let completion_tokens = payload["usage"]["output_tokens"]
            .as_u64()
            .map(|v| v as u32)
            .unwrap_or_else(|| self.estimate_tokens(&content));

        Ok(GenerationResult {
            content,
            usage: TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
        })
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
    ) -> Result<mpsc::Receiver<Result<String, EngineError>>, EngineError> {
        let url = format!("{}/v1/messages", self.base_url);
        let res = self
            .authorize(self.client.post(&url).json(&self.request_body(messages, true)))
            .send()
            .await
            .map_err(|err| self.map_send_err(err))?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(EngineError::Internal(format!(
                "messages stream failed ({}): {}",
                status, text
            )));
        }

        let (tx, rx) = mpsc::channel(32);
        let mut stream = res.bytes_stream();

        tokio::spawn(async move {
            let mut pending = String::new();

            while let Some(item) = stream.next().await {
                match item {
                    Ok(bytes) => {
                        pending.push_str(&String::from_utf8_lossy(&bytes));

                        while let Some(newline) = pending.find('\n') {
                            let line: String = pending.drain(..=newline).collect();
                            match parse_sse_line(line.trim()) {
                                SsePayload::Content(text) => {
                                    if tx.send(Ok(text)).await.is_err() {
                                        return;
                                    }
                                }
                                SsePayload::Done => return,
                                SsePayload::Skip => {}
                            }
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(EngineError::internal(err))).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
