//! OpenAI-compatible chat completion providers.
//!
//! One client covers every backend speaking `/chat/completions`:
//! OpenAI itself, Azure deployments (api-key header + api-version
//! query), Google's compatibility endpoint, and local inference
//! servers.

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

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const GOOGLE_COMPAT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
const AZURE_API_VERSION: &str = "2024-02-01";

pub struct OpenAiCompatProvider {
    name: String,
    config: ProviderConfig,
    base_url: String,
    client: Client,
    limiter: RateLimiter,
}

impl OpenAiCompatProvider {
    pub fn new(name: impl Into<String>, config: ProviderConfig) -> Result<Self, EngineError> {
        let base_url = match (&config.base_url, config.kind) {
            (Some(url), _) => url.trim_end_matches('/').to_string(),
            (None, ProviderKind::OpenAi) => OPENAI_BASE_URL.to_string(),
            (None, ProviderKind::Google) => GOOGLE_COMPAT_BASE_URL.to_string(),
            (None, kind) => {
                return Err(EngineError::BadRequest(format!(
                    "provider kind {:?} requires a base_url",
                    kind
                )))
            }
        };

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

    /// Azure scopes the route by deployment and versions it with a
    /// query parameter; everyone else takes the plain path.
    fn chat_url(&self) -> String {
        match self.config.kind {
            ProviderKind::AzureOpenAi => format!(
                "{}/chat/completions?api-version={}",
                self.base_url,
                self.config.api_version.as_deref().unwrap_or(AZURE_API_VERSION)
            ),
            _ => format!("{}/chat/completions", self.base_url),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match (&self.config.api_key, self.config.kind) {
            (Some(key), ProviderKind::AzureOpenAi) => request.header("api-key", key),
            (Some(key), _) => request.bearer_auth(key),
            (None, _) => request,
        }
    }

    fn request_body(&self, messages: &[ChatMessage], stream: bool) -> Value {
        let wire: Vec<Value> = messages
            .iter()
            .map(|m| json!({ "role": m.role, "content": m.content }))
            .collect();

        let mut body = json!({
            "model": self.config.model,
            "messages": wire,
            "stream": stream,
        });

        if let Some(obj) = body.as_object_mut() {
            if let Some(max) = self.config.max_tokens {
                obj.insert("max_tokens".to_string(), json!(max));
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

    fn parse_usage(&self, payload: &Value, messages: &[ChatMessage], content: &str) -> TokenUsage {
        let read = |key: &str| payload["usage"][key].as_u64().map(|v| v as u32);

        let prompt_tokens = read("prompt_tokens")
            .unwrap_or_else(|| self.estimate_tokens(&joined_content(messages)));
        let completion_tokens =
            read("completion_tokens").unwrap_or_else(|| self.estimate_tokens(content));
        let total_tokens = read("total_tokens").unwrap_or(prompt_tokens + completion_tokens);

        TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }
}

/// Outcome of one SSE line from a chat-completions stream.
#[derive(Debug, PartialEq)]
enum SsePayload {
    Content(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SsePayload {
    if line.is_empty() {
        return SsePayload::Skip;
    }
    if line == "data: [DONE]" {
        return SsePayload::Done;
    }

    let Some(data) = line.strip_prefix("data: ") else {
        return SsePayload::Skip;
    };
    let Ok(json) = serde_json::from_str::<Value>(data) else {
        return SsePayload::Skip;
    };

    match json["choices"][0]["delta"]["content"].as_str() {
        Some(content) if !content.is_empty() => SsePayload::Content(content.to_string()),
        _ => SsePayload::Skip,
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        self.config.kind
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/models", self.base_url);
        match self.authorize(self.client.get(&url)).send().await {
            // Azure serves model listings at the resource root rather
            // than under the deployment path; any HTTP answer counts
            // as reachable there
            Ok(res) => {
                matches!(self.config.kind, ProviderKind::AzureOpenAi)
                    || res.status().is_success()
            }
            Err(_) => false,
        }
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<GenerationResult, EngineError> {
        let res = self
            .authorize(
                self.client
                    .post(self.chat_url())
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
                "chat completion failed ({}): {}",
                status, text
            )));
        }

        let payload: Value = res.json().await.map_err(|err| self.map_send_err(err))?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let usage = self.parse_usage(&payload, messages, &content);

        Ok(GenerationResult { content, usage })
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
    ) -> Result<mpsc::Receiver<Result<String, EngineError>>, EngineError> {
        let res = self
            .authorize(
                self.client
                    .post(self.chat_url())
                    .json(&self.request_body(messages, true)),
            )
            .send()
            .await
            .map_err(|err| self.map_send_err(err))?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(EngineError::Internal(format!(
                "chat stream failed ({}): {}",
                status, text
            )));
        }

        let (tx, rx) = mpsc::channel(32);
        let mut stream = res.bytes_stream();

        tokio::spawn(async move {
            // SSE lines can split across network chunks; hold the tail
            // until its newline arrives
            let mut pending = String::new();

            while let Some(item) = stream.next().await {
                match item {
                    Ok(bytes) => {
                        pending.push_str(&String::from_utf8_lossy(&bytes));

                        while let Some(newline) = pending.find('\n') {
                            let line: String = pending.drain(..=newline).collect();
                            match parse_sse_line(line.trim()) {
                                SsePayload::Content(content) => {
                                    if tx.send(Ok(content)).await.is_err() {
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
