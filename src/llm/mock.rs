//! Deterministic offline provider.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::config::ProviderKind;
use crate::core::errors::EngineError;

use super::provider::LlmProvider;
use super::rate_limit::RateLimiter;
use super::types::{joined_content, ChatMessage, GenerationResult, TokenUsage};

/// Echo provider for tests and offline operation.
///
/// The reply names the last user message and notes whether a context
/// block was supplied, so assertions can see exactly what reached the
/// provider. Usage figures come from the char/4 estimate.
pub struct MockProvider {
    name: String,
    model: String,
    limiter: RateLimiter,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_limits(name, 60, 40_000)
    }

    pub fn with_limits(
        name: impl Into<String>,
        requests_per_minute: u32,
        tokens_per_minute: u32,
    ) -> Self {
        Self {
            name: name.into(),
            model: "mock-echo-1".to_string(),
            limiter: RateLimiter::new(requests_per_minute, tokens_per_minute),
        }
    }

    fn compose_reply(messages: &[ChatMessage]) -> String {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("");
        // a second system message is the retrieval context block
        let has_context = messages.iter().filter(|m| m.role == "system").count() >= 2;

        if has_context {
            format!("[context noted] Echo: {}", last_user)
        } else {
            format!("Echo: {}", last_user)
        }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Mock
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<GenerationResult, EngineError> {
        let content = Self::compose_reply(messages);
        let prompt_tokens = self.estimate_tokens(&joined_content(messages));
        let completion_tokens = self.estimate_tokens(&content);

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
        let reply = Self::compose_reply(messages);
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            for word in reply.split_whitespace() {
                if tx.send(Ok(format!("{} ", word))).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}
