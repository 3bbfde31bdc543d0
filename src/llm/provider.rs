use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::config::ProviderKind;
use crate::core::errors::EngineError;

use super::rate_limit::RateLimiter;
use super::types::{ChatMessage, GenerationResult};

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// registry name of this provider instance
    fn name(&self) -> &str;

    /// backend family tag
    fn kind(&self) -> ProviderKind;

    /// model identifier sent to the backend
    fn model(&self) -> &str;

    /// limiter sized from this provider's configuration
    fn rate_limiter(&self) -> &RateLimiter;

    /// rough token estimate; four characters per token unless the
    /// backend knows better. callers treat this as an approximation.
    fn estimate_tokens(&self, text: &str) -> u32 {
        text.chars().count().div_ceil(4) as u32
    }

    /// check if the provider is reachable
    async fn health_check(&self) -> bool;

    /// single-shot completion
    async fn generate(&self, messages: &[ChatMessage]) -> Result<GenerationResult, EngineError>;

    /// streaming completion; fragments arrive in generation order
    async fn stream(
        &self,
        messages: &[ChatMessage],
    ) -> Result<mpsc::Receiver<Result<String, EngineError>>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockProvider;

    #[test]
    fn default_estimate_rounds_up() {
        let provider = MockProvider::new("estimator");
        assert_eq!(provider.estimate_tokens(""), 0);
        assert_eq!(provider.estimate_tokens("abcd"), 1);
        assert_eq!(provider.estimate_tokens("abcde"), 2);
    }
}
