//! Language-model providers and orchestration.
//!
//! [`LlmManager`] owns the provider registry and per-conversation
//! history; the provider modules implement the [`LlmProvider`] trait
//! for concrete backends.

pub mod anthropic;
pub mod history;
pub mod manager;
pub mod mock;
pub mod openai;
pub mod provider;
pub mod rate_limit;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use history::{Conversation, ConversationStore};
pub use manager::LlmManager;
pub use mock::MockProvider;
pub use openai::OpenAiCompatProvider;
pub use provider::LlmProvider;
pub use rate_limit::RateLimiter;
pub use types::{ChatMessage, GenerationResult, TokenUsage};
