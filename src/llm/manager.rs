//! Provider registry, conversation history, and message assembly.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::core::config::EngineConfig;
use crate::core::errors::EngineError;

use super::history::ConversationStore;
use super::provider::LlmProvider;
use super::types::{joined_content, ChatMessage, GenerationResult};

/// instruction attached ahead of a retrieval context block
const CONTEXT_PREAMBLE: &str = "Use the following retrieved context when it is relevant to the \
question. If the context does not cover the question, answer from general knowledge.";

pub struct LlmManager {
    providers: RwLock<HashMap<String, Arc<dyn LlmProvider>>>,
    default_provider: RwLock<Option<String>>,
    history: ConversationStore,
    config: EngineConfig,
}

impl LlmManager {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            default_provider: RwLock::new(None),
            history: ConversationStore::new(),
            config,
        }
    }

    /// Register a provider under its own name; the first registration
    /// becomes the default.
    pub async fn register(&self, provider: Arc<dyn LlmProvider>) {
        let name = provider.name().to_string();
        self.providers.write().await.insert(name.clone(), provider);

        let mut default = self.default_provider.write().await;
        if default.is_none() {
            *default = Some(name);
        }
    }

    pub async fn set_default(&self, name: &str) -> Result<(), EngineError> {
        if !self.providers.read().await.contains_key(name) {
            return Err(EngineError::ProviderUnavailable(name.to_string()));
        }
        *self.default_provider.write().await = Some(name.to_string());
        Ok(())
    }

    /// Resolve a provider by name, or the default when `None`.
    pub async fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn LlmProvider>, EngineError> {
        let name = match name {
            Some(name) => name.to_string(),
            None => self
                .default_provider
                .read()
                .await
                .clone()
                .ok_or_else(|| EngineError::ProviderUnavailable("(default)".to_string()))?,
        };

        self.providers
            .read()
            .await
            .get(&name)
            .cloned()
            .ok_or(EngineError::ProviderUnavailable(name))
    }

    pub async fn list_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot a conversation's stored messages.
    pub async fn get_conversation_history(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
    ) -> Vec<ChatMessage> {
        self.history.history(user_id, conversation_id).await
    }

    /// Remove a conversation. Returns whether one existed.
    pub async fn clear_conversation(&self, user_id: &str, conversation_id: Option<&str>) -> bool {
        self.history.clear(user_id, conversation_id).await
    }

    /// Assemble the provider prompt: system persona first, then the
    /// context instruction when a block is present, the recent history
    /// window, and the new user message last.
    fn build_messages(
        &self,
        message: &str,
        system_prompt: Option<&str>,
        context: Option<&str>,
        history: &[ChatMessage],
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::new();

        let persona = system_prompt.unwrap_or(&self.config.default_system_prompt);
        messages.push(ChatMessage::system(persona));

        if let Some(context) = context {
            messages.push(ChatMessage::system(format!(
                "{}\n\n{}",
                CONTEXT_PREAMBLE, context
            )));
        }

        messages.extend_from_slice(history);
        messages.push(ChatMessage::user(message));
        messages
    }

    /// Run one generation turn.
    ///
    /// The conversation lock is held from history read to append, so
    /// calls for the same key serialize while other keys proceed. The
    /// limiter is checked immediately before the provider call; refusal
    /// is fatal for this turn, with no retry.
    pub async fn generate_response(
        &self,
        user_id: &str,
        message: &str,
        conversation_id: Option<&str>,
        provider_name: Option<&str>,
        system_prompt: Option<&str>,
        context: Option<&str>,
    ) -> Result<GenerationResult, EngineError> {
        let provider = self.resolve(provider_name).await?;

        let entry = self.history.entry(user_id, conversation_id).await;
        let mut conversation = entry.lock().await;

        let window = conversation
            .recent(self.config.prompt_history_window)
            .to_vec();
        let messages = self.build_messages(message, system_prompt, context, &window);

        let estimated = provider.estimate_tokens(&joined_content(&messages));
        if !provider.rate_limiter().can_make_request(estimated).await {
            return Err(EngineError::RateLimitExceeded(provider.name().to_string()));
        }

        let result = provider.generate(&messages).await?;
        provider
            .rate_limiter()
            .record_request(result.usage.total_tokens)
            .await;

        conversation.push(ChatMessage::user(message), self.config.history_limit);
        conversation.push(
            ChatMessage::assistant(result.content.trim_end()),
            self.config.history_limit,
        );

        Ok(result)
    }

    /// Start a streaming turn; fragments arrive on the returned
    /// receiver.
    ///
    /// The conversation lock rides into the forwarder task, so the
    /// history append lands before the key unlocks. A dropped receiver
    /// stops forwarding; the partial turn is still recorded.
    pub async fn stream_response(
        &self,
        user_id: &str,
        message: &str,
        conversation_id: Option<&str>,
        provider_name: Option<&str>,
        system_prompt: Option<&str>,
        context: Option<&str>,
    ) -> Result<mpsc::Receiver<Result<String, EngineError>>, EngineError> {
        let provider = self.resolve(provider_name).await?;

        let entry = self.history.entry(user_id, conversation_id).await;
        let mut conversation = entry.lock_owned().await;

        let window = conversation
            .recent(self.config.prompt_history_window)
            .to_vec();
        let messages = self.build_messages(message, system_prompt, context, &window);

        let estimated = provider.estimate_tokens(&joined_content(&messages));
        if !provider.rate_limiter().can_make_request(estimated).await {
            return Err(EngineError::RateLimitExceeded(provider.name().to_string()));
        }

        let mut upstream = provider.stream(&messages).await?;

        let (tx, rx) = mpsc::channel(32);
        let history_limit = self.config.history_limit;
        let user_message = message.to_string();

        tokio::spawn(async move {
            let mut assembled = String::new();
            let mut failed = false;

            while let Some(item) = upstream.recv().await {
                match item {
                    Ok(fragment) => {
                        assembled.push_str(&fragment);
                        if tx.send(Ok(fragment)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        failed = true;
                        let _ = tx.send(Err(err)).await;
                        break;
                    }
                }
            }

            // no backend usage report on the streaming path; charge the
            // prompt estimate plus what actually arrived
            let used = estimated + provider.estimate_tokens(&assembled);
            provider.rate_limiter().record_request(used).await;

            if !failed && !assembled.is_empty() {
                conversation.push(ChatMessage::user(user_message), history_limit);
                conversation.push(
                    ChatMessage::assistant(assembled.trim_end()),
                    history_limit,
                );
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockProvider;

    fn manager() -> LlmManager {
        LlmManager::new(EngineConfig::default())
    }

    #[tokio::test]
    async fn first_registration_becomes_default() {
        let manager = manager();
        manager.register(Arc::new(MockProvider::new("alpha"))).await;
        manager.register(Arc::new(MockProvider::new("beta"))).await;

        assert_eq!(manager.resolve(None).await.unwrap().name(), "alpha");

        manager.set_default("beta").await.unwrap();
        assert_eq!(manager.resolve(None).await.unwrap().name(), "beta");

        let err = manager.set_default("missing").await.unwrap_err();
        assert!(matches!(err, EngineError::ProviderUnavailable(_)));
        assert_eq!(manager.list_providers().await, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn resolution_failures_are_provider_unavailable() {
        let manager = manager();
        assert!(matches!(
            manager.resolve(None).await.err(),
            Some(EngineError::ProviderUnavailable(_))
        ));

        manager.register(Arc::new(MockProvider::new("only"))).await;
        assert!(matches!(
            manager.resolve(Some("ghost")).await.err(),
            Some(EngineError::ProviderUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn message_assembly_order() {
        let manager = manager();
        let history = vec![
            ChatMessage::user("earlier question"),
            ChatMessage::assistant("earlier answer"),
        ];

        let messages =
            manager.build_messages("now", Some("be terse"), Some("[Source 1]: facts"), &history);

        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[0].content, "be terse");
        assert_eq!(messages[1].role, "system");
        assert!(messages[1].content.contains("[Source 1]: facts"));
        assert_eq!(messages[2].content, "earlier question");
        assert_eq!(messages[3].content, "earlier answer");
        assert_eq!(messages[4].role, "user");
        assert_eq!(messages[4].content, "now");

        // without context there is exactly one system message
        let bare = manager.build_messages("now", None, None, &[]);
        assert_eq!(bare.len(), 2);
        assert_eq!(
            bare[0].content,
            EngineConfig::default().default_system_prompt
        );
    }

    #[tokio::test]
    async fn generation_appends_history_pair() {
        let manager = manager();
        manager.register(Arc::new(MockProvider::new("mock"))).await;

        let first = manager
            .generate_response("alice", "hello", Some("c1"), None, None, None)
            .await
            .unwrap();
        assert_eq!(first.content, "Echo: hello");

        let second = manager
            .generate_response("alice", "again", Some("c1"), None, None, None)
            .await
            .unwrap();
        assert_eq!(second.content, "Echo: again");

        let history = manager.get_conversation_history("alice", Some("c1")).await;
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[1].role, "assistant");
        assert_eq!(history[3].content, "Echo: again");

        // other keys are untouched
        assert!(manager
            .get_conversation_history("alice", None)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn context_reaches_the_provider() {
        let manager = manager();
        manager.register(Arc::new(MockProvider::new("mock"))).await;

        let result = manager
            .generate_response("u", "q", None, None, None, Some("[Source 1] text"))
            .await
            .unwrap();
        assert!(result.content.starts_with("[context noted]"));
    }

    #[tokio::test]
    async fn rate_limit_refusal_is_fatal_and_unrecorded() {
        let manager = manager();
        manager
            .register(Arc::new(MockProvider::with_limits("tight", 1, 40_000)))
            .await;

        manager
            .generate_response("u", "one", None, None, None, None)
            .await
            .unwrap();

        let err = manager
            .generate_response("u", "two", None, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RateLimitExceeded(_)));

        // the refused turn never reached history
        let history = manager.get_conversation_history("u", None).await;
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn streaming_appends_after_the_stream_ends() {
        let manager = manager();
        manager.register(Arc::new(MockProvider::new("mock"))).await;

        let mut rx = manager
            .stream_response("bob", "stream this", None, None, None, None)
            .await
            .unwrap();

        let mut assembled = String::new();
        while let Some(fragment) = rx.recv().await {
            assembled.push_str(&fragment.unwrap());
        }
        assert_eq!(assembled.trim_end(), "Echo: stream this");

        // the receiver closing means the forwarder has finished its
        // append
        let history = manager.get_conversation_history("bob", None).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "Echo: stream this");
    }
}
