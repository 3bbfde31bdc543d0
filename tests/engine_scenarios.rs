//! End-to-end scenarios across ingestion, retrieval, and generation.

use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use lorecore::knowledge::{HashEmbedder, KnowledgeStore};
use lorecore::llm::{
    ChatMessage, GenerationResult, LlmManager, LlmProvider, MockProvider, RateLimiter,
};
use lorecore::rag::StreamEvent;
use lorecore::{EngineConfig, EngineError, EnhancedRequest, ProviderKind, RagChatEngine};

async fn rag_engine() -> (RagChatEngine, Arc<LlmManager>, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = KnowledgeStore::with_path(
        dir.path().join("knowledge.db"),
        200,
        Some(Arc::new(HashEmbedder::new(512))),
    )
    .await
    .unwrap();

    let manager = Arc::new(LlmManager::new(EngineConfig::default()));
    manager
        .register(Arc::new(MockProvider::with_limits("mock", 1000, 1_000_000)))
        .await;

    let engine = RagChatEngine::new(manager.clone(), Some(store), EngineConfig::default());
    (engine, manager, dir)
}

/// Always-failing backend for the degradation scenarios.
struct FlakyProvider {
    limiter: RateLimiter,
}

impl FlakyProvider {
    fn new() -> Self {
        Self {
            limiter: RateLimiter::new(60, 40_000),
        }
    }
}

#[async_trait]
impl LlmProvider for FlakyProvider {
    fn name(&self) -> &str {
        "flaky"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Mock
    }

    fn model(&self) -> &str {
        "flaky-1"
    }

    fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    async fn health_check(&self) -> bool {
        false
    }

    async fn generate(&self, _messages: &[ChatMessage]) -> Result<GenerationResult, EngineError> {
        Err(EngineError::Internal("backend unreachable".to_string()))
    }

    async fn stream(
        &self,
        _messages: &[ChatMessage],
    ) -> Result<mpsc::Receiver<Result<String, EngineError>>, EngineError> {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let _ = tx.send(Ok("partial ".to_string())).await;
            let _ = tx
                .send(Err(EngineError::Internal("connection dropped".to_string())))
                .await;
        });
        Ok(rx)
    }
}

#[tokio::test]
async fn rag_round_trip_against_mock_provider() {
    let (engine, _manager, _dir) = rag_engine().await;

    engine
        .ingest(
            "u1",
            "The sky is blue due to Rayleigh scattering.",
            "sky.txt",
            "text",
            None,
        )
        .await
        .unwrap();

    let mut request = EnhancedRequest::new("u1", "why is the sky blue");
    request.rag_top_k = 1;

    let envelope = engine.generate_enhanced_response(request).await;

    assert!(envelope.success);
    assert!(envelope.rag_context_used);
    assert_eq!(envelope.rag_sources_count, 1);
    assert_eq!(envelope.sources.len(), 1);
    assert!(envelope.sources[0].preview.contains("Rayleigh"));
    assert!(envelope.sources[0].similarity >= 0.3);
    assert!(envelope.response.starts_with("[context noted]"));
    assert!(envelope.response.contains("why is the sky blue"));
    assert!(envelope.error.is_none());
    assert!(envelope.total_processing_time >= envelope.llm_generation_time);
}

#[tokio::test]
async fn deletion_removes_retrieval_and_listing() {
    let (engine, _manager, _dir) = rag_engine().await;

    let doc_id = engine
        .ingest(
            "u1",
            "Rust ownership rules prevent data races.",
            "rust.txt",
            "text",
            None,
        )
        .await
        .unwrap();

    let store = engine.store().unwrap();
    assert!(store.delete_document("u1", &doc_id).await.unwrap());

    let results = store.search_knowledge("u1", "ownership", 5, 0.0).await;
    assert!(results.is_empty());
    assert!(store.get_user_documents("u1").await.unwrap().is_empty());

    let stats = engine.stats("u1").await.unwrap();
    assert_eq!(stats.document_count, 0);
    assert_eq!(stats.chunk_count, 0);
    assert!(stats.last_ingested_at.is_none());
    // index positions are append-only; the deleted vector stays orphaned
    assert_eq!(stats.index_size, 1);
}

#[tokio::test]
async fn streaming_emits_context_before_chunks() {
    let (engine, manager, _dir) = rag_engine().await;

    engine
        .ingest(
            "u1",
            "The ocean is salty because rivers carry minerals.",
            "ocean.txt",
            "text",
            None,
        )
        .await
        .unwrap();

    let mut request = EnhancedRequest::new("u1", "why is the ocean salty");
    request.rag_top_k = 1;

    let mut rx = engine.stream_enhanced_response(request).await;

    match rx.recv().await.unwrap() {
        StreamEvent::RagContext {
            sources_count,
            retrieval_time_seconds,
        } => {
            assert_eq!(sources_count, 1);
            assert!(retrieval_time_seconds >= 0.0);
        }
        other => panic!("expected rag_context first, got {:?}", other),
    }

    let mut assembled = String::new();
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::LlmChunk { content } => assembled.push_str(&content),
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert!(assembled.starts_with("[context noted]"));
    assert!(assembled.contains("why is the ocean salty"));

    // the stream closing means the turn has been recorded
    let history = manager.get_conversation_history("u1", None).await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].role, "assistant");
}

#[tokio::test]
async fn provider_failure_keeps_rag_fields_and_apologizes() {
    let dir = TempDir::new().unwrap();
    let store = KnowledgeStore::with_path(
        dir.path().join("knowledge.db"),
        200,
        Some(Arc::new(HashEmbedder::new(512))),
    )
    .await
    .unwrap();

    let manager = Arc::new(LlmManager::new(EngineConfig::default()));
    manager.register(Arc::new(FlakyProvider::new())).await;
    let engine = RagChatEngine::new(manager, Some(store), EngineConfig::default());

    engine
        .ingest("u1", "Glass is an amorphous solid.", "glass.txt", "text", None)
        .await
        .unwrap();

    let envelope = engine
        .generate_enhanced_response(EnhancedRequest::new("u1", "is glass a solid"))
        .await;

    assert!(!envelope.success);
    assert!(envelope.response.starts_with("I'm sorry"));
    assert!(!envelope.response.contains("backend unreachable"));
    assert!(envelope.error.unwrap().contains("backend unreachable"));
    assert!(envelope.rag_context_used);
    assert_eq!(envelope.rag_sources_count, 1);
    assert_eq!(envelope.provider, "flaky");
    assert_eq!(envelope.usage.total_tokens, 0);
}

#[tokio::test]
async fn stream_failure_yields_a_single_terminal_error() {
    let manager = Arc::new(LlmManager::new(EngineConfig::default()));
    manager.register(Arc::new(FlakyProvider::new())).await;
    let engine = RagChatEngine::new(manager, None, EngineConfig::default());

    let mut rx = engine
        .stream_enhanced_response(EnhancedRequest::new("u1", "hello"))
        .await;

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    assert_eq!(events.len(), 3);
    assert!(matches!(
        events[0],
        StreamEvent::RagContext {
            sources_count: 0,
            ..
        }
    ));
    assert!(matches!(events[1], StreamEvent::LlmChunk { ref content } if content == "partial "));
    assert!(matches!(events[2], StreamEvent::Error { .. }));
    let errors = events
        .iter()
        .filter(|event| matches!(event, StreamEvent::Error { .. }))
        .count();
    assert_eq!(errors, 1);
}

#[tokio::test]
async fn history_truncates_to_fifty_messages() {
    let manager = Arc::new(LlmManager::new(EngineConfig::default()));
    manager
        .register(Arc::new(MockProvider::with_limits("mock", 1000, 1_000_000)))
        .await;

    for i in 1..=60 {
        manager
            .generate_response("u1", &format!("m{}", i), Some("c1"), None, None, None)
            .await
            .unwrap();
    }

    let history = manager.get_conversation_history("u1", Some("c1")).await;
    assert_eq!(history.len(), 50);
    assert_eq!(history[0].role, "user");
    assert_eq!(history[0].content, "m36");
    assert_eq!(history[49].role, "assistant");
    assert_eq!(history[49].content, "Echo: m60");
}
