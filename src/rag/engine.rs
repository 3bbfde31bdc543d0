//! RAG chat orchestrator.
//!
//! Ties retrieval, context assembly, and generation into the two
//! surfaces the UI layer consumes. A call moves through retrieve,
//! build context, generate, and assemble; retrieval is skipped
//! entirely when RAG is off or no retriever is attached, and
//! generation failures are absorbed into the envelope instead of
//! surfacing provider errors as visible text.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::config::EngineConfig;
use crate::core::errors::EngineError;
use crate::knowledge::{KnowledgeStats, KnowledgeStore, RetrievedChunk, Retriever};
use crate::llm::{LlmManager, TokenUsage};

use super::context::build_context_block;
use super::response::{EnhancedResponse, SourceSummary, StreamEvent};

/// response text shown to the user when generation fails
const APOLOGY: &str =
    "I'm sorry, I ran into a problem while generating a response. Please try again in a moment.";

fn default_use_rag() -> bool {
    true
}

fn default_rag_top_k() -> usize {
    5
}

/// Parameters of one enhanced chat turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedRequest {
    pub user_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default = "default_use_rag")]
    pub use_rag: bool,
    #[serde(default = "default_rag_top_k")]
    pub rag_top_k: usize,
}

impl EnhancedRequest {
    pub fn new(user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            message: message.into(),
            conversation_id: None,
            provider: None,
            system_prompt: None,
            use_rag: default_use_rag(),
            rag_top_k: default_rag_top_k(),
        }
    }
}

pub struct RagChatEngine {
    manager: Arc<LlmManager>,
    store: Option<KnowledgeStore>,
    retriever: Option<Retriever>,
    config: EngineConfig,
}

impl RagChatEngine {
    /// Build the engine; without a knowledge store every turn runs as
    /// a plain LLM conversation.
    pub fn new(
        manager: Arc<LlmManager>,
        store: Option<KnowledgeStore>,
        config: EngineConfig,
    ) -> Self {
        let retriever = store.as_ref().map(|store| store.retriever());
        Self {
            manager,
            store,
            retriever,
            config,
        }
    }

    pub fn store(&self) -> Option<&KnowledgeStore> {
        self.store.as_ref()
    }

    /// Ingest a document through the attached knowledge store.
    pub async fn ingest(
        &self,
        user_id: &str,
        content: &str,
        filename: &str,
        file_type: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<String, EngineError> {
        let Some(store) = &self.store else {
            return Err(EngineError::BadRequest(
                "no knowledge store attached".to_string(),
            ));
        };
        store
            .ingest_document(user_id, content, filename, file_type, metadata)
            .await
    }

    /// Knowledge statistics for one user.
    pub async fn stats(&self, user_id: &str) -> Result<KnowledgeStats, EngineError> {
        let Some(store) = &self.store else {
            return Err(EngineError::BadRequest(
                "no knowledge store attached".to_string(),
            ));
        };
        store.get_stats(user_id).await
    }

    async fn retrieve(&self, request: &EnhancedRequest) -> (Vec<RetrievedChunk>, f64) {
        if !request.use_rag {
            return (Vec::new(), 0.0);
        }
        let Some(retriever) = &self.retriever else {
            return (Vec::new(), 0.0);
        };

        let started = Instant::now();
        let results = retriever
            .search(
                &request.user_id,
                &request.message,
                request.rag_top_k,
                self.config.min_similarity,
            )
            .await;
        (results, started.elapsed().as_secs_f64())
    }

    async fn provider_labels(&self, request: &EnhancedRequest) -> (String, String) {
        match self.manager.resolve(request.provider.as_deref()).await {
            Ok(provider) => (provider.name().to_string(), provider.model().to_string()),
            Err(_) => (
                request
                    .provider
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
                "unknown".to_string(),
            ),
        }
    }

    /// Run one enhanced turn and assemble the response envelope.
    ///
    /// This never returns an error: generation failures come back as
    /// `success = false` with an apology as the visible text and the
    /// raw message in `error`.
    pub async fn generate_enhanced_response(&self, request: EnhancedRequest) -> EnhancedResponse {
        let overall = Instant::now();

        let (results, rag_retrieval_time) = self.retrieve(&request).await;
        let context = build_context_block(
            &results,
            self.config.context_window_size,
            self.config.max_context_chunks,
        );
        let sources: Vec<SourceSummary> = results.iter().map(SourceSummary::from).collect();

        let (provider, model) = self.provider_labels(&request).await;

        let generation_started = Instant::now();
        let outcome = self
            .manager
            .generate_response(
                &request.user_id,
                &request.message,
                request.conversation_id.as_deref(),
                request.provider.as_deref(),
                request.system_prompt.as_deref(),
                context.as_deref(),
            )
            .await;
        let llm_generation_time = generation_started.elapsed().as_secs_f64();

        match outcome {
            Ok(result) => EnhancedResponse {
                success: true,
                response: result.content,
                provider,
                model,
                usage: result.usage,
                rag_context_used: context.is_some(),
                rag_sources_count: results.len(),
                sources,
                rag_retrieval_time,
                llm_generation_time,
                total_processing_time: overall.elapsed().as_secs_f64(),
                error: None,
            },
            Err(err) => {
                tracing::error!("Enhanced generation failed: {}", err);
                EnhancedResponse {
                    success: false,
                    response: APOLOGY.to_string(),
                    provider,
                    model,
                    usage: TokenUsage::default(),
                    rag_context_used: context.is_some(),
                    rag_sources_count: results.len(),
                    sources,
                    rag_retrieval_time,
                    llm_generation_time,
                    total_processing_time: overall.elapsed().as_secs_f64(),
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Run one enhanced turn as an event stream.
    ///
    /// The first event is always `rag_context`, even with zero
    /// sources. Fragments follow in arrival order; a failure produces
    /// exactly one terminal `error` event. Dropping the receiver stops
    /// the forwarder and releases the provider stream.
    pub async fn stream_enhanced_response(
        &self,
        request: EnhancedRequest,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(32);

        let (results, retrieval_time) = self.retrieve(&request).await;
        let context = build_context_block(
            &results,
            self.config.context_window_size,
            self.config.max_context_chunks,
        );

        // the buffered channel lets this land before the receiver is
        // handed back
        let _ = tx
            .send(StreamEvent::RagContext {
                sources_count: results.len(),
                retrieval_time_seconds: retrieval_time,
            })
            .await;

        let upstream = self
            .manager
            .stream_response(
                &request.user_id,
                &request.message,
                request.conversation_id.as_deref(),
                request.provider.as_deref(),
                request.system_prompt.as_deref(),
                context.as_deref(),
            )
            .await;

        match upstream {
            Ok(mut fragments) => {
                tokio::spawn(async move {
                    while let Some(item) = fragments.recv().await {
                        let event = match item {
                            Ok(content) => StreamEvent::LlmChunk { content },
                            Err(err) => {
                                let _ = tx.send(StreamEvent::Error {
                                    error: err.to_string(),
                                })
                                .await;
                                return;
                            }
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                });
            }
            Err(err) => {
                tracing::error!("Enhanced stream failed to start: {}", err);
                let _ = tx
                    .send(StreamEvent::Error {
                        error: err.to_string(),
                    })
                    .await;
            }
        }

        rx
    }
}
