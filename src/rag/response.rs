//! Envelope and event types for the enhanced chat surface.
//!
//! JSON serializability of these shapes is the crate's externally
//! visible contract; field names follow the UI layer's camelCase.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::knowledge::RetrievedChunk;
use crate::llm::TokenUsage;

/// longest content preview carried by a source descriptor
const PREVIEW_MAX_CHARS: usize = 160;

/// Compact descriptor of one retrieved source.
///
/// Carries a bounded preview instead of the chunk text so the envelope
/// stays small no matter how large the ingested chunks are.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSummary {
    pub document_id: String,
    pub chunk_id: String,
    pub similarity: f32,
    pub preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl From<&RetrievedChunk> for SourceSummary {
    fn from(chunk: &RetrievedChunk) -> Self {
        Self {
            document_id: chunk.document_id.clone(),
            chunk_id: chunk.chunk_id.clone(),
            similarity: chunk.similarity,
            preview: preview(&chunk.content),
            metadata: chunk.metadata.clone(),
        }
    }
}

fn preview(content: &str) -> String {
    if content.chars().count() <= PREVIEW_MAX_CHARS {
        return content.to_string();
    }
    let cut: String = content.chars().take(PREVIEW_MAX_CHARS - 3).collect();
    format!("{}...", cut)
}

/// Output envelope of the non-streaming enhanced surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedResponse {
    pub success: bool,
    pub response: String,
    pub provider: String,
    pub model: String,
    pub usage: TokenUsage,
    pub rag_context_used: bool,
    pub rag_sources_count: usize,
    pub sources: Vec<SourceSummary>,
    /// seconds spent in retrieval
    pub rag_retrieval_time: f64,
    /// seconds spent in generation
    pub llm_generation_time: f64,
    pub total_processing_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One event on the enhanced streaming surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// emitted once, before any generation output
    #[serde(rename_all = "camelCase")]
    RagContext {
        sources_count: usize,
        retrieval_time_seconds: f64,
    },
    LlmChunk { content: String },
    /// terminal; at most one per stream
    Error { error: String },
}
