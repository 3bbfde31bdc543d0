//! RAG engine and LLM orchestration core.
//!
//! `lorecore` grounds a conversational assistant in user-private documents.
//! Documents are chunked, embedded, and indexed per user; queries retrieve
//! the most relevant chunks; and the orchestrator fuses retrieved context,
//! rolling conversation history, and a pluggable LLM backend into a single
//! response or a streamed event sequence.
//!
//! The main entry points are:
//! - [`knowledge::store::KnowledgeStore`]: ingestion, document management,
//!   and user-scoped search
//! - [`llm::manager::LlmManager`]: provider registry, conversation history,
//!   and prompt assembly
//! - [`rag::engine::RagChatEngine`]: the orchestrated
//!   retrieve-then-generate surface consumed by the host application

pub mod core;
pub mod knowledge;
pub mod llm;
pub mod rag;

pub use crate::core::config::{AppPaths, EngineConfig, ProviderConfig, ProviderKind};
pub use crate::core::errors::EngineError;
pub use crate::knowledge::store::KnowledgeStore;
pub use crate::llm::manager::LlmManager;
pub use crate::rag::engine::{EnhancedRequest, RagChatEngine};
