//! Document ingestion, embedding, and user-scoped retrieval.
//!
//! This module provides:
//! - `chunker`: greedy word-accumulation splitting
//! - `EmbeddingProvider`: the optional text-to-vector port
//! - `VectorIndex`: an append-only flat index over normalized vectors
//! - `KnowledgeStore`: document/chunk persistence and bookkeeping
//! - `Retriever`: the query-time facade with text-search fallback

pub mod chunker;
pub mod embedding;
pub mod index;
pub mod retriever;
pub mod store;

pub use embedding::{EmbeddingProvider, HashEmbedder, HttpEmbeddingProvider};
pub use index::VectorIndex;
pub use retriever::{RetrievalMode, RetrievedChunk, Retriever};
pub use store::{DocumentMetadata, KnowledgeChunk, KnowledgeStats, KnowledgeStore};
