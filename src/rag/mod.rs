//! Retrieval-augmented chat surfaces.
//!
//! [`RagChatEngine`] is the produced interface of the crate: it runs
//! retrieval against the knowledge store, folds the results into a
//! bounded context block, and drives the LLM manager, returning either
//! an [`EnhancedResponse`] envelope or a [`StreamEvent`] stream.

pub mod context;
pub mod engine;
pub mod response;

pub use context::build_context_block;
pub use engine::{EnhancedRequest, RagChatEngine};
pub use response::{EnhancedResponse, SourceSummary, StreamEvent};
