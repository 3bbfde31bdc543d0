//! Query-time retrieval facade.
//!
//! Picks the vector path when an embedder is configured and the index
//! has content, otherwise (or on any vector-path error) runs a
//! user-scoped substring search. Retrieval degradation never reaches
//! the caller.

use serde::Serialize;
use serde_json::Value;
use sqlx::{Row, SqlitePool};

use crate::core::errors::EngineError;

use super::index::l2_normalize;
use super::store::VectorBackend;

/// Similarity attached to text-fallback hits. No true score exists on
/// that path, so this value is not comparable with vector scores.
const FALLBACK_SIMILARITY: f32 = 0.5;

/// One ranked retrieval hit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub metadata: Option<Value>,
    pub similarity: f32,
}

/// Search strategy, selected once per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalMode {
    Vector,
    TextFallback,
}

/// Clonable query handle sharing the store's pool and index.
#[derive(Clone)]
pub struct Retriever {
    pool: SqlitePool,
    vector: Option<VectorBackend>,
}

impl Retriever {
    pub(crate) fn new(pool: SqlitePool, vector: Option<VectorBackend>) -> Self {
        Self { pool, vector }
    }

    /// The path the next search would take.
    pub async fn mode(&self) -> RetrievalMode {
        match &self.vector {
            Some(vector) if !vector.index.read().await.is_empty() => RetrievalMode::Vector,
            _ => RetrievalMode::TextFallback,
        }
    }

    /// Search `user_id`'s chunks, descending similarity, at most `top_k`
    /// results. Retrieval never raises: vector-path errors degrade to the
    /// text path with a warning, and a text-path error yields no results.
    pub async fn search(
        &self,
        user_id: &str,
        query: &str,
        top_k: usize,
        min_similarity: f32,
    ) -> Vec<RetrievedChunk> {
        let top_k = top_k.max(1);

        let outcome = match self.mode().await {
            RetrievalMode::Vector => {
                match self
                    .vector_search(user_id, query, top_k, min_similarity)
                    .await
                {
                    Ok(results) => Ok(results),
                    Err(err) => {
                        tracing::warn!(
                            "Vector search failed: {}; falling back to text search",
                            err
                        );
                        self.text_search(user_id, query, top_k).await
                    }
                }
            }
            RetrievalMode::TextFallback => self.text_search(user_id, query, top_k).await,
        };

        outcome.unwrap_or_else(|err| {
            tracing::warn!("Text search failed: {}; returning no results", err);
            Vec::new()
        })
    }

    /// Embed the query and resolve index hits back to owned chunk rows.
    ///
    /// The index is shared across users, so it is over-fetched at
    /// `2 * top_k` and hits are re-checked against `user_id`; rejected
    /// candidates cost nothing but the over-fetch margin.
    async fn vector_search(
        &self,
        user_id: &str,
        query: &str,
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<RetrievedChunk>, EngineError> {
        let Some(vector) = &self.vector else {
            return Err(EngineError::EmbeddingUnavailable);
        };

        let embedded = l2_normalize(vector.embedder.embed(query).await?);

        let hits = {
            let index = vector.index.read().await;
            let fetch_k = top_k.saturating_mul(2).min(index.len());
            index.search(&embedded, fetch_k)
        };

        let mut results = Vec::new();
        for (score, position) in hits {
            // scores are descending; nothing past the first miss can
            // pass the floor
            if score < min_similarity {
                break;
            }

            let row = sqlx::query(
                "SELECT c.chunk_id, c.document_id, c.content, c.metadata
                 FROM index_positions p
                 JOIN chunks c ON c.chunk_id = p.chunk_id
                 WHERE p.position = ?1 AND c.user_id = ?2",
            )
            .bind(position as i64)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(EngineError::internal)?;

            // None covers other users' chunks and orphaned positions
            let Some(row) = row else { continue };
            results.push(Self::row_to_result(&row, score));

            if results.len() >= top_k {
                break;
            }
        }

        Ok(results)
    }

    async fn text_search(
        &self,
        user_id: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, EngineError> {
        let pattern = format!("%{}%", query.trim());
        if pattern == "%%" {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT chunk_id, document_id, content, metadata
             FROM chunks
             WHERE user_id = ?1 AND content LIKE ?2
             ORDER BY created_at DESC
             LIMIT ?3",
        )
        .bind(user_id)
        .bind(&pattern)
        .bind(top_k as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(EngineError::internal)?;

        Ok(rows
            .iter()
            .map(|row| Self::row_to_result(row, FALLBACK_SIMILARITY))
            .collect())
    }

    fn row_to_result(row: &sqlx::sqlite::SqliteRow, similarity: f32) -> RetrievedChunk {
        let metadata_str: String = row.get("metadata");

        RetrievedChunk {
            chunk_id: row.get("chunk_id"),
            document_id: row.get("document_id"),
            content: row.get("content"),
            metadata: serde_json::from_str(&metadata_str).ok(),
            similarity,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::knowledge::embedding::{EmbeddingProvider, HashEmbedder};
    use crate::knowledge::store::KnowledgeStore;

    async fn test_store(embedder: Option<Arc<dyn EmbeddingProvider>>) -> KnowledgeStore {
        let tmp = std::env::temp_dir().join(format!(
            "lorecore-retriever-test-{}.db",
            uuid::Uuid::new_v4()
        ));
        KnowledgeStore::with_path(tmp, 80, embedder).await.unwrap()
    }

    struct FailingEmbedder;

    #[async_trait::async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EngineError> {
            Err(EngineError::Internal("embedder offline".to_string()))
        }

        fn dimension(&self) -> usize {
            512
        }

        fn model(&self) -> &str {
            "failing"
        }
    }

    #[tokio::test]
    async fn mode_follows_capability_and_index() {
        let plain = test_store(None).await;
        assert_eq!(plain.retriever().mode().await, RetrievalMode::TextFallback);

        let vectored = test_store(Some(Arc::new(HashEmbedder::new(64)))).await;
        let retriever = vectored.retriever();
        assert_eq!(retriever.mode().await, RetrievalMode::TextFallback);

        vectored
            .ingest_document("user-1", "some indexed text", "a.txt", "text", None)
            .await
            .unwrap();
        assert_eq!(retriever.mode().await, RetrievalMode::Vector);
    }

    #[tokio::test]
    async fn vector_search_ranks_and_applies_floor() {
        let store = test_store(Some(Arc::new(HashEmbedder::new(512)))).await;

        let sky_doc = store
            .ingest_document("user-1", "the sky is blue today", "sky.txt", "text", None)
            .await
            .unwrap();
        store
            .ingest_document(
                "user-1",
                "grass green spring garden flowers",
                "grass.txt",
                "text",
                None,
            )
            .await
            .unwrap();
        store
            .ingest_document(
                "user-1",
                "markets fell sharply yesterday evening",
                "stocks.txt",
                "text",
                None,
            )
            .await
            .unwrap();

        let retriever = store.retriever();
        let results = retriever.search("user-1", "blue sky", 2, 0.0).await;

        assert!(!results.is_empty());
        assert!(results.len() <= 2);
        assert_eq!(results[0].document_id, sky_doc);
        assert!(results
            .windows(2)
            .all(|pair| pair[0].similarity >= pair[1].similarity));

        // a floor above any achievable overlap yields nothing
        let strict = retriever.search("user-1", "blue sky", 2, 0.9).await;
        assert!(strict.is_empty());
    }

    #[tokio::test]
    async fn cross_user_hits_are_filtered_out() {
        let store = test_store(Some(Arc::new(HashEmbedder::new(512)))).await;

        store
            .ingest_document("user-a", "the sky is blue", "a1.txt", "text", None)
            .await
            .unwrap();
        store
            .ingest_document("user-a", "the sky is very blue", "a2.txt", "text", None)
            .await
            .unwrap();
        let b_doc = store
            .ingest_document("user-b", "the sky is blue at noon", "b.txt", "text", None)
            .await
            .unwrap();

        let results = store
            .retriever()
            .search("user-b", "blue sky", 2, 0.0)
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document_id, b_doc);
    }

    #[tokio::test]
    async fn fallback_substring_search_is_user_scoped_and_recent_first() {
        let store = test_store(None).await;

        store
            .ingest_document("user-1", "Rust ownership rules", "rust1.txt", "text", None)
            .await
            .unwrap();
        store
            .ingest_document("user-1", "Rust borrowing guide", "rust2.txt", "text", None)
            .await
            .unwrap();
        store
            .ingest_document("user-2", "Rust for someone else", "other.txt", "text", None)
            .await
            .unwrap();

        let retriever = store.retriever();
        let results = retriever.search("user-1", "Rust", 5, 0.3).await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.similarity == FALLBACK_SIMILARITY));
        assert_eq!(results[0].content, "Rust borrowing guide");

        let empty = retriever.search("user-1", "   ", 5, 0.3).await;
        assert!(empty.is_empty());

        let none = retriever.search("user-1", "quantum", 5, 0.3).await;
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn huge_top_k_does_not_overflow() {
        let store = test_store(Some(Arc::new(HashEmbedder::new(512)))).await;
        store
            .ingest_document("user-1", "the sky is blue", "sky.txt", "text", None)
            .await
            .unwrap();

        // top_k arrives unvalidated from request JSON
        let results = store
            .retriever()
            .search("user-1", "blue sky", usize::MAX, 0.0)
            .await;
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn vector_failure_falls_back_to_text() {
        let store = test_store(Some(Arc::new(HashEmbedder::new(512)))).await;
        store
            .ingest_document("user-1", "fallback target text", "f.txt", "text", None)
            .await
            .unwrap();

        // same pool and populated index, but an embedder that fails at
        // query time
        let healthy = store.retriever();
        let broken = Retriever::new(
            healthy.pool.clone(),
            Some(VectorBackend {
                embedder: Arc::new(FailingEmbedder),
                index: healthy.vector.as_ref().unwrap().index.clone(),
            }),
        );
        assert_eq!(broken.mode().await, RetrievalMode::Vector);

        let results = broken.search("user-1", "fallback", 3, 0.0).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].similarity, FALLBACK_SIMILARITY);
        assert_eq!(results[0].content, "fallback target text");
    }
}
