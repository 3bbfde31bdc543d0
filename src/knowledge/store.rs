//! SQLite-backed knowledge store.
//!
//! Owns document and chunk persistence, vector-index position
//! bookkeeping, and user-scoped access checks. Search goes through the
//! `Retriever` facade, which shares this store's pool and index.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;

use crate::core::config::{AppPaths, EngineConfig};
use crate::core::errors::EngineError;

use super::chunker;
use super::embedding::EmbeddingProvider;
use super::index::{l2_normalize, VectorIndex};
use super::retriever::{RetrievedChunk, Retriever};

/// One ingested source document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    /// Stable id derived from identity + content at ingestion time.
    pub document_id: String,
    pub user_id: String,
    pub filename: String,
    pub file_type: String,
    pub file_size_bytes: u64,
    pub chunk_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub ingested_at: String,
}

/// A stored chunk with its ingestion bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub user_id: String,
    pub content: String,
    pub ordinal: usize,
    pub metadata: Option<Value>,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: String,
}

/// Aggregate per-user knowledge statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeStats {
    pub document_count: usize,
    pub chunk_count: usize,
    pub total_size_bytes: u64,
    pub last_ingested_at: Option<String>,
    /// Current in-process index size, shared across users.
    pub index_size: usize,
}

/// Embedder + index pair, present only when embeddings are configured.
///
/// Availability is resolved once at store construction; downstream code
/// checks for `Some` instead of re-probing the provider.
#[derive(Clone)]
pub(crate) struct VectorBackend {
    pub(crate) embedder: Arc<dyn EmbeddingProvider>,
    pub(crate) index: Arc<RwLock<VectorIndex>>,
}

pub struct KnowledgeStore {
    pool: SqlitePool,
    vector: Option<VectorBackend>,
    chunk_size: usize,
}

impl KnowledgeStore {
    pub async fn new(
        paths: &AppPaths,
        config: &EngineConfig,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self, EngineError> {
        Self::with_path(paths.db_path.clone(), config.chunk_size, embedder).await
    }

    pub async fn with_path(
        db_path: PathBuf,
        chunk_size: usize,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self, EngineError> {
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(EngineError::internal)?;

        let vector = embedder.map(|embedder| VectorBackend {
            index: Arc::new(RwLock::new(VectorIndex::new(embedder.dimension()))),
            embedder,
        });

        let store = Self {
            pool,
            vector,
            chunk_size: chunk_size.max(1),
        };
        store.init_schema().await?;
        store.load_index().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), EngineError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                document_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                file_type TEXT NOT NULL DEFAULT 'text',
                file_size_bytes INTEGER NOT NULL DEFAULT 0,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                tags TEXT,
                description TEXT,
                ingested_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(EngineError::internal)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_user ON documents(user_id)")
            .execute(&self.pool)
            .await
            .map_err(EngineError::internal)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chunks (
                chunk_id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                content TEXT NOT NULL,
                ordinal INTEGER NOT NULL DEFAULT 0,
                metadata TEXT DEFAULT '{}',
                embedding BLOB,
                created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(EngineError::internal)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_user ON chunks(user_id)")
            .execute(&self.pool)
            .await
            .map_err(EngineError::internal)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)")
            .execute(&self.pool)
            .await
            .map_err(EngineError::internal)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS index_positions (
                chunk_id TEXT PRIMARY KEY,
                position INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(EngineError::internal)?;

        Ok(())
    }

    /// Replay persisted positions into the in-process index so vector
    /// search survives a restart. A position whose chunk row is gone, or
    /// whose stored embedding no longer matches the index dimension, is
    /// zero-filled so every later position stays valid.
    async fn load_index(&self) -> Result<(), EngineError> {
        let Some(vector) = &self.vector else {
            return Ok(());
        };

        let rows = sqlx::query(
            "SELECT p.position, c.embedding
             FROM index_positions p
             LEFT JOIN chunks c ON c.chunk_id = p.chunk_id
             ORDER BY p.position",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(EngineError::internal)?;

        if rows.is_empty() {
            return Ok(());
        }

        let dimension = vector.embedder.dimension();
        let max_position = rows
            .last()
            .map(|row| row.get::<i64, _>("position"))
            .unwrap_or(0);
        let mut vectors = vec![vec![0.0f32; dimension]; max_position as usize + 1];

        for row in &rows {
            let position: i64 = row.get("position");
            let Some(bytes) = row.get::<Option<Vec<u8>>, _>("embedding") else {
                continue;
            };
            if bytes.is_empty() {
                continue;
            }

            let stored = Self::deserialize_embedding(&bytes);
            if stored.len() != dimension {
                tracing::warn!(
                    "Skipping stored embedding at position {}: dimension {} != {}",
                    position,
                    stored.len(),
                    dimension
                );
                continue;
            }
            vectors[position as usize] = l2_normalize(stored);
        }

        let count = vectors.len();
        let mut index = vector.index.write().await;
        index.add(vectors)?;
        tracing::info!("Rehydrated vector index with {} positions", count);
        Ok(())
    }

    /// Ingest a document: derive a stable id, chunk the content, embed
    /// each chunk, and persist document + chunk rows (plus index
    /// position rows when vectors exist) in one transaction.
    ///
    /// A chunk whose embedding fails is stored without one and stays
    /// reachable through text fallback; the failure never aborts the
    /// ingestion.
    pub async fn ingest_document(
        &self,
        user_id: &str,
        content: &str,
        filename: &str,
        file_type: &str,
        metadata: Option<Value>,
    ) -> Result<String, EngineError> {
        let document_id = Self::derive_document_id(user_id, filename, content.len());
        let chunks = chunker::chunk(content, self.chunk_size);
        let ingested_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

        // Embedding happens before the transaction opens; a network call
        // never runs under the index write lock or an open transaction.
        let mut embedded: Vec<Option<Vec<f32>>> = Vec::with_capacity(chunks.len());
        match &self.vector {
            Some(vector) => {
                for (ordinal, chunk) in chunks.iter().enumerate() {
                    match vector.embedder.embed(chunk).await {
                        Ok(v) => embedded.push(Some(v)),
                        Err(err) => {
                            tracing::warn!(
                                "Embedding failed for chunk {} of {}: {}",
                                ordinal,
                                document_id,
                                err
                            );
                            embedded.push(None);
                        }
                    }
                }
            }
            None => embedded.resize(chunks.len(), None),
        }

        let tags: Option<Vec<String>> = metadata
            .as_ref()
            .and_then(|m| m.get("tags"))
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let description = metadata
            .as_ref()
            .and_then(|m| m.get("description"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let mut tx = self.pool.begin().await.map_err(EngineError::internal)?;

        sqlx::query(
            "INSERT OR REPLACE INTO documents
                 (document_id, user_id, filename, file_type, file_size_bytes,
                  chunk_count, tags, description, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&document_id)
        .bind(user_id)
        .bind(filename)
        .bind(file_type)
        .bind(content.len() as i64)
        .bind(chunks.len() as i64)
        .bind(
            tags.as_ref()
                .map(|t| serde_json::to_string(t).unwrap_or_default()),
        )
        .bind(&description)
        .bind(&ingested_at)
        .execute(&mut *tx)
        .await
        .map_err(EngineError::internal)?;

        let mut indexed: Vec<(String, Vec<f32>)> = Vec::new();

        for (ordinal, (chunk, embedding)) in chunks.iter().zip(&embedded).enumerate() {
            let chunk_id = format!("{}_{}", document_id, ordinal);
            let mut chunk_metadata = metadata.clone().unwrap_or_else(|| json!({}));
            if let Some(map) = chunk_metadata.as_object_mut() {
                map.insert("filename".to_string(), json!(filename));
                map.insert("chunk_ordinal".to_string(), json!(ordinal));
            }
            let blob = embedding.as_deref().map(Self::serialize_embedding);

            sqlx::query(
                "INSERT OR REPLACE INTO chunks
                     (chunk_id, document_id, user_id, content, ordinal, metadata, embedding, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .bind(&chunk_id)
            .bind(&document_id)
            .bind(user_id)
            .bind(chunk)
            .bind(ordinal as i64)
            .bind(chunk_metadata.to_string())
            .bind(&blob)
            .bind(&ingested_at)
            .execute(&mut *tx)
            .await
            .map_err(EngineError::internal)?;

            if let Some(embedding) = embedding {
                indexed.push((chunk_id, l2_normalize(embedding.clone())));
            }
        }

        // The write lock is held across the commit so a concurrent
        // search never resolves a position row whose vector is not in
        // the index yet, and never sees one the rollback would revoke.
        let mut index_guard = None;
        if let Some(vector) = &self.vector {
            if !indexed.is_empty() {
                let mut index = vector.index.write().await;
                let range = index.add(indexed.iter().map(|(_, v)| v.clone()).collect())?;

                for ((chunk_id, _), position) in indexed.iter().zip(range) {
                    sqlx::query(
                        "INSERT OR REPLACE INTO index_positions (chunk_id, position)
                         VALUES (?1, ?2)",
                    )
                    .bind(chunk_id)
                    .bind(position as i64)
                    .execute(&mut *tx)
                    .await
                    .map_err(EngineError::internal)?;
                }
                index_guard = Some(index);
            }
        }

        tx.commit().await.map_err(EngineError::internal)?;
        drop(index_guard);

        tracing::info!(
            "Ingested document {} for user {} ({} chunks)",
            document_id,
            user_id,
            chunks.len()
        );

        Ok(document_id)
    }

    /// Query-time entry point; see `Retriever` for path selection.
    pub async fn search_knowledge(
        &self,
        user_id: &str,
        query: &str,
        top_k: usize,
        min_similarity: f32,
    ) -> Vec<RetrievedChunk> {
        self.retriever()
            .search(user_id, query, top_k, min_similarity)
            .await
    }

    /// Clonable retrieval handle sharing this store's pool and index.
    pub fn retriever(&self) -> Retriever {
        Retriever::new(self.pool.clone(), self.vector.clone())
    }

    /// Documents owned by `user_id`, newest first.
    pub async fn get_user_documents(
        &self,
        user_id: &str,
    ) -> Result<Vec<DocumentMetadata>, EngineError> {
        let rows = sqlx::query(
            "SELECT document_id, user_id, filename, file_type, file_size_bytes,
                    chunk_count, tags, description, ingested_at
             FROM documents
             WHERE user_id = ?1
             ORDER BY ingested_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(EngineError::internal)?;

        Ok(rows.iter().map(Self::row_to_document).collect())
    }

    /// Chunks of one owned document, in ingestion order.
    pub async fn get_document_chunks(
        &self,
        user_id: &str,
        document_id: &str,
    ) -> Result<Vec<KnowledgeChunk>, EngineError> {
        let rows = sqlx::query(
            "SELECT chunk_id, document_id, user_id, content, ordinal, metadata, embedding, created_at
             FROM chunks
             WHERE user_id = ?1 AND document_id = ?2
             ORDER BY ordinal",
        )
        .bind(user_id)
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(EngineError::internal)?;

        Ok(rows.iter().map(Self::row_to_chunk).collect())
    }

    /// Delete a document together with its chunks and position rows.
    ///
    /// The ownership check precedes any mutation; a non-owner (or a
    /// missing document) gets `false` and nothing changes. Index vectors
    /// stay where they are: positions are never reused, and with the
    /// rows gone they are never resolved again.
    pub async fn delete_document(
        &self,
        user_id: &str,
        document_id: &str,
    ) -> Result<bool, EngineError> {
        let owned: Option<String> = sqlx::query_scalar(
            "SELECT document_id FROM documents WHERE document_id = ?1 AND user_id = ?2",
        )
        .bind(document_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(EngineError::internal)?;

        if owned.is_none() {
            return Ok(false);
        }

        let mut tx = self.pool.begin().await.map_err(EngineError::internal)?;

        // document ids are fixed-width hex, so the prefix match is exact
        sqlx::query("DELETE FROM index_positions WHERE chunk_id LIKE ?1 || '%'")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(EngineError::internal)?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?1")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(EngineError::internal)?;

        sqlx::query("DELETE FROM documents WHERE document_id = ?1")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(EngineError::internal)?;

        tx.commit().await.map_err(EngineError::internal)?;

        tracing::info!("Deleted document {} for user {}", document_id, user_id);
        Ok(true)
    }

    /// Aggregate per-user statistics plus the current index size.
    pub async fn get_stats(&self, user_id: &str) -> Result<KnowledgeStats, EngineError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS document_count,
                    COALESCE(SUM(file_size_bytes), 0) AS total_size_bytes,
                    MAX(ingested_at) AS last_ingested_at
             FROM documents
             WHERE user_id = ?1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(EngineError::internal)?;

        let chunk_count = self.count_chunks(user_id).await?;
        let index_size = match &self.vector {
            Some(vector) => vector.index.read().await.len(),
            None => 0,
        };

        Ok(KnowledgeStats {
            document_count: row.get::<i64, _>("document_count") as usize,
            chunk_count,
            total_size_bytes: row.get::<i64, _>("total_size_bytes") as u64,
            last_ingested_at: row.get("last_ingested_at"),
            index_size,
        })
    }

    /// Number of chunks owned by `user_id`.
    pub async fn count_chunks(&self, user_id: &str) -> Result<usize, EngineError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE user_id = ?1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(EngineError::internal)?;

        Ok(count as usize)
    }

    fn derive_document_id(user_id: &str, filename: &str, content_len: usize) -> String {
        let seed = format!(
            "{}:{}:{}:{}",
            user_id,
            filename,
            content_len,
            Utc::now().timestamp_millis()
        );
        let digest = Sha256::digest(seed.as_bytes());
        hex::encode(digest)[..16].to_string()
    }

    fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> DocumentMetadata {
        let tags = row
            .get::<Option<String>, _>("tags")
            .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).ok());

        DocumentMetadata {
            document_id: row.get("document_id"),
            user_id: row.get("user_id"),
            filename: row.get("filename"),
            file_type: row.get("file_type"),
            file_size_bytes: row.get::<i64, _>("file_size_bytes") as u64,
            chunk_count: row.get::<i64, _>("chunk_count") as usize,
            tags,
            description: row.get("description"),
            ingested_at: row.get("ingested_at"),
        }
    }

    fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> KnowledgeChunk {
        let metadata_str: String = row.get("metadata");
        let metadata = serde_json::from_str::<Value>(&metadata_str).ok();
        let embedding = row
            .get::<Option<Vec<u8>>, _>("embedding")
            .filter(|bytes| !bytes.is_empty())
            .map(|bytes| Self::deserialize_embedding(&bytes));

        KnowledgeChunk {
            chunk_id: row.get("chunk_id"),
            document_id: row.get("document_id"),
            user_id: row.get("user_id"),
            content: row.get("content"),
            ordinal: row.get::<i64, _>("ordinal") as usize,
            metadata,
            embedding,
            created_at: row.get("created_at"),
        }
    }
}
