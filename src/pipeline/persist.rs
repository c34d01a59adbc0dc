//! Persist stage: metadata, chunk embeddings, then the `complete` marker.
//!
//! ```text
//! put(doc, PendingEmbeddings) ──▶ embed+upsert chunk 0..n ──▶ dedup complete ──▶ put(doc, Complete)
//! ```
//!
//! Progress is tracked in the job's [`PersistCursor`]. A retry after a
//! failed embedding resumes at the first chunk not yet upserted; nothing
//! upstream runs again. Every write is keyed (document id, chunk id), so a
//! repeated write after a crash overwrites rather than duplicates.
//!
//! The write barrier is the dedup completion: once the URL's record points
//! at the document, every chunk is stored and the `Complete` marker may be
//! written by whoever sees it missing ([`finish_commit`]). Neither write
//! observes cancellation, so a stored-complete document never belongs to a
//! job that reports `CANCELLED`.

use crate::config::IngestConfig;
use crate::document::{ChunkMetadata, DocumentStatus, ExtractedDocument};
use crate::error::{IngestError, StageError, StoreError};
use crate::job::PersistCursor;
use crate::pipeline::suspend;
use crate::store::Stores;
use async_trait::async_trait;
use edgequake_llm::{EmbeddingProvider, ProviderFactory};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Maps chunk text to a fixed-length vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StageError>;
}

/// [`Embedder`] over an `edgequake-llm` embedding provider.
pub struct LlmEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
}

impl LlmEmbedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { provider }
    }

    /// Use `config.embedding_provider`, or auto-detect one from the environment.
    pub fn from_config(config: &IngestConfig) -> Result<Self, IngestError> {
        if let Some(ref provider) = config.embedding_provider {
            return Ok(Self::new(Arc::clone(provider)));
        }
        let (_llm, embedding) =
            ProviderFactory::from_env().map_err(|e| IngestError::ProviderNotConfigured {
                provider: "embedding".to_string(),
                hint: format!(
                    "No embedding provider could be auto-detected from environment.\n\
                    Set OPENAI_API_KEY or pass an embedding provider.\n\
                    Error: {}",
                    e
                ),
            })?;
        Ok(Self::new(embedding))
    }
}

#[async_trait]
impl Embedder for LlmEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StageError> {
        let mut vectors = self
            .provider
            .embed(&[text.to_string()])
            .await
            .map_err(|e| StageError::Embedding {
                detail: e.to_string(),
            })?;
        match vectors.pop() {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(StageError::Embedding {
                detail: "provider returned no vector".to_string(),
            }),
        }
    }
}

/// Run the Persist stage up to, but not including, the `Complete` marker.
///
/// `cursor` is advanced after every durable write, so on error it tells the
/// next attempt where to resume.
pub async fn write_chunks(
    document: &ExtractedDocument,
    cursor: &mut PersistCursor,
    stores: &Stores,
    embedder: &dyn Embedder,
    cancel: &CancellationToken,
) -> Result<(), StageError> {
    let document_id = document.document_id();

    if !cursor.metadata_written {
        suspend(cancel, async {
            stores
                .documents
                .put(document_id, document, DocumentStatus::PendingEmbeddings)
                .await
                .map_err(StageError::from)
        })
        .await?;
        cursor.metadata_written = true;
        debug!(%document_id, "Metadata written (pending embeddings)");
    }

    let chunks = document.chunks();
    if cursor.chunks_upserted > 0 && cursor.chunks_upserted < chunks.len() {
        info!(
            %document_id,
            resume_at = cursor.chunks_upserted,
            total = chunks.len(),
            "Resuming embeddings"
        );
    }
    for chunk in chunks.iter().skip(cursor.chunks_upserted) {
        let vector = suspend(cancel, embedder.embed(&chunk.embedding_input())).await?;
        match cursor.dimension {
            Some(expected) if expected != vector.len() => {
                return Err(StageError::EmbeddingDimension {
                    expected,
                    got: vector.len(),
                });
            }
            _ => {}
        }
        let chunk_id = chunk.chunk_id(document_id);
        let metadata = ChunkMetadata::for_chunk(document, chunk);
        suspend(cancel, async {
            stores
                .vectors
                .upsert(&chunk_id, &vector, &metadata)
                .await
                .map_err(StageError::from)
        })
        .await?;
        cursor.chunks_upserted = chunk.sequence_index + 1;
        cursor.dimension = Some(vector.len());
    }
    Ok(())
}

/// Write the `Complete` marker. Only valid once [`write_chunks`] returned `Ok`
/// and the dedup record points at the document.
pub async fn mark_complete(
    document: &ExtractedDocument,
    cursor: &PersistCursor,
    stores: &Stores,
) -> Result<(), StageError> {
    if !cursor.metadata_written || cursor.chunks_upserted < document.chunks().len() {
        return Err(StageError::Internal(format!(
            "complete marker requested with {}/{} chunks upserted",
            cursor.chunks_upserted,
            document.chunks().len()
        )));
    }
    stores
        .documents
        .put(document.document_id(), document, DocumentStatus::Complete)
        .await?;
    info!(
        document_id = %document.document_id(),
        chunks = document.chunks().len(),
        "Document stored"
    );
    Ok(())
}

/// Write the `Complete` marker of a document the dedup record already
/// points at, if a crash or a store failure left it pending.
///
/// Returns whether the marker had to be written.
pub async fn finish_commit(document_id: Uuid, stores: &Stores) -> Result<bool, StoreError> {
    match stores.documents.get(document_id).await? {
        Some(stored) if stored.status == DocumentStatus::PendingEmbeddings => {
            stores
                .documents
                .put(document_id, &stored.document, DocumentStatus::Complete)
                .await?;
            info!(%document_id, "Committed document marked complete");
            Ok(true)
        }
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::CanonicalUrl;
    use crate::pipeline::normalize::normalize;
    use crate::pipeline::validate::{ValidatedChunk, ValidatedExtraction};
    use crate::store::memory::{MemoryDocumentStore, MemoryVectorStore};
    use crate::store::DocumentStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails every call after the first `ok` calls.
    struct FlakyEmbedder {
        ok: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, StageError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.ok {
                Ok(vec![text.len() as f32, 1.0])
            } else {
                Err(StageError::Embedding {
                    detail: "503".into(),
                })
            }
        }
    }

    fn document(chunks: usize) -> ExtractedDocument {
        let url = CanonicalUrl::parse("https://gov.example/decree-12.pdf").unwrap();
        normalize(
            ValidatedExtraction {
                title: "Decree 12".into(),
                year: 2023,
                issuing_authority: "Ministry".into(),
                chunks: (0..chunks)
                    .map(|i| ValidatedChunk {
                        heading: format!("Article {i}"),
                        text: format!("text {i}"),
                    })
                    .collect(),
            },
            &url.source,
            &url.hash,
        )
    }

    fn stores() -> (Stores, Arc<MemoryDocumentStore>, Arc<MemoryVectorStore>) {
        let documents = Arc::new(MemoryDocumentStore::default());
        let vectors = Arc::new(MemoryVectorStore::default());
        let mut stores = Stores::in_memory();
        stores.documents = documents.clone();
        stores.vectors = vectors.clone();
        (stores, documents, vectors)
    }

    #[tokio::test]
    async fn resumes_at_first_missing_chunk() {
        let doc = document(4);
        let (stores, documents, vectors) = stores();
        let mut cursor = PersistCursor::default();
        let cancel = CancellationToken::new();

        let flaky = FlakyEmbedder {
            ok: 2,
            calls: AtomicUsize::new(0),
        };
        let err = write_chunks(&doc, &mut cursor, &stores, &flaky, &cancel)
            .await
            .unwrap_err();
        assert!(err.kind().is_retryable());
        assert_eq!(
            cursor,
            PersistCursor {
                metadata_written: true,
                chunks_upserted: 2,
                dimension: Some(2),
            }
        );
        let stored = documents.get(doc.document_id()).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::PendingEmbeddings);
        assert!(mark_complete(&doc, &cursor, &stores).await.is_err());

        let healthy = FlakyEmbedder {
            ok: usize::MAX,
            calls: AtomicUsize::new(0),
        };
        write_chunks(&doc, &mut cursor, &stores, &healthy, &cancel)
            .await
            .unwrap();
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 2);
        mark_complete(&doc, &cursor, &stores).await.unwrap();

        assert_eq!(vectors.len().await, 4);
        assert_eq!(documents.len().await, 1);
        let stored = documents.get(doc.document_id()).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Complete);

        let v = vectors
            .get(&format!("{}_3", doc.document_id()))
            .await
            .unwrap();
        assert_eq!(v.metadata.sequence_index, 3);
        assert_eq!(v.vector[0], "Article 3\ntext 3".len() as f32);
    }

    /// Switches to a wider vector after the first chunk.
    struct SwitchingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for SwitchingEmbedder {
        async fn embed(&self, _: &str) -> Result<Vec<f32>, StageError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![0.5; if n == 0 { 3 } else { 4 }])
        }
    }

    #[tokio::test]
    async fn mixed_vector_sizes_are_refused() {
        let doc = document(3);
        let (stores, _documents, vectors) = stores();
        let mut cursor = PersistCursor::default();
        let embedder = SwitchingEmbedder {
            calls: AtomicUsize::new(0),
        };
        let err = write_chunks(&doc, &mut cursor, &stores, &embedder, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, StageError::EmbeddingDimension { expected: 3, got: 4 });
        assert!(!err.kind().is_retryable());
        assert_eq!(cursor.chunks_upserted, 1);
        assert_eq!(vectors.len().await, 1);
    }

    #[tokio::test]
    async fn finish_commit_marks_a_pending_document_once() {
        let doc = document(1);
        let (stores, documents, _vectors) = stores();
        documents
            .put(doc.document_id(), &doc, DocumentStatus::PendingEmbeddings)
            .await
            .unwrap();
        assert!(finish_commit(doc.document_id(), &stores).await.unwrap());
        assert!(!finish_commit(doc.document_id(), &stores).await.unwrap());
        let stored = documents.get(doc.document_id()).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Complete);
    }

    #[tokio::test]
    async fn cancelled_before_first_write_touches_nothing() {
        let doc = document(2);
        let (stores, documents, vectors) = stores();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let embedder = FlakyEmbedder {
            ok: usize::MAX,
            calls: AtomicUsize::new(0),
        };
        let mut cursor = PersistCursor::default();
        let err = write_chunks(&doc, &mut cursor, &stores, &embedder, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, StageError::Cancelled);
        assert!(documents.is_empty().await);
        assert!(vectors.is_empty().await);
    }
}
