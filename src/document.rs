//! Extracted documents and the records the stores keep about them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One logical section of a document; the unit of embedding and search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// 0-based position; contiguous across the document.
    pub sequence_index: usize,
    /// May be empty when the model found no section heading.
    pub heading: String,
    /// Never empty.
    pub text: String,
    /// Hex SHA-256 of `heading` + `\n` + `text` after normalisation.
    pub content_hash: String,
}

impl Chunk {
    /// Vector-store key: stable for a given document and position, so a
    /// repeated upsert overwrites instead of duplicating.
    pub fn chunk_id(&self, document_id: Uuid) -> String {
        format!("{document_id}_{}", self.sequence_index)
    }

    /// Text sent to the embedding model.
    pub fn embedding_input(&self) -> String {
        if self.heading.is_empty() {
            self.text.clone()
        } else {
            format!("{}\n{}", self.heading, self.text)
        }
    }
}

/// A validated, normalised document. Built only by the Normalize stage and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    document_id: Uuid,
    source_url: String,
    url_hash: String,
    title: String,
    year: i32,
    issuing_authority: String,
    chunks: Vec<Chunk>,
}

impl ExtractedDocument {
    pub(crate) fn new(
        document_id: Uuid,
        source_url: String,
        url_hash: String,
        title: String,
        year: i32,
        issuing_authority: String,
        chunks: Vec<Chunk>,
    ) -> Self {
        Self {
            document_id,
            source_url,
            url_hash,
            title,
            year,
            issuing_authority,
            chunks,
        }
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn url_hash(&self) -> &str {
        &self.url_hash
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn issuing_authority(&self) -> &str {
        &self.issuing_authority
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }
}

/// Lifecycle of a document-store record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentStatus {
    /// Metadata written, chunk embeddings not all upserted yet.
    PendingEmbeddings,
    /// Every chunk embedding is durably stored.
    Complete,
}

/// What the document store holds for one document id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub document: ExtractedDocument,
    pub status: DocumentStatus,
    pub updated_at: DateTime<Utc>,
}

/// Payload stored next to each chunk vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub document_id: Uuid,
    pub url_hash: String,
    pub sequence_index: usize,
    pub heading: String,
    pub content_hash: String,
}

impl ChunkMetadata {
    pub fn for_chunk(document: &ExtractedDocument, chunk: &Chunk) -> Self {
        Self {
            document_id: document.document_id(),
            url_hash: document.url_hash().to_string(),
            sequence_index: chunk.sequence_index,
            heading: chunk.heading.clone(),
            content_hash: chunk.content_hash.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(heading: &str) -> Chunk {
        Chunk {
            sequence_index: 3,
            heading: heading.into(),
            text: "Article text".into(),
            content_hash: "h".into(),
        }
    }

    #[test]
    fn embedding_input_includes_heading_when_present() {
        assert_eq!(chunk("Article 1").embedding_input(), "Article 1\nArticle text");
        assert_eq!(chunk("").embedding_input(), "Article text");
    }

    #[test]
    fn chunk_id_is_stable() {
        let id = Uuid::new_v4();
        assert_eq!(chunk("").chunk_id(id), format!("{id}_3"));
        assert_eq!(chunk("").chunk_id(id), chunk("x").chunk_id(id));
    }

    #[test]
    fn status_serialises_kebab_case() {
        let s = serde_json::to_string(&DocumentStatus::PendingEmbeddings).unwrap();
        assert_eq!(s, "\"pending-embeddings\"");
    }
}
