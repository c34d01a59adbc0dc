//! In-memory store backend.
//!
//! Correct for a single process only: the dedup claim is atomic because
//! every operation runs under one `tokio::sync::Mutex`. Workers in separate
//! processes need the [`super::fs`] backend or a transactional database.

use super::{Claim, ClaimResult, DedupRecord, DedupStore, DocumentStore, JobStore, VectorStore};
use crate::document::{ChunkMetadata, DocumentStatus, ExtractedDocument, StoredDocument};
use crate::error::StoreError;
use crate::job::IngestionJob;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct MemoryDedupStore {
    records: Mutex<HashMap<String, DedupRecord>>,
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn try_claim(&self, url_hash: &str, job_id: Uuid) -> Result<ClaimResult, StoreError> {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.get(url_hash) {
            return Ok(ClaimResult::Existing(existing.clone()));
        }
        records.insert(url_hash.to_string(), DedupRecord::new(url_hash, Claim::new(job_id)));
        Ok(ClaimResult::Claimed)
    }

    async fn renew(&self, url_hash: &str, claim: Claim) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        Ok(records.get_mut(url_hash).is_some_and(|r| r.renew(claim)))
    }

    async fn reclaim(
        &self,
        url_hash: &str,
        held: Claim,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        Ok(records
            .get_mut(url_hash)
            .is_some_and(|r| r.reclaim(held, stale_before)))
    }

    async fn complete(
        &self,
        url_hash: &str,
        claim: Claim,
        document_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(url_hash).ok_or_else(|| StoreError::Conflict {
            key: url_hash.to_string(),
            detail: format!("no claim held by job {}", claim.job_id),
        })?;
        record.complete(claim, document_id).map(|_| ())
    }

    async fn release(&self, url_hash: &str, claim: Claim) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        if records.get(url_hash).is_some_and(|r| r.held_by(claim)) {
            records.remove(url_hash);
            return Ok(true);
        }
        Ok(false)
    }

    async fn get(&self, url_hash: &str) -> Result<Option<DedupRecord>, StoreError> {
        Ok(self.records.lock().await.get(url_hash).cloned())
    }
}

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<Uuid, StoredDocument>>,
}

impl MemoryDocumentStore {
    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn put(
        &self,
        document_id: Uuid,
        document: &ExtractedDocument,
        status: DocumentStatus,
    ) -> Result<(), StoreError> {
        self.documents.write().await.insert(
            document_id,
            StoredDocument {
                document: document.clone(),
                status,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, document_id: Uuid) -> Result<Option<StoredDocument>, StoreError> {
        Ok(self.documents.read().await.get(&document_id).cloned())
    }

    async fn find_by_url_hash(&self, url_hash: &str) -> Result<Vec<StoredDocument>, StoreError> {
        Ok(self
            .documents
            .read()
            .await
            .values()
            .filter(|d| d.document.url_hash() == url_hash)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredVector {
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Default)]
pub struct MemoryVectorStore {
    vectors: RwLock<HashMap<String, StoredVector>>,
}

impl MemoryVectorStore {
    pub async fn get(&self, chunk_id: &str) -> Option<StoredVector> {
        self.vectors.read().await.get(chunk_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.vectors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.vectors.read().await.is_empty()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(
        &self,
        chunk_id: &str,
        vector: &[f32],
        metadata: &ChunkMetadata,
    ) -> Result<(), StoreError> {
        self.vectors.write().await.insert(
            chunk_id.to_string(),
            StoredVector {
                vector: vector.to_vec(),
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, IngestionJob>>,
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, job: &IngestionJob) -> Result<(), StoreError> {
        self.jobs.write().await.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<IngestionJob>, StoreError> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn list_unfinished(&self) -> Result<Vec<IngestionJob>, StoreError> {
        let mut jobs: Vec<IngestionJob> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| !j.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DedupTarget;
    use chrono::Duration;
    use std::sync::Arc;

    fn in_flight(job_id: Uuid) -> Option<Claim> {
        Some(Claim::new(job_id))
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = MemoryDedupStore::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(store.try_claim("h", a).await.unwrap(), ClaimResult::Claimed);
        match store.try_claim("h", b).await.unwrap() {
            ClaimResult::Existing(r) => assert_eq!(r.target.claim(), in_flight(a)),
            other => panic!("expected existing claim, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let store = Arc::new(MemoryDedupStore::default());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.try_claim("same", Uuid::new_v4()).await.unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() == ClaimResult::Claimed {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn completed_record_is_immutable() {
        let store = MemoryDedupStore::default();
        let job = Claim::new(Uuid::new_v4());
        let doc = Uuid::new_v4();
        store.try_claim("h", job.job_id).await.unwrap();
        store.complete("h", job, doc).await.unwrap();
        // idempotent repeat
        store.complete("h", job, doc).await.unwrap();
        // different document is refused
        assert!(store.complete("h", job, Uuid::new_v4()).await.is_err());
        // completed records are never released
        assert!(!store.release("h", job).await.unwrap());
        assert_eq!(
            store.get("h").await.unwrap().unwrap().target,
            DedupTarget::Completed { document_id: doc }
        );
    }

    #[tokio::test]
    async fn release_only_removes_own_claim() {
        let store = MemoryDedupStore::default();
        let job = Claim::new(Uuid::new_v4());
        store.try_claim("h", job.job_id).await.unwrap();
        assert!(!store.release("h", Claim::new(Uuid::new_v4())).await.unwrap());
        assert!(!store.release("h", job.next()).await.unwrap());
        assert!(store.release("h", job).await.unwrap());
        assert!(store.get("h").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reclaim_needs_a_lapsed_lease_and_fences_the_old_generation() {
        let store = MemoryDedupStore::default();
        let first = Claim::new(Uuid::new_v4());
        store.try_claim("h", first.job_id).await.unwrap();

        // Lease still fresh.
        let an_hour_ago = Utc::now() - Duration::hours(1);
        assert!(!store.reclaim("h", first, an_hour_ago).await.unwrap());

        let later = Utc::now() + Duration::seconds(1);
        assert!(store.reclaim("h", first, later).await.unwrap());
        // Only one of two redeliveries presenting the same claim wins.
        assert!(!store.reclaim("h", first, later).await.unwrap());

        let second = first.next();
        assert_eq!(store.get("h").await.unwrap().unwrap().target.claim(), Some(second));
        assert!(!store.renew("h", first).await.unwrap());
        assert!(store.renew("h", second).await.unwrap());
        assert!(store.complete("h", first, Uuid::new_v4()).await.is_err());
        assert!(!store.release("h", first).await.unwrap());
        store.complete("h", second, Uuid::new_v4()).await.unwrap();
        assert!(store.renew("h", second).await.unwrap());
    }
}
