//! Contracts the pipeline needs from its external stores.
//!
//! The storage engines themselves are collaborators; this module only pins
//! down the operations and their atomicity requirements:
//!
//! | Store | Requirement |
//! |-------|-------------|
//! | [`DedupStore`] | atomic insert-if-absent; every other mutation compare-and-swap on the [`Claim`] |
//! | [`DocumentStore`] | idempotent `put` keyed by document id |
//! | [`VectorStore`] | idempotent `upsert` keyed by chunk id |
//! | [`JobStore`] | last-writer-wins job records |
//!
//! Two backends ship with the crate: [`memory`] (one process, tests) and
//! [`fs`] (a state directory shared by every worker on a host).

pub mod fs;
pub mod memory;

use crate::document::{ChunkMetadata, DocumentStatus, ExtractedDocument, StoredDocument};
use crate::error::StoreError;
use crate::job::IngestionJob;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// The holder of an in-flight claim.
///
/// `generation` starts at 0 and is bumped every time a redelivery takes the
/// claim over, so a run that lost its claim can no longer complete or
/// release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Claim {
    pub job_id: Uuid,
    pub generation: u64,
}

impl Claim {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            generation: 0,
        }
    }

    pub fn next(self) -> Self {
        Self {
            generation: self.generation + 1,
            ..self
        }
    }
}

/// What a dedup record points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DedupTarget {
    InFlight {
        job_id: Uuid,
        #[serde(default)]
        generation: u64,
        /// Last heartbeat of the owning worker.
        renewed_at: DateTime<Utc>,
    },
    /// Immutable once written.
    Completed { document_id: Uuid },
}

impl DedupTarget {
    pub fn in_flight(claim: Claim) -> Self {
        DedupTarget::InFlight {
            job_id: claim.job_id,
            generation: claim.generation,
            renewed_at: Utc::now(),
        }
    }

    /// The claim, when the record is in flight.
    pub fn claim(&self) -> Option<Claim> {
        match *self {
            DedupTarget::InFlight {
                job_id, generation, ..
            } => Some(Claim { job_id, generation }),
            DedupTarget::Completed { .. } => None,
        }
    }

    /// In flight with a lease last renewed before `stale_before`.
    pub fn is_stale(&self, stale_before: DateTime<Utc>) -> bool {
        matches!(self, DedupTarget::InFlight { renewed_at, .. } if *renewed_at < stale_before)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub url_hash: String,
    pub target: DedupTarget,
    pub inserted_at: DateTime<Utc>,
}

impl DedupRecord {
    pub fn new(url_hash: &str, claim: Claim) -> Self {
        Self {
            url_hash: url_hash.to_string(),
            target: DedupTarget::in_flight(claim),
            inserted_at: Utc::now(),
        }
    }

    pub fn held_by(&self, claim: Claim) -> bool {
        self.target.claim() == Some(claim)
    }

    /// In-place [`DedupStore::renew`]. Returns whether the claim is held.
    pub(crate) fn renew(&mut self, claim: Claim) -> bool {
        match self.target {
            DedupTarget::Completed { .. } => true,
            _ if self.held_by(claim) => {
                self.target = DedupTarget::in_flight(claim);
                true
            }
            _ => false,
        }
    }

    /// In-place [`DedupStore::reclaim`]. Returns whether the record changed.
    pub(crate) fn reclaim(&mut self, held: Claim, stale_before: DateTime<Utc>) -> bool {
        if self.held_by(held) && self.target.is_stale(stale_before) {
            self.target = DedupTarget::in_flight(held.next());
            true
        } else {
            false
        }
    }

    /// In-place [`DedupStore::complete`]. `Ok(true)` when the record changed.
    pub(crate) fn complete(&mut self, claim: Claim, document_id: Uuid) -> Result<bool, StoreError> {
        match self.target {
            DedupTarget::Completed { document_id: done } if done == document_id => Ok(false),
            _ if self.held_by(claim) => {
                self.target = DedupTarget::Completed { document_id };
                Ok(true)
            }
            other => Err(StoreError::Conflict {
                key: self.url_hash.clone(),
                detail: format!(
                    "record is {other:?}, expected claim by job {} (generation {})",
                    claim.job_id, claim.generation
                ),
            }),
        }
    }
}

/// Result of an atomic check-and-claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    /// No record existed; one now points at the claiming job.
    Claimed,
    /// A record already existed and was left untouched.
    Existing(DedupRecord),
}

/// Dedup records keyed by URL hash.
///
/// Every method is atomic with respect to every other method, across all
/// workers sharing the store.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Insert `{url_hash → InFlight(job_id, generation 0)}` unless a record exists.
    async fn try_claim(&self, url_hash: &str, job_id: Uuid) -> Result<ClaimResult, StoreError>;

    /// Refresh the lease of `InFlight(claim)`.
    ///
    /// Returns `false` when the record no longer is `InFlight(claim)`. A
    /// `Completed` record cannot be taken over and counts as held.
    async fn renew(&self, url_hash: &str, claim: Claim) -> Result<bool, StoreError>;

    /// Swap `InFlight(held)` for `InFlight(held.next())` with a fresh lease,
    /// provided the lease was last renewed before `stale_before`.
    /// Returns whether the swap happened.
    async fn reclaim(
        &self,
        url_hash: &str,
        held: Claim,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Swap `InFlight(claim)` for `Completed(document_id)`.
    ///
    /// Succeeds without change when the record already is
    /// `Completed(document_id)`; any other state is a [`StoreError::Conflict`].
    async fn complete(
        &self,
        url_hash: &str,
        claim: Claim,
        document_id: Uuid,
    ) -> Result<(), StoreError>;

    /// Delete the record if, and only if, it is `InFlight(claim)`.
    /// Returns whether a record was removed.
    async fn release(&self, url_hash: &str, claim: Claim) -> Result<bool, StoreError>;

    async fn get(&self, url_hash: &str) -> Result<Option<DedupRecord>, StoreError>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Write (or overwrite) the record for `document_id`.
    async fn put(
        &self,
        document_id: Uuid,
        document: &ExtractedDocument,
        status: DocumentStatus,
    ) -> Result<(), StoreError>;

    async fn get(&self, document_id: Uuid) -> Result<Option<StoredDocument>, StoreError>;

    async fn find_by_url_hash(&self, url_hash: &str) -> Result<Vec<StoredDocument>, StoreError>;
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(
        &self,
        chunk_id: &str,
        vector: &[f32],
        metadata: &ChunkMetadata,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save(&self, job: &IngestionJob) -> Result<(), StoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<IngestionJob>, StoreError>;

    /// Every job whose status is not terminal, oldest first.
    async fn list_unfinished(&self) -> Result<Vec<IngestionJob>, StoreError>;
}

/// The four stores a pipeline writes to.
#[derive(Clone)]
pub struct Stores {
    pub dedup: Arc<dyn DedupStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub jobs: Arc<dyn JobStore>,
}

impl Stores {
    /// All four stores backed by process memory.
    pub fn in_memory() -> Self {
        Self {
            dedup: Arc::new(memory::MemoryDedupStore::default()),
            documents: Arc::new(memory::MemoryDocumentStore::default()),
            vectors: Arc::new(memory::MemoryVectorStore::default()),
            jobs: Arc::new(memory::MemoryJobStore::default()),
        }
    }

    /// All four stores under one state directory.
    pub async fn on_disk(root: impl Into<std::path::PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        Ok(Self {
            dedup: Arc::new(fs::FsDedupStore::open(root.join("dedup")).await?),
            documents: Arc::new(fs::FsDocumentStore::open(root.join("documents")).await?),
            vectors: Arc::new(fs::FsVectorStore::open(root.join("vectors")).await?),
            jobs: Arc::new(fs::FsJobStore::open(root.join("jobs")).await?),
        })
    }
}
