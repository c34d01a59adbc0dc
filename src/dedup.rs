//! Deduplication gate: one pipeline run per canonical URL.
//!
//! The gate turns the [`DedupStore`]'s atomic insert-if-absent into a
//! [`Disposition`] for each submission:
//!
//! | Record found | Disposition |
//! |--------------|-------------|
//! | none | [`Disposition::Accepted`]: a claim now points at this job |
//! | in flight | [`Disposition::Joined`] |
//! | completed | [`Disposition::Duplicate`] |
//!
//! A completed record is never overwritten. An in-flight claim is released
//! only by the job that holds it, when that job ends `FAILED` or
//! `CANCELLED`, so the URL can be submitted again.
//!
//! ## Leases
//!
//! The worker running a job renews its claim's lease on a heartbeat. A job
//! found unfinished in the job store is redelivered with
//! [`DedupGate::redeliver`], which takes the claim over only once its lease
//! has lapsed and bumps the claim generation, so of two workers redelivering
//! the same job exactly one runs it.

use crate::canonical::CanonicalUrl;
use crate::error::StoreError;
use crate::store::{Claim, ClaimResult, DedupStore, DedupTarget};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// What the gate decided for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum Disposition {
    /// The submission owns a fresh pipeline run.
    Accepted,
    /// Another job is already processing this URL; its outcome is shared.
    Joined { job_id: Uuid },
    /// The URL was ingested before; no stage runs.
    Duplicate { document_id: Uuid },
}

/// What [`DedupGate::redeliver`] found for an unfinished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redelivery {
    /// The caller now holds the job's claim.
    Owned(Claim),
    /// The claim is still leased by a live worker.
    Leased,
    /// Another job holds the URL's claim.
    Superseded { owner: Uuid },
    /// The URL's record points at a stored document.
    Stored { document_id: Uuid },
}

#[derive(Clone)]
pub struct DedupGate {
    store: Arc<dyn DedupStore>,
}

impl DedupGate {
    pub fn new(store: Arc<dyn DedupStore>) -> Self {
        Self { store }
    }

    /// Atomically claim `url` for `job_id`, or report who already has it.
    pub async fn check_and_claim(
        &self,
        url: &CanonicalUrl,
        job_id: Uuid,
    ) -> Result<Disposition, StoreError> {
        let disposition = match self.store.try_claim(&url.hash, job_id).await? {
            ClaimResult::Claimed => Disposition::Accepted,
            ClaimResult::Existing(record) => match record.target {
                DedupTarget::InFlight { job_id: owner, .. } => Disposition::Joined { job_id: owner },
                DedupTarget::Completed { document_id } => Disposition::Duplicate { document_id },
            },
        };
        debug!(url_hash = %url.hash, %job_id, ?disposition, "Dedup gate");
        Ok(disposition)
    }

    /// Take over the claim of an unfinished job whose lease lapsed.
    pub async fn redeliver(
        &self,
        url_hash: &str,
        job_id: Uuid,
        lease: Duration,
    ) -> Result<Redelivery, StoreError> {
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(1));
        // A claim that vanishes between `get` and `try_claim` is read again.
        for _ in 0..3 {
            let Some(record) = self.store.get(url_hash).await? else {
                match self.store.try_claim(url_hash, job_id).await? {
                    ClaimResult::Claimed => return Ok(Redelivery::Owned(Claim::new(job_id))),
                    ClaimResult::Existing(_) => continue,
                }
            };
            let redelivery = match record.target {
                DedupTarget::InFlight {
                    job_id: owner,
                    generation,
                    ..
                } if owner == job_id => {
                    let held = Claim { job_id, generation };
                    if self.store.reclaim(url_hash, held, Utc::now() - lease).await? {
                        Redelivery::Owned(held.next())
                    } else {
                        Redelivery::Leased
                    }
                }
                DedupTarget::InFlight { job_id: owner, .. } => Redelivery::Superseded { owner },
                DedupTarget::Completed { document_id } => Redelivery::Stored { document_id },
            };
            debug!(%url_hash, %job_id, ?redelivery, "Dedup redelivery");
            return Ok(redelivery);
        }
        Err(StoreError::Conflict {
            key: url_hash.to_string(),
            detail: format!("claim for job {job_id} kept changing during redelivery"),
        })
    }

    /// Refresh the lease of `claim`. `Ok(false)` means it was taken over.
    pub async fn renew(&self, url_hash: &str, claim: Claim) -> Result<bool, StoreError> {
        self.store.renew(url_hash, claim).await
    }

    /// Whether `claim` still holds the record, or the record points at
    /// `document_id`.
    pub async fn holds(
        &self,
        url_hash: &str,
        claim: Claim,
        document_id: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        Ok(match self.store.get(url_hash).await? {
            Some(record) => match record.target {
                DedupTarget::Completed { document_id: done } => Some(done) == document_id,
                _ => record.held_by(claim),
            },
            None => false,
        })
    }

    /// Point the claim at the stored document. Idempotent.
    pub async fn complete(
        &self,
        url_hash: &str,
        claim: Claim,
        document_id: Uuid,
    ) -> Result<(), StoreError> {
        self.store.complete(url_hash, claim, document_id).await
    }

    /// Drop `claim`. Errors are logged, not returned.
    pub async fn release(&self, url_hash: &str, claim: Claim) -> bool {
        match self.store.release(url_hash, claim).await {
            Ok(released) => {
                debug!(%url_hash, job_id = %claim.job_id, released, "Dedup claim released");
                released
            }
            Err(e) => {
                warn!(%url_hash, job_id = %claim.job_id, error = %e, "Failed to release dedup claim");
                false
            }
        }
    }

    /// Drop whatever generation of `job_id`'s claim is current.
    pub async fn release_job(&self, url_hash: &str, job_id: Uuid) -> bool {
        let current = match self.store.get(url_hash).await {
            Ok(record) => record.and_then(|r| r.target.claim()),
            Err(e) => {
                warn!(%url_hash, %job_id, error = %e, "Failed to read dedup claim");
                None
            }
        };
        match current {
            Some(claim) if claim.job_id == job_id => self.release(url_hash, claim).await,
            _ => false,
        }
    }
}
