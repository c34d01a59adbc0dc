//! File-system store backend: one JSON file per record under a state directory.
//!
//! Every worker process on a host can share the same directory:
//!
//! - every dedup mutation (claim, renew, reclaim, complete, release) reads,
//!   compares and writes while holding an exclusive advisory lock on
//!   `dedup/.lock`; the OS drops the lock when a worker dies
//! - every write goes to a temp file that is renamed over the target, so
//!   readers never observe a half-written record

use super::{Claim, ClaimResult, DedupRecord, DedupStore, DocumentStore, JobStore, VectorStore};
use crate::document::{ChunkMetadata, DocumentStatus, ExtractedDocument, StoredDocument};
use crate::error::StoreError;
use crate::job::IngestionJob;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

// ── Helpers ──────────────────────────────────────────────────────────────────

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

async fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| io_err(dir, e))
}

/// Sibling temp path; the leading dot keeps it out of directory scans.
fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4()))
}

async fn write_temp<T: Serialize>(path: &Path, value: &T) -> Result<PathBuf, StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Serde {
        path: path.to_path_buf(),
        source: e,
    })?;
    let tmp = temp_sibling(path);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| io_err(&tmp, e))?;
    Ok(tmp)
}

/// Atomic write: temp file, then rename over the target.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let tmp = write_temp(path, value).await?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| io_err(path, e))
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Serde {
                path: path.to_path_buf(),
                source: e,
            }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path, e)),
    }
}

/// Every record file in `dir` (skips temp files).
async fn read_all<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| io_err(dir, e))?;
    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(dir, e))? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || !name.ends_with(".json") {
            continue;
        }
        // A record removed between listing and reading is simply skipped.
        if let Some(value) = read_json(&entry.path()).await? {
            out.push(value);
        }
    }
    Ok(out)
}

/// Record keys become file names, so only a conservative alphabet is allowed.
fn check_key(key: &str) -> Result<(), StoreError> {
    let ok = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::Backend(format!("invalid record key '{key}'")))
    }
}

// ── Dedup ────────────────────────────────────────────────────────────────────

/// Exclusive lock on the dedup directory; released when dropped.
struct DirLock {
    _file: std::fs::File,
}

impl DirLock {
    async fn acquire(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(".lock");
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .map_err(|e| io_err(&path, e))?;
            file.lock().map_err(|e| io_err(&path, e))?;
            Ok(Self { _file: file })
        })
        .await
        .map_err(|e| StoreError::Backend(format!("dedup lock task failed: {e}")))?
    }
}

#[derive(Debug, Clone)]
pub struct FsDedupStore {
    dir: PathBuf,
}

impl FsDedupStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        ensure_dir(&dir).await?;
        Ok(Self { dir })
    }

    fn path(&self, url_hash: &str) -> Result<PathBuf, StoreError> {
        check_key(url_hash)?;
        Ok(self.dir.join(format!("{url_hash}.json")))
    }

    /// Read the record under the lock, let `f` mutate it, and write it back
    /// when `f` reports a change.
    async fn update<T>(
        &self,
        url_hash: &str,
        f: impl FnOnce(&mut DedupRecord) -> Result<(bool, T), StoreError>,
    ) -> Result<Option<T>, StoreError> {
        let path = self.path(url_hash)?;
        let _lock = DirLock::acquire(&self.dir).await?;
        let Some(mut record) = read_json::<DedupRecord>(&path).await? else {
            return Ok(None);
        };
        let (changed, out) = f(&mut record)?;
        if changed {
            write_json(&path, &record).await?;
        }
        Ok(Some(out))
    }
}

#[async_trait]
impl DedupStore for FsDedupStore {
    async fn try_claim(&self, url_hash: &str, job_id: Uuid) -> Result<ClaimResult, StoreError> {
        let path = self.path(url_hash)?;
        let _lock = DirLock::acquire(&self.dir).await?;
        if let Some(existing) = read_json(&path).await? {
            return Ok(ClaimResult::Existing(existing));
        }
        write_json(&path, &DedupRecord::new(url_hash, Claim::new(job_id))).await?;
        debug!(url_hash, %job_id, "Dedup claim inserted");
        Ok(ClaimResult::Claimed)
    }

    async fn renew(&self, url_hash: &str, claim: Claim) -> Result<bool, StoreError> {
        let held = self
            .update(url_hash, |r| {
                let held = r.renew(claim);
                Ok((held && r.held_by(claim), held))
            })
            .await?;
        Ok(held.unwrap_or(false))
    }

    async fn reclaim(
        &self,
        url_hash: &str,
        held: Claim,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let swapped = self
            .update(url_hash, |r| {
                let swapped = r.reclaim(held, stale_before);
                Ok((swapped, swapped))
            })
            .await?;
        Ok(swapped.unwrap_or(false))
    }

    async fn complete(
        &self,
        url_hash: &str,
        claim: Claim,
        document_id: Uuid,
    ) -> Result<(), StoreError> {
        self.update(url_hash, |r| Ok((r.complete(claim, document_id)?, ())))
            .await?
            .ok_or_else(|| StoreError::Conflict {
                key: url_hash.to_string(),
                detail: format!("no claim held by job {}", claim.job_id),
            })
    }

    async fn release(&self, url_hash: &str, claim: Claim) -> Result<bool, StoreError> {
        let path = self.path(url_hash)?;
        let _lock = DirLock::acquire(&self.dir).await?;
        let record: Option<DedupRecord> = read_json(&path).await?;
        if !record.is_some_and(|r| r.held_by(claim)) {
            return Ok(false);
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    async fn get(&self, url_hash: &str) -> Result<Option<DedupRecord>, StoreError> {
        read_json(&self.path(url_hash)?).await
    }
}

// ── Documents ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    dir: PathBuf,
}

impl FsDocumentStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        ensure_dir(&dir).await?;
        Ok(Self { dir })
    }

    fn path(&self, document_id: Uuid) -> PathBuf {
        self.dir.join(format!("{document_id}.json"))
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn put(
        &self,
        document_id: Uuid,
        document: &ExtractedDocument,
        status: DocumentStatus,
    ) -> Result<(), StoreError> {
        let record = StoredDocument {
            document: document.clone(),
            status,
            updated_at: Utc::now(),
        };
        write_json(&self.path(document_id), &record).await
    }

    async fn get(&self, document_id: Uuid) -> Result<Option<StoredDocument>, StoreError> {
        read_json(&self.path(document_id)).await
    }

    async fn find_by_url_hash(&self, url_hash: &str) -> Result<Vec<StoredDocument>, StoreError> {
        let all: Vec<StoredDocument> = read_all(&self.dir).await?;
        Ok(all
            .into_iter()
            .filter(|d| d.document.url_hash() == url_hash)
            .collect())
    }
}

// ── Vectors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VectorRecord {
    chunk_id: String,
    vector: Vec<f32>,
    metadata: ChunkMetadata,
}

#[derive(Debug, Clone)]
pub struct FsVectorStore {
    dir: PathBuf,
}

impl FsVectorStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        ensure_dir(&dir).await?;
        Ok(Self { dir })
    }
}

#[async_trait]
impl VectorStore for FsVectorStore {
    async fn upsert(
        &self,
        chunk_id: &str,
        vector: &[f32],
        metadata: &ChunkMetadata,
    ) -> Result<(), StoreError> {
        check_key(chunk_id)?;
        let record = VectorRecord {
            chunk_id: chunk_id.to_string(),
            vector: vector.to_vec(),
            metadata: metadata.clone(),
        };
        write_json(&self.dir.join(format!("{chunk_id}.json")), &record).await
    }
}

// ── Jobs ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FsJobStore {
    dir: PathBuf,
}

impl FsJobStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        ensure_dir(&dir).await?;
        Ok(Self { dir })
    }

    fn path(&self, job_id: Uuid) -> PathBuf {
        self.dir.join(format!("{job_id}.json"))
    }
}

#[async_trait]
impl JobStore for FsJobStore {
    async fn save(&self, job: &IngestionJob) -> Result<(), StoreError> {
        write_json(&self.path(job.job_id), job).await
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<IngestionJob>, StoreError> {
        read_json(&self.path(job_id)).await
    }

    async fn list_unfinished(&self) -> Result<Vec<IngestionJob>, StoreError> {
        let mut jobs: Vec<IngestionJob> = read_all(&self.dir).await?;
        jobs.retain(|j| !j.is_terminal());
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::CanonicalUrl;
    use crate::job::{JobStatus, Stage};
    use crate::store::DedupTarget;

    #[tokio::test]
    async fn claim_survives_reopen_and_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let job = Uuid::new_v4();
        {
            let store = FsDedupStore::open(dir.path()).await.unwrap();
            assert_eq!(store.try_claim("abc123", job).await.unwrap(), ClaimResult::Claimed);
        }
        // A second "process" sees the first claim.
        let store = FsDedupStore::open(dir.path()).await.unwrap();
        match store.try_claim("abc123", Uuid::new_v4()).await.unwrap() {
            ClaimResult::Existing(r) => assert_eq!(r.target.claim(), Some(Claim::new(job))),
            other => panic!("expected existing claim, got {other:?}"),
        }
        // No temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn complete_then_release_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDedupStore::open(dir.path()).await.unwrap();
        let (job, doc) = (Claim::new(Uuid::new_v4()), Uuid::new_v4());
        store.try_claim("h1", job.job_id).await.unwrap();
        store.complete("h1", job, doc).await.unwrap();
        store.complete("h1", job, doc).await.unwrap();
        assert!(!store.release("h1", job).await.unwrap());
        assert!(store
            .complete("h1", Claim::new(Uuid::new_v4()), Uuid::new_v4())
            .await
            .is_err());
        assert_eq!(
            store.get("h1").await.unwrap().unwrap().target,
            DedupTarget::Completed { document_id: doc }
        );
    }

    #[tokio::test]
    async fn reclaim_bumps_the_generation_once() {
        let dir = tempfile::tempdir().unwrap();
        let a = FsDedupStore::open(dir.path()).await.unwrap();
        let b = FsDedupStore::open(dir.path()).await.unwrap();
        let held = Claim::new(Uuid::new_v4());
        a.try_claim("h2", held.job_id).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(1);
        let (x, y) = tokio::join!(a.reclaim("h2", held, later), b.reclaim("h2", held, later));
        assert!(x.unwrap() ^ y.unwrap(), "exactly one redelivery takes the claim");
        assert_eq!(a.get("h2").await.unwrap().unwrap().target.claim(), Some(held.next()));
        assert!(!b.renew("h2", held).await.unwrap());
        assert!(b.renew("h2", held.next()).await.unwrap());
    }

    #[tokio::test]
    async fn racing_releases_never_drop_a_newer_claim() {
        let dir = tempfile::tempdir().unwrap();
        for round in 0..20 {
            let key = format!("race{round}");
            let stores: Vec<FsDedupStore> = vec![
                FsDedupStore::open(dir.path()).await.unwrap(),
                FsDedupStore::open(dir.path()).await.unwrap(),
                FsDedupStore::open(dir.path()).await.unwrap(),
            ];
            let failed = Claim::new(Uuid::new_v4());
            stores[0].try_claim(&key, failed.job_id).await.unwrap();

            let newcomer = Uuid::new_v4();
            let (r1, r2, ()) = tokio::join!(
                stores[0].release(&key, failed),
                stores[1].release(&key, failed),
                async {
                    // Keep trying until the failed job's claim is gone.
                    loop {
                        match stores[2].try_claim(&key, newcomer).await.unwrap() {
                            ClaimResult::Claimed => break,
                            ClaimResult::Existing(_) => tokio::task::yield_now().await,
                        }
                    }
                }
            );
            assert!(r1.unwrap() ^ r2.unwrap(), "one release removes the record");
            assert_eq!(
                stores[0].get(&key).await.unwrap().unwrap().target.claim(),
                Some(Claim::new(newcomer)),
                "round {round}"
            );
        }
    }

    #[tokio::test]
    async fn path_like_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDedupStore::open(dir.path()).await.unwrap();
        assert!(store.try_claim("../escape", Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn unfinished_jobs_are_listed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsJobStore::open(dir.path()).await.unwrap();
        let url = CanonicalUrl::parse("https://gov.example/a.pdf").unwrap();

        let mut running = IngestionJob::new(&url);
        running.enter(Stage::Parsing);
        let mut done = IngestionJob::new(&url);
        done.finish(JobStatus::Failed);
        store.save(&running).await.unwrap();
        store.save(&done).await.unwrap();

        let unfinished = store.list_unfinished().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].job_id, running.job_id);
        assert_eq!(store.get(done.job_id).await.unwrap().unwrap().status, JobStatus::Failed);
    }
}
