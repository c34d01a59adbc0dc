//! The ingestion job record and its lifecycle enums.
//!
//! A job is owned by exactly one state machine at a time. The record is
//! written to the [`crate::store::JobStore`] after every transition so a
//! worker crash mid-pipeline can be recovered by redelivery.

use crate::canonical::CanonicalUrl;
use crate::document::ExtractedDocument;
use crate::error::{ErrorKind, StageError};
use crate::store::Claim;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Position of a job in the pipeline.
///
/// ```text
/// QUEUED → FETCHING → RENDERING → PARSING → VALIDATING → NORMALIZING → PERSISTING → COMPLETED
/// ```
/// `FAILED`, `DUPLICATE` and `CANCELLED` are reachable from any non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Queued,
    Fetching,
    Rendering,
    Parsing,
    Validating,
    Normalizing,
    Persisting,
    Completed,
    Failed,
    Duplicate,
    Cancelled,
}

impl Stage {
    /// The stage entered after this one succeeds, in the fixed pipeline order.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Queued => Some(Stage::Fetching),
            Stage::Fetching => Some(Stage::Rendering),
            Stage::Rendering => Some(Stage::Parsing),
            Stage::Parsing => Some(Stage::Validating),
            Stage::Validating => Some(Stage::Normalizing),
            Stage::Normalizing => Some(Stage::Persisting),
            Stage::Persisting => Some(Stage::Completed),
            Stage::Completed | Stage::Failed | Stage::Duplicate | Stage::Cancelled => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Stage::Completed | Stage::Failed | Stage::Duplicate | Stage::Cancelled
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Queued => "QUEUED",
            Stage::Fetching => "FETCHING",
            Stage::Rendering => "RENDERING",
            Stage::Parsing => "PARSING",
            Stage::Validating => "VALIDATING",
            Stage::Normalizing => "NORMALIZING",
            Stage::Persisting => "PERSISTING",
            Stage::Completed => "COMPLETED",
            Stage::Failed => "FAILED",
            Stage::Duplicate => "DUPLICATE",
            Stage::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Duplicate,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    /// The terminal stage matching a terminal status.
    fn terminal_stage(self) -> Stage {
        match self {
            JobStatus::Running => Stage::Queued,
            JobStatus::Completed => Stage::Completed,
            JobStatus::Failed => Stage::Failed,
            JobStatus::Duplicate => Stage::Duplicate,
            JobStatus::Cancelled => Stage::Cancelled,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Duplicate => "DUPLICATE",
            JobStatus::Cancelled => "CANCELLED",
        })
    }
}

/// The last stage failure, kept on the record for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
    /// Attempt number (1-based) that produced this error.
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

impl JobError {
    pub fn from_stage_error(stage: Stage, attempt: u32, err: &StageError) -> Self {
        Self {
            stage,
            kind: err.kind(),
            message: err.to_string(),
            attempt,
            at: Utc::now(),
        }
    }

    /// The job was stopped for a reason other than a stage failure.
    pub fn cancelled(stage: Stage, attempt: u32, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind: ErrorKind::Cancelled,
            message: message.into(),
            attempt,
            at: Utc::now(),
        }
    }
}

/// How far Persist got, so a retry resumes at the embedding step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistCursor {
    pub metadata_written: bool,
    pub chunks_upserted: usize,
    /// Length of the first vector written; every later chunk must match.
    #[serde(default)]
    pub dimension: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub job_id: Uuid,
    pub source_url: String,
    pub url_hash: String,
    pub stage: Stage,
    /// Invocations per stage, first attempt included.
    pub attempts: BTreeMap<Stage, u32>,
    pub status: JobStatus,
    pub last_error: Option<JobError>,
    /// Set when the job completed, or when it was rejected as a duplicate of
    /// an already stored document.
    pub document_id: Option<Uuid>,
    /// Checkpoint written once Normalize succeeds; lets a redelivered job
    /// resume at PERSISTING without parsing again.
    pub document: Option<ExtractedDocument>,
    pub persist: PersistCursor,
    /// Generation of the dedup claim this record's current run holds.
    #[serde(default)]
    pub claim_generation: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IngestionJob {
    /// A fresh job, queued for the pipeline.
    pub fn new(url: &CanonicalUrl) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            source_url: url.source.clone(),
            url_hash: url.hash.clone(),
            stage: Stage::Queued,
            attempts: BTreeMap::new(),
            status: JobStatus::Running,
            last_error: None,
            document_id: None,
            document: None,
            persist: PersistCursor::default(),
            claim_generation: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// A job that was short-circuited by the dedup gate. No stage ever runs.
    pub fn duplicate_of(url: &CanonicalUrl, document_id: Uuid) -> Self {
        let mut job = Self::new(url);
        job.document_id = Some(document_id);
        job.finish(JobStatus::Duplicate);
        job
    }

    pub fn attempts(&self, stage: Stage) -> u32 {
        self.attempts.get(&stage).copied().unwrap_or(0)
    }

    /// Count one more invocation of `stage` and return the new total.
    pub fn record_attempt(&mut self, stage: Stage) -> u32 {
        let n = self.attempts.entry(stage).or_insert(0);
        *n += 1;
        self.updated_at = Utc::now();
        *n
    }

    pub fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        self.updated_at = Utc::now();
    }

    /// Move to a terminal status (and the matching terminal stage).
    pub fn finish(&mut self, status: JobStatus) {
        self.status = status;
        self.stage = status.terminal_stage();
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn claim(&self) -> Claim {
        Claim {
            job_id: self.job_id,
            generation: self.claim_generation,
        }
    }

    pub fn outcome(&self) -> JobOutcome {
        JobOutcome {
            job_id: self.job_id,
            url_hash: self.url_hash.clone(),
            status: self.status,
            document_id: self.document_id,
            error: self.last_error.clone(),
        }
    }
}

/// Terminal result of a job, as observed by every submission joined to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub url_hash: String,
    pub status: JobStatus,
    pub document_id: Option<Uuid>,
    pub error: Option<JobError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> CanonicalUrl {
        CanonicalUrl::parse("https://gov.example/decree-12.pdf").unwrap()
    }

    #[test]
    fn stages_follow_fixed_order() {
        let mut stage = Stage::Queued;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            seen.push(next);
            stage = next;
        }
        assert_eq!(
            seen,
            vec![
                Stage::Queued,
                Stage::Fetching,
                Stage::Rendering,
                Stage::Parsing,
                Stage::Validating,
                Stage::Normalizing,
                Stage::Persisting,
                Stage::Completed,
            ]
        );
        assert!(Stage::Failed.next().is_none());
    }

    #[test]
    fn attempts_are_counted_per_stage() {
        let mut job = IngestionJob::new(&url());
        assert_eq!(job.record_attempt(Stage::Fetching), 1);
        assert_eq!(job.record_attempt(Stage::Fetching), 2);
        assert_eq!(job.record_attempt(Stage::Parsing), 1);
        assert_eq!(job.attempts(Stage::Fetching), 2);
        assert_eq!(job.attempts(Stage::Rendering), 0);
    }

    #[test]
    fn duplicate_job_is_terminal_and_references_document() {
        let doc = Uuid::new_v4();
        let job = IngestionJob::duplicate_of(&url(), doc);
        assert_eq!(job.status, JobStatus::Duplicate);
        assert_eq!(job.stage, Stage::Duplicate);
        assert_eq!(job.outcome().document_id, Some(doc));
        assert!(job.is_terminal());
    }

    #[test]
    fn job_record_round_trips_through_json() {
        let mut job = IngestionJob::new(&url());
        job.record_attempt(Stage::Fetching);
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"FETCHING\":1"));
        let back: IngestionJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }
}
