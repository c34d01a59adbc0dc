//! Job state machine: drives one job through the Stage Executors.
//!
//! ```text
//! QUEUED → FETCHING → RENDERING → PARSING → VALIDATING → NORMALIZING → PERSISTING → COMPLETED
//!              ╰──────────────╮ any stage ╭──────────────╯
//!                             ▼           ▼
//!                          FAILED     CANCELLED
//! ```
//!
//! One machine owns one job. For every stage it counts the attempt on the
//! record, runs the executor, and either advances or asks the
//! [`RetryPolicy`](crate::retry::RetryPolicy) what to do with the error. The
//! record is saved to the job store after every transition.
//!
//! Whatever the terminal status, [`JobStateMachine::run`] then:
//!
//! 1. deletes every temp artifact of the job;
//! 2. releases the dedup claim when the job `FAILED` or was `CANCELLED`;
//! 3. saves the terminal record and notifies the observer.
//!
//! Every save is fenced on the dedup claim: a run whose claim was taken over
//! by a redelivery stops at its next checkpoint, reports `CANCELLED` to its
//! local waiters and leaves the job record to the new owner.
//!
//! ## Redelivery
//!
//! Temp artifacts do not survive a worker crash. A redelivered job therefore
//! restarts at FETCHING, unless Normalize already checkpointed the document
//! on the record, in which case it resumes at PERSISTING with its persist
//! cursor.

use crate::config::IngestConfig;
use crate::dedup::DedupGate;
use crate::error::StageError;
use crate::job::{IngestionJob, JobError, JobOutcome, JobStatus, PersistCursor, Stage};
use crate::pipeline::fetch::{self, DownloadLimits};
use crate::pipeline::parse::{self, RawExtraction};
use crate::pipeline::validate::{self, ValidatedExtraction};
use crate::pipeline::{normalize, persist, render, suspend, Services};
use crate::progress::Observer;
use crate::retry::RetryDecision;
use crate::temp::TempScope;
use chrono::{Datelike, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Stage outputs that live only as long as one run of the machine.
#[derive(Default)]
struct Artifacts {
    pdf: Option<PathBuf>,
    pages: Vec<PathBuf>,
    raw: Option<RawExtraction>,
    validated: Option<ValidatedExtraction>,
}

pub struct JobStateMachine {
    services: Services,
    config: Arc<IngestConfig>,
    gate: DedupGate,
    observer: Observer,
    cancel: CancellationToken,
    /// Set once a checkpoint found the claim held by another run.
    lost: AtomicBool,
}

impl JobStateMachine {
    pub fn new(
        services: Services,
        config: Arc<IngestConfig>,
        gate: DedupGate,
        observer: Observer,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            services,
            config,
            gate,
            observer,
            cancel,
            lost: AtomicBool::new(false),
        }
    }

    /// Drive `job` to a terminal status and clean up after it.
    #[instrument(skip_all, fields(job_id = %job.job_id, url_hash = %job.url_hash))]
    pub async fn run(&self, mut job: IngestionJob) -> JobOutcome {
        let scope = self.services.temp_scope(job.job_id);

        self.drive(&mut job, &scope).await;

        let leaked = scope.release().await;
        if leaked > 0 {
            warn!(leaked, "Some temp artifacts could not be deleted");
        }
        if self.owns(&job).await {
            if matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) {
                self.gate.release(&job.url_hash, job.claim()).await;
            }
            self.save(&job).await;
        } else {
            warn!(
                generation = job.claim_generation,
                "Dedup claim taken over; job record left to its new owner"
            );
        }

        let outcome = job.outcome();
        match job.status {
            JobStatus::Completed => info!(document_id = ?job.document_id, "Job completed"),
            status => info!(
                %status,
                error = job.last_error.as_ref().map(|e| e.message.as_str()).unwrap_or(""),
                "Job finished"
            ),
        }
        self.observer.on_job_finished(&outcome);
        outcome
    }

    async fn drive(&self, job: &mut IngestionJob, scope: &TempScope) {
        self.enter_resume_point(job);
        self.checkpoint(job).await;

        let mut artifacts = Artifacts::default();
        while !job.is_terminal() {
            if self.lost.load(Ordering::SeqCst) {
                job.last_error = Some(JobError::cancelled(
                    job.stage,
                    job.attempts(job.stage),
                    "dedup claim taken over by a redelivery",
                ));
                job.finish(JobStatus::Cancelled);
                break;
            }
            if self.cancel.is_cancelled() {
                info!(stage = %job.stage, "Cancellation observed");
                job.finish(JobStatus::Cancelled);
                break;
            }

            let stage = job.stage;
            let attempt = job.record_attempt(stage);
            self.observer.on_stage_start(job.job_id, stage, attempt);
            debug!(%stage, attempt, "Stage start");

            match self.execute(stage, job, &mut artifacts, scope).await {
                Ok(()) => match stage.next() {
                    Some(Stage::Completed) => job.finish(JobStatus::Completed),
                    Some(next) => job.enter(next),
                    None => {
                        job.last_error = Some(JobError::from_stage_error(
                            stage,
                            attempt,
                            &StageError::Internal(format!("{stage} has no successor")),
                        ));
                        job.finish(JobStatus::Failed);
                    }
                },
                Err(e) => self.handle_failure(job, stage, attempt, e).await,
            }

            if !job.is_terminal() {
                self.checkpoint(job).await;
            }
        }
    }

    fn enter_resume_point(&self, job: &mut IngestionJob) {
        let resume = match job.stage {
            Stage::Queued | Stage::Fetching => Stage::Fetching,
            _ if job.document.is_some() => Stage::Persisting,
            stage => {
                info!(%stage, "Redelivered job restarts at FETCHING");
                Stage::Fetching
            }
        };
        job.enter(resume);
    }

    async fn handle_failure(
        &self,
        job: &mut IngestionJob,
        stage: Stage,
        attempt: u32,
        error: StageError,
    ) {
        job.last_error = Some(JobError::from_stage_error(stage, attempt, &error));

        if error == StageError::Cancelled {
            info!(%stage, "Stage aborted by cancellation");
            job.finish(JobStatus::Cancelled);
            return;
        }

        match self.config.retry.decide(error.kind(), attempt) {
            RetryDecision::Retry { delay } => {
                warn!(%stage, attempt, ?delay, %error, "Stage failed; retrying");
                self.observer
                    .on_retry_scheduled(job.job_id, stage, attempt, delay, &error.to_string());
                self.checkpoint(job).await;

                let slept = suspend(&self.cancel, async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await;
                if slept.is_err() {
                    info!(%stage, "Cancelled during retry backoff");
                    job.last_error = Some(JobError::cancelled(
                        stage,
                        attempt,
                        format!("cancelled during retry backoff after: {error}"),
                    ));
                    job.finish(JobStatus::Cancelled);
                }
            }
            RetryDecision::GiveUp => {
                warn!(%stage, attempt, kind = ?error.kind(), %error, "Stage failed; giving up");
                job.finish(JobStatus::Failed);
            }
        }
    }

    async fn execute(
        &self,
        stage: Stage,
        job: &mut IngestionJob,
        artifacts: &mut Artifacts,
        scope: &TempScope,
    ) -> Result<(), StageError> {
        let services = &self.services;
        match stage {
            Stage::Fetching => {
                let path = fetch::fetch(
                    &job.source_url,
                    services.downloader.as_ref(),
                    DownloadLimits::from_config(&self.config),
                    scope,
                    &self.cancel,
                )
                .await?;
                artifacts.pdf = Some(path);
            }
            Stage::Rendering => {
                let pdf = artifacts.pdf.as_deref().ok_or_else(|| missing("downloaded PDF"))?;
                artifacts.pages =
                    render::render(pdf, Arc::clone(&services.renderer), scope).await?;
            }
            Stage::Parsing => {
                let raw = parse::parse(
                    &artifacts.pages,
                    scope,
                    services.vision.as_ref(),
                    &self.config,
                    &self.cancel,
                )
                .await?;
                artifacts.raw = Some(raw);
            }
            Stage::Validating => {
                let raw = artifacts.raw.as_ref().ok_or_else(|| missing("model output"))?;
                let bounds = self.config.year_bounds(Utc::now().year());
                artifacts.validated = Some(validate::validate(raw, bounds)?);
            }
            Stage::Normalizing => {
                let validated = artifacts
                    .validated
                    .take()
                    .ok_or_else(|| missing("validated extraction"))?;
                let document = normalize::normalize(validated, &job.source_url, &job.url_hash);
                debug!(
                    document_id = %document.document_id(),
                    chunks = document.chunks().len(),
                    "Document normalized"
                );
                job.document = Some(document);
                job.persist = PersistCursor::default();
            }
            Stage::Persisting => {
                let document = job
                    .document
                    .as_ref()
                    .ok_or_else(|| missing("normalized document"))?;
                let document_id = document.document_id();
                persist::write_chunks(
                    document,
                    &mut job.persist,
                    &services.stores,
                    services.embedder.as_ref(),
                    &self.cancel,
                )
                .await?;
                // Past this point the write barrier is crossed; no suspension.
                self.gate
                    .complete(&job.url_hash, job.claim(), document_id)
                    .await?;
                job.document_id = Some(document_id);
                persist::mark_complete(document, &job.persist, &services.stores).await?;
            }
            Stage::Queued
            | Stage::Completed
            | Stage::Failed
            | Stage::Duplicate
            | Stage::Cancelled => {
                return Err(StageError::Internal(format!("no executor for {stage}")));
            }
        }
        Ok(())
    }

    /// Save a non-terminal record, unless the claim was taken over.
    async fn checkpoint(&self, job: &IngestionJob) {
        if self.owns(job).await {
            self.save(job).await;
        } else {
            info!(stage = %job.stage, "Dedup claim lost; stopping");
            self.lost.store(true, Ordering::SeqCst);
            self.cancel.cancel();
        }
    }

    async fn owns(&self, job: &IngestionJob) -> bool {
        if self.lost.load(Ordering::SeqCst) {
            return false;
        }
        let claim = job.claim();
        match self.gate.holds(&job.url_hash, claim, job.document_id).await {
            Ok(held) => held,
            // Unreadable record: assume the claim is still held.
            Err(e) => {
                warn!(error = %e, "Failed to check dedup claim");
                true
            }
        }
    }

    async fn save(&self, job: &IngestionJob) {
        if let Err(e) = self.services.stores.jobs.save(job).await {
            warn!(error = %e, stage = %job.stage, "Failed to save job record");
        }
    }
}

fn missing(what: &str) -> StageError {
    StageError::Internal(format!("{what} is missing"))
}
