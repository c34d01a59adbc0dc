//! Pipeline orchestrator: submissions, dispatch, joins, cancellation.
//!
//! ```text
//! submit(url) ─▶ DedupGate ─┬─ Accepted ─▶ JobReady ─▶ dispatcher ─▶ JobStateMachine
//!                           ├─ Joined   ─▶ wait on the owner's outcome
//!                           └─ Duplicate ─▶ DUPLICATE record, outcome ready
//! ```
//!
//! Accepted jobs are sent as `JobReady` messages to a single dispatcher task,
//! which runs at most `max_concurrent_jobs` state machines at once on a
//! `JoinSet`. Every job gets its own [`CancellationToken`] and a
//! `watch` channel that carries its terminal [`JobOutcome`].
//!
//! ## Leases
//!
//! A heartbeat task renews the dedup lease of every job this process owns,
//! queued or running, every third of `claim_lease_ms`. A job whose lease
//! could not be renewed because another worker took it over is cancelled
//! locally.
//!
//! ## Joins
//!
//! A submission that finds another job's in-flight claim is joined to it:
//!
//! - owner running in this process: wait on the owner's `watch` channel;
//! - owner running elsewhere: poll the job store every
//!   `join_poll_interval_ms` until the owner's record is terminal. If the
//!   owner's lease lapses first, the joined submission takes the job over
//!   and runs it here.
//!
//! Either way the joined submission reports the owner's job id and outcome.

use crate::canonical::CanonicalUrl;
use crate::config::IngestConfig;
use crate::dedup::{DedupGate, Disposition, Redelivery};
use crate::error::IngestError;
use crate::job::{IngestionJob, JobError, JobOutcome, JobStatus};
use crate::machine::JobStateMachine;
use crate::pipeline::{persist, Services};
use crate::progress::{NoopObserver, Observer};
use crate::store::{Claim, JobStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long a joined submission waits for a claimed job's record to appear
/// in the job store before treating the claim as orphaned.
const ORPHAN_CLAIM_GRACE: Duration = Duration::from_secs(30);

type OutcomeTx = watch::Sender<Option<JobOutcome>>;
type OutcomeRx = watch::Receiver<Option<JobOutcome>>;

/// A job handed to the dispatcher.
struct JobReady {
    job: IngestionJob,
    cancel: CancellationToken,
    done: OutcomeTx,
}

/// A dedup claim owned by this process.
#[derive(Clone)]
struct Lease {
    url_hash: String,
    claim: Claim,
    cancel: CancellationToken,
}

/// What redelivering an unfinished job led to.
enum Redelivered {
    /// Queued here; the receiver carries its outcome.
    Running(OutcomeRx),
    /// Another worker's lease on the job is still live.
    Elsewhere,
    /// The record was settled without running anything.
    Settled(Disposition, JobOutcome),
}

struct Inner {
    config: Arc<IngestConfig>,
    services: Services,
    gate: DedupGate,
    observer: Observer,
    /// Outcome channels of jobs owned by this process, by job id.
    inflight: Mutex<HashMap<Uuid, OutcomeRx>>,
    /// Claims of jobs owned by this process, queued or running.
    running: Mutex<HashMap<Uuid, Lease>>,
    ready_tx: Mutex<Option<mpsc::UnboundedSender<JobReady>>>,
    /// Stops the heartbeat.
    stop: CancellationToken,
}

/// Handle returned for every accepted, joined or duplicate submission.
pub struct Submission {
    /// The job whose outcome this submission reports. For a joined
    /// submission this is the owner's id.
    pub job_id: Uuid,
    pub url_hash: String,
    pub disposition: Disposition,
    waiter: Waiter,
}

enum Waiter {
    Ready(JobOutcome),
    Local(OutcomeRx, Arc<dyn JobStore>),
    Remote(Arc<Inner>),
}

impl Submission {
    /// Wait for the terminal outcome.
    pub async fn wait(self) -> Result<JobOutcome, IngestError> {
        match self.waiter {
            Waiter::Ready(outcome) => Ok(outcome),
            Waiter::Local(rx, jobs) => wait_local(self.job_id, rx, jobs).await,
            Waiter::Remote(inner) => inner.wait_remote(self.job_id, &self.url_hash).await,
        }
    }
}

async fn wait_local(
    job_id: Uuid,
    mut rx: OutcomeRx,
    jobs: Arc<dyn JobStore>,
) -> Result<JobOutcome, IngestError> {
    let outcome = rx.wait_for(Option::is_some).await.ok().and_then(|o| o.clone());
    match outcome {
        Some(outcome) => Ok(outcome),
        // The owning task died without reporting; trust the record.
        None => match jobs.get(job_id).await? {
            Some(job) if job.is_terminal() => Ok(job.outcome()),
            _ => Err(IngestError::Internal(format!(
                "job {job_id} ended without an outcome"
            ))),
        },
    }
}

/// The ingestion pipeline of one worker process.
///
/// # Example
///
/// ```rust,no_run
/// use edgequake_ingest::{IngestConfig, Pipeline, Services, Stores};
///
/// # async fn run() -> Result<(), edgequake_ingest::IngestError> {
/// let config = IngestConfig::builder().model("gpt-4.1-mini").build()?;
/// let services = Services::from_config(&config, Stores::on_disk("./state").await?).await?;
/// let pipeline = Pipeline::new(config, services);
///
/// pipeline.recover().await?;
/// let submission = pipeline.submit("https://gov.example/decree-12.pdf").await?;
/// let outcome = submission.wait().await?;
/// println!("{} → {:?}", outcome.job_id, outcome.status);
/// pipeline.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    inner: Arc<Inner>,
    ready_rx: Mutex<Option<mpsc::UnboundedReceiver<JobReady>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn new(config: IngestConfig, services: Services) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = DedupGate::new(Arc::clone(&services.stores.dedup));
        Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                services,
                gate,
                observer: Arc::new(NoopObserver),
                inflight: Mutex::new(HashMap::new()),
                running: Mutex::new(HashMap::new()),
                ready_tx: Mutex::new(Some(tx)),
                stop: CancellationToken::new(),
            }),
            ready_rx: Mutex::new(Some(rx)),
            dispatcher: Mutex::new(None),
            heartbeat: Mutex::new(None),
        }
    }

    /// Attach an observer. Call before the first submission.
    pub fn with_observer(mut self, observer: Observer) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.observer = observer,
            None => warn!("Observer ignored: pipeline already started"),
        }
        self
    }

    /// Spawn the dispatcher and heartbeat tasks. Called implicitly by
    /// `submit` and `recover`; calling it again is a no-op.
    pub fn start(&self) {
        let rx = lock(&self.ready_rx).take();
        if let Some(rx) = rx {
            *lock(&self.dispatcher) = Some(tokio::spawn(dispatch(Arc::clone(&self.inner), rx)));
            *lock(&self.heartbeat) = Some(tokio::spawn(heartbeat(Arc::clone(&self.inner))));
        }
    }

    /// Submit a source URL.
    ///
    /// Fails only for an invalid URL or an unreachable store; every other
    /// outcome is reported through the returned [`Submission`].
    pub async fn submit(&self, url: &str) -> Result<Submission, IngestError> {
        let url = CanonicalUrl::parse(url)?;
        self.start();
        let inner = &self.inner;

        // An owner that already ended FAILED or CANCELLED may still hold its
        // claim; `join` clears it and the loop claims again.
        for _ in 0..3 {
            let job = IngestionJob::new(&url);
            let job_id = job.job_id;
            let (done, rx) = watch::channel(None);
            lock(&inner.inflight).insert(job_id, rx.clone());

            let disposition = match inner.gate.check_and_claim(&url, job_id).await {
                Ok(d) => d,
                Err(e) => {
                    lock(&inner.inflight).remove(&job_id);
                    return Err(e.into());
                }
            };

            match disposition {
                Disposition::Accepted => {
                    if let Err(e) = inner.services.stores.jobs.save(&job).await {
                        lock(&inner.inflight).remove(&job_id);
                        inner.gate.release(&url.hash, job.claim()).await;
                        return Err(e.into());
                    }
                    inner.observer.on_submitted(job_id, &url.source, &disposition);
                    info!(%job_id, url = %url.source, url_hash = %url.hash, "Job accepted");
                    inner.enqueue(job, done)?;
                    return Ok(Submission {
                        job_id,
                        url_hash: url.hash,
                        disposition,
                        waiter: Waiter::Local(rx, Arc::clone(&inner.services.stores.jobs)),
                    });
                }
                Disposition::Duplicate { document_id } => {
                    lock(&inner.inflight).remove(&job_id);
                    if let Err(e) = persist::finish_commit(document_id, &inner.services.stores).await {
                        warn!(%document_id, error = %e, "Failed to finish committed document");
                    }
                    let dup = IngestionJob::duplicate_of(&url, document_id);
                    inner.services.stores.jobs.save(&dup).await?;
                    inner.observer.on_submitted(dup.job_id, &url.source, &disposition);
                    info!(job_id = %dup.job_id, %document_id, url = %url.source, "Duplicate submission");
                    let outcome = dup.outcome();
                    inner.observer.on_job_finished(&outcome);
                    return Ok(Submission {
                        job_id: dup.job_id,
                        url_hash: url.hash,
                        disposition,
                        waiter: Waiter::Ready(outcome),
                    });
                }
                Disposition::Joined { job_id: owner } => {
                    lock(&inner.inflight).remove(&job_id);
                    if let Some(waiter) = self.join(&url, owner).await? {
                        inner.observer.on_submitted(owner, &url.source, &disposition);
                        info!(job_id = %owner, url = %url.source, "Joined in-flight job");
                        return Ok(Submission {
                            job_id: owner,
                            url_hash: url.hash,
                            disposition,
                            waiter,
                        });
                    }
                }
            }
        }
        Err(IngestError::Internal(format!(
            "could not claim or join '{}'",
            url.source
        )))
    }

    /// Build the waiter for a joined submission. `None` means the owner
    /// already ended without a document and its claim was cleared; the
    /// caller should try to claim again.
    async fn join(&self, url: &CanonicalUrl, owner: Uuid) -> Result<Option<Waiter>, IngestError> {
        let local = lock(&self.inner.inflight).get(&owner).cloned();
        if let Some(rx) = local {
            return Ok(Some(Waiter::Local(
                rx,
                Arc::clone(&self.inner.services.stores.jobs),
            )));
        }

        match self.inner.services.stores.jobs.get(owner).await? {
            Some(job) if job.is_terminal() && job.status != JobStatus::Completed => {
                debug!(%owner, status = %job.status, "Clearing claim of finished job");
                self.inner.gate.release_job(&url.hash, owner).await;
                Ok(None)
            }
            _ => Ok(Some(Waiter::Remote(Arc::clone(&self.inner)))),
        }
    }

    /// Redeliver every unfinished job found in the job store.
    ///
    /// Call at worker startup. Jobs already running in this process are
    /// skipped; jobs whose lease is still live elsewhere are joined.
    pub async fn recover(&self) -> Result<Vec<Submission>, IngestError> {
        self.start();
        let unfinished = self.inner.services.stores.jobs.list_unfinished().await?;
        let mut submissions = Vec::with_capacity(unfinished.len());

        for job in unfinished {
            if lock(&self.inner.running).contains_key(&job.job_id) {
                continue;
            }
            let job_id = job.job_id;
            let url_hash = job.url_hash.clone();
            let source = job.source_url.clone();

            let (disposition, waiter) = match self.inner.redeliver(job).await? {
                Redelivered::Running(rx) => (
                    Disposition::Accepted,
                    Waiter::Local(rx, Arc::clone(&self.inner.services.stores.jobs)),
                ),
                Redelivered::Elsewhere => {
                    info!(%job_id, "Job leased by another worker; joining it");
                    (
                        Disposition::Joined { job_id },
                        Waiter::Remote(Arc::clone(&self.inner)),
                    )
                }
                Redelivered::Settled(disposition, outcome) => {
                    (disposition, Waiter::Ready(outcome))
                }
            };
            if !matches!(waiter, Waiter::Ready(_)) {
                self.inner.observer.on_submitted(job_id, &source, &disposition);
            }
            submissions.push(Submission {
                job_id,
                url_hash,
                disposition,
                waiter,
            });
        }
        Ok(submissions)
    }

    /// Request cancellation of a job running in this process.
    ///
    /// Returns `false` when the job is unknown here or already finished.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match lock(&self.inner.running).get(&job_id) {
            Some(lease) => {
                info!(%job_id, "Cancellation requested");
                lease.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every job running in this process.
    pub fn cancel_all(&self) -> usize {
        let running = lock(&self.inner.running);
        for lease in running.values() {
            lease.cancel.cancel();
        }
        running.len()
    }

    /// Current record of a job.
    pub async fn status(&self, job_id: Uuid) -> Result<IngestionJob, IngestError> {
        self.inner
            .services
            .stores
            .jobs
            .get(job_id)
            .await?
            .ok_or(IngestError::JobNotFound(job_id))
    }

    /// Stop accepting jobs and wait for the running ones to finish.
    pub async fn shutdown(&self) {
        lock(&self.inner.ready_tx).take();
        let dispatcher = lock(&self.dispatcher).take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                error!(error = ?e, "Dispatcher task panicked");
            }
        }
        self.inner.stop.cancel();
        let heartbeat = lock(&self.heartbeat).take();
        if let Some(handle) = heartbeat {
            if let Err(e) = handle.await {
                error!(error = ?e, "Heartbeat task panicked");
            }
        }
    }
}

/// Dispatcher loop: one state machine per `JobReady`, bounded by a semaphore.
async fn dispatch(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<JobReady>) {
    let max_concurrent = inner.config.max_concurrent_jobs;
    let permits = Arc::new(Semaphore::new(max_concurrent));
    let mut tasks = JoinSet::new();
    info!(max_concurrent, "Pipeline dispatcher started");

    loop {
        tokio::select! {
            ready = rx.recv() => {
                let Some(ready) = ready else { break };
                let permit = match Arc::clone(&permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let inner = Arc::clone(&inner);
                tasks.spawn(async move {
                    let _permit = permit;
                    inner.run_job(ready).await;
                });
            }
            Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = result {
                    error!(error = ?e, "Job task panicked");
                }
            }
        }
    }

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = ?e, "Job task panicked");
        }
    }
    info!("Pipeline dispatcher stopped");
}

/// Renew the lease of every claim this process owns until `stop` fires.
async fn heartbeat(inner: Arc<Inner>) {
    let every = Duration::from_millis((inner.config.claim_lease_ms / 3).max(1));
    loop {
        tokio::select! {
            _ = inner.stop.cancelled() => break,
            _ = tokio::time::sleep(every) => inner.renew_leases().await,
        }
    }
    debug!("Lease heartbeat stopped");
}

impl Inner {
    /// Hand a saved job record to the dispatcher.
    fn enqueue(&self, job: IngestionJob, done: OutcomeTx) -> Result<(), IngestError> {
        let job_id = job.job_id;
        let cancel = CancellationToken::new();
        let lease = Lease {
            url_hash: job.url_hash.clone(),
            claim: job.claim(),
            cancel: cancel.clone(),
        };
        lock(&self.running).insert(job_id, lease);

        let sent = lock(&self.ready_tx)
            .as_ref()
            .map(|tx| tx.send(JobReady { job, cancel, done }).is_ok())
            .unwrap_or(false);
        if !sent {
            lock(&self.running).remove(&job_id);
            lock(&self.inflight).remove(&job_id);
            return Err(IngestError::Internal(
                "pipeline is shut down; job left queued for recovery".into(),
            ));
        }
        Ok(())
    }

    /// Take over an unfinished job, or settle its record when the URL has
    /// moved on without it.
    async fn redeliver(&self, mut job: IngestionJob) -> Result<Redelivered, IngestError> {
        let job_id = job.job_id;
        let lease = Duration::from_millis(self.config.claim_lease_ms);
        let redelivery = self.gate.redeliver(&job.url_hash, job_id, lease).await?;
        let disposition = match redelivery {
            Redelivery::Owned(claim) => {
                info!(%job_id, stage = %job.stage, generation = claim.generation, "Redelivering job");
                job.claim_generation = claim.generation;
                let (done, rx) = watch::channel(None);
                lock(&self.inflight).insert(job_id, rx.clone());
                self.enqueue(job, done)?;
                return Ok(Redelivered::Running(rx));
            }
            Redelivery::Leased => return Ok(Redelivered::Elsewhere),
            Redelivery::Superseded { owner } => Disposition::Joined { job_id: owner },
            Redelivery::Stored { document_id } => Disposition::Duplicate { document_id },
        };

        // The owning worker may have finished the job meanwhile.
        if let Some(current) = self.services.stores.jobs.get(job_id).await? {
            if current.is_terminal() {
                return Ok(Redelivered::Settled(disposition, current.outcome()));
            }
            job = current;
        }

        match redelivery {
            Redelivery::Stored { document_id } => {
                // Our own document when the crash hit after the dedup commit.
                let own = job.document.as_ref().map(|d| d.document_id()) == Some(document_id);
                if own {
                    persist::finish_commit(document_id, &self.services.stores).await?;
                }
                job.document_id = Some(document_id);
                job.finish(if own {
                    JobStatus::Completed
                } else {
                    JobStatus::Duplicate
                });
            }
            Redelivery::Superseded { owner } => {
                job.last_error = Some(JobError::cancelled(
                    job.stage,
                    job.attempts(job.stage),
                    format!("superseded by job {owner}"),
                ));
                job.finish(JobStatus::Cancelled);
            }
            // Returned above.
            Redelivery::Owned(_) | Redelivery::Leased => {}
        }
        self.services.stores.jobs.save(&job).await?;
        info!(%job_id, status = %job.status, "Recovered job settled");
        Ok(Redelivered::Settled(disposition, job.outcome()))
    }

    /// Poll the job store for a job owned elsewhere, taking it over if its
    /// lease lapses.
    async fn wait_remote(&self, job_id: Uuid, url_hash: &str) -> Result<JobOutcome, IngestError> {
        let poll = Duration::from_millis(self.config.join_poll_interval_ms);
        let jobs = Arc::clone(&self.services.stores.jobs);
        let started = Instant::now();
        loop {
            let local = lock(&self.inflight).get(&job_id).cloned();
            if let Some(rx) = local {
                return wait_local(job_id, rx, jobs).await;
            }
            match jobs.get(job_id).await? {
                Some(job) if job.is_terminal() => return Ok(job.outcome()),
                Some(job) => match self.redeliver(job).await? {
                    Redelivered::Running(rx) => {
                        info!(%job_id, "Took over a job whose lease lapsed");
                        return wait_local(job_id, rx, jobs).await;
                    }
                    Redelivered::Settled(_, outcome) => return Ok(outcome),
                    Redelivered::Elsewhere => {}
                },
                None if started.elapsed() >= ORPHAN_CLAIM_GRACE => {
                    warn!(%job_id, %url_hash, "Dropping orphaned dedup claim");
                    self.gate.release_job(url_hash, job_id).await;
                    return Err(IngestError::JobNotFound(job_id));
                }
                None => {}
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn renew_leases(&self) {
        let leases: Vec<(Uuid, Lease)> = lock(&self.running)
            .iter()
            .map(|(id, lease)| (*id, lease.clone()))
            .collect();
        for (job_id, lease) in leases {
            match self.gate.renew(&lease.url_hash, lease.claim).await {
                Ok(true) => {}
                Ok(false) => {
                    // A job that just released its claim is still listed.
                    if lock(&self.running).contains_key(&job_id) {
                        warn!(%job_id, "Dedup claim taken over; cancelling local run");
                        lease.cancel.cancel();
                    }
                }
                Err(e) => warn!(%job_id, error = %e, "Failed to renew dedup lease"),
            }
        }
    }

    async fn run_job(&self, ready: JobReady) {
        let JobReady { job, cancel, done } = ready;
        let job_id = job.job_id;
        let machine = JobStateMachine::new(
            self.services.clone(),
            Arc::clone(&self.config),
            self.gate.clone(),
            Arc::clone(&self.observer),
            cancel,
        );
        let outcome = machine.run(job).await;

        done.send_replace(Some(outcome));
        lock(&self.inflight).remove(&job_id);
        lock(&self.running).remove(&job_id);
    }
}

/// Lock a std mutex, recovering the data if a holder panicked.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
