//! Observer trait for job lifecycle events.
//!
//! Pass an [`Arc<dyn IngestObserver>`] to [`crate::Pipeline::with_observer`]
//! to receive events as jobs move through the pipeline. Callers forward them
//! wherever they like: a progress bar, a broadcast channel, a metrics sink.
//!
//! # Thread safety
//!
//! Many jobs run concurrently, so every method may be called from several
//! Tokio tasks at once. Implementations protect shared state with atomics or
//! locks. Methods run inline on the job's task: keep them cheap.
//!
//! # Example
//!
//! ```rust
//! use edgequake_ingest::{IngestObserver, JobOutcome, JobStatus};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! #[derive(Default)]
//! struct FailureCounter(AtomicUsize);
//!
//! impl IngestObserver for FailureCounter {
//!     fn on_job_finished(&self, outcome: &JobOutcome) {
//!         if outcome.status == JobStatus::Failed {
//!             self.0.fetch_add(1, Ordering::SeqCst);
//!         }
//!     }
//! }
//! ```

use crate::dedup::Disposition;
use crate::job::{JobOutcome, Stage};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Called by the pipeline as jobs progress. All methods default to no-ops.
pub trait IngestObserver: Send + Sync {
    /// A submission passed the dedup gate.
    fn on_submitted(&self, job_id: Uuid, url: &str, disposition: &Disposition) {
        let _ = (job_id, url, disposition);
    }

    /// A stage is about to run. `attempt` is 1-based.
    fn on_stage_start(&self, job_id: Uuid, stage: Stage, attempt: u32) {
        let _ = (job_id, stage, attempt);
    }

    /// A stage failed with a retryable error and will run again after `delay`.
    fn on_retry_scheduled(&self, job_id: Uuid, stage: Stage, attempt: u32, delay: Duration, error: &str) {
        let _ = (job_id, stage, attempt, delay, error);
    }

    /// A job reached a terminal status.
    fn on_job_finished(&self, outcome: &JobOutcome) {
        let _ = outcome;
    }
}

/// The default when no observer is configured.
pub struct NoopObserver;

impl IngestObserver for NoopObserver {}

/// Shared handle type held by the pipeline.
pub type Observer = Arc<dyn IngestObserver>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Tracking {
        stages: AtomicUsize,
        retries: AtomicUsize,
        finished: AtomicUsize,
    }

    impl IngestObserver for Tracking {
        fn on_stage_start(&self, _: Uuid, _: Stage, _: u32) {
            self.stages.fetch_add(1, Ordering::SeqCst);
        }

        fn on_retry_scheduled(&self, _: Uuid, _: Stage, _: u32, _: Duration, _: &str) {
            self.retries.fetch_add(1, Ordering::SeqCst);
        }

        fn on_job_finished(&self, _: &JobOutcome) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn outcome() -> JobOutcome {
        JobOutcome {
            job_id: Uuid::new_v4(),
            url_hash: "h".into(),
            status: JobStatus::Completed,
            document_id: None,
            error: None,
        }
    }

    #[test]
    fn noop_observer_does_not_panic() {
        let obs: Observer = Arc::new(NoopObserver);
        let id = Uuid::new_v4();
        obs.on_submitted(id, "https://x", &Disposition::Accepted);
        obs.on_stage_start(id, Stage::Fetching, 1);
        obs.on_retry_scheduled(id, Stage::Fetching, 1, Duration::from_millis(5), "timeout");
        obs.on_job_finished(&outcome());
    }

    #[test]
    fn overridden_methods_receive_events() {
        let t = Tracking::default();
        let id = Uuid::new_v4();
        t.on_stage_start(id, Stage::Fetching, 1);
        t.on_retry_scheduled(id, Stage::Fetching, 1, Duration::ZERO, "x");
        t.on_stage_start(id, Stage::Fetching, 2);
        t.on_job_finished(&outcome());
        assert_eq!(t.stages.load(Ordering::SeqCst), 2);
        assert_eq!(t.retries.load(Ordering::SeqCst), 1);
        assert_eq!(t.finished.load(Ordering::SeqCst), 1);
    }
}
