//! Stage Executors for the ingestion pipeline.
//!
//! Each submodule implements exactly one step. A stage takes the job's
//! upstream outputs and returns its own outputs or exactly one
//! [`StageError`]; it never touches the job record. Sequencing, retries and
//! record mutation belong to [`crate::machine`].
//!
//! ## Data Flow
//!
//! ```text
//! fetch ──▶ render ──▶ parse ──▶ validate ──▶ normalize ──▶ persist
//! (HTTP)    (pdfium)   (VLM)     (schema)     (chunks)      (stores)
//! ```
//!
//! 1. [`fetch`]: download the PDF into the job's [`TempScope`]
//! 2. [`render`]: rasterise every page; runs in `spawn_blocking` because
//!    pdfium is not async-safe
//! 3. [`encode`]: PNG bytes to base64 [`edgequake_llm::ImageData`]
//! 4. [`parse`]: batched VLM calls, JSON decoding into a tagged outcome
//! 5. [`validate`]: ordered, fail-fast schema checks
//! 6. [`normalize`]: whitespace canonicalisation, reindexing, content hashes
//! 7. [`persist`]: metadata, embeddings, then the `complete` marker
//!
//! ## Suspension points
//!
//! Downloads, model calls, embedding calls, store writes and retry sleeps go
//! through [`suspend`], which races them against the job's
//! [`CancellationToken`]. Nothing else observes cancellation.

pub mod encode;
pub mod fetch;
pub mod normalize;
pub mod parse;
pub mod persist;
pub mod render;
pub mod validate;

use crate::config::IngestConfig;
use crate::error::{IngestError, StageError};
use crate::store::Stores;
use crate::temp::{DiskTempStorage, TempScope, TempStorage};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use fetch::{Downloader, HttpDownloader};
pub use parse::{LlmVisionModel, VisionModel};
pub use persist::{Embedder, LlmEmbedder};
pub use render::{PageRenderer, PdfiumRenderer};

/// Every collaborator a state machine calls out to.
#[derive(Clone)]
pub struct Services {
    pub downloader: Arc<dyn Downloader>,
    pub renderer: Arc<dyn PageRenderer>,
    pub vision: Arc<dyn VisionModel>,
    pub embedder: Arc<dyn Embedder>,
    pub stores: Stores,
    pub temp: Arc<dyn TempStorage>,
}

impl Services {
    /// Build the production adapters from `config`.
    ///
    /// Provider resolution happens here, once, so a missing API key aborts
    /// startup with [`IngestError::ProviderNotConfigured`] instead of failing
    /// every job at PARSING.
    pub async fn from_config(config: &IngestConfig, stores: Stores) -> Result<Self, IngestError> {
        let temp: Arc<dyn TempStorage> = match &config.temp_dir {
            Some(dir) => Arc::new(DiskTempStorage::in_dir(dir).map_err(|e| {
                IngestError::InvalidConfig(format!(
                    "temp dir '{}' is unusable: {e}",
                    dir.display()
                ))
            })?),
            None => Arc::new(
                DiskTempStorage::new()
                    .map_err(|e| IngestError::Internal(format!("cannot create temp dir: {e}")))?,
            ),
        };

        Ok(Self {
            downloader: Arc::new(HttpDownloader::new(config)?),
            renderer: Arc::new(PdfiumRenderer::new(config)),
            vision: Arc::new(LlmVisionModel::from_config(config).await?),
            embedder: Arc::new(LlmEmbedder::from_config(config)?),
            stores,
            temp,
        })
    }

    /// A fresh artifact scope for one job.
    pub fn temp_scope(&self, job_id: uuid::Uuid) -> TempScope {
        TempScope::new(Arc::clone(&self.temp), job_id)
    }
}

/// Run `fut` unless `cancel` fires first.
///
/// A cancelled future is dropped where it stands; callers rely on every
/// write it may have started being idempotent.
pub(crate) async fn suspend<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, StageError>
where
    F: Future<Output = Result<T, StageError>>,
{
    if cancel.is_cancelled() {
        return Err(StageError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StageError::Cancelled),
        result = fut => result,
    }
}
