//! # edgequake-ingest
//!
//! Ingest scanned legal PDFs by URL into a document store and a vector index,
//! using a Vision Language Model (VLM) to read the pages.
//!
//! ## Why this crate?
//!
//! Decrees, rulings and ministerial circulars are often published as scans:
//! there is no text layer to extract. This crate rasterises every page, asks
//! a VLM for the title, year, issuing authority and the document's sections,
//! validates that answer against a strict schema, and stores the result
//! exactly once per source URL, however many times the URL is submitted.
//!
//! ## Pipeline Overview
//!
//! ```text
//! URL
//!  │
//!  ├─ 0. Dedup      canonicalise + hash the URL, claim it or join the owner
//!  ├─ 1. Fetch      download the PDF into per-job temp storage
//!  ├─ 2. Render     rasterise pages via pdfium (CPU-bound, spawn_blocking)
//!  ├─ 3. Parse      batched VLM calls → title / year / authority / chunks
//!  ├─ 4. Validate   ordered schema checks; failures are never retried
//!  ├─ 5. Normalize  whitespace canonicalisation, contiguous chunk indices
//!  └─ 6. Persist    metadata, one embedding per chunk, then `complete`
//! ```
//!
//! Every job is a persisted state machine ([`IngestionJob`]). Transient
//! failures retry with exponential backoff; a crashed worker picks its jobs
//! up again with [`Pipeline::recover`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_ingest::{IngestConfig, Pipeline, Services, Stores};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = IngestConfig::default();
//!     let services = Services::from_config(&config, Stores::on_disk("./state").await?).await?;
//!     let pipeline = Pipeline::new(config, services);
//!
//!     let outcome = pipeline
//!         .submit("https://gov.example/gazette/decree-12.pdf")
//!         .await?
//!         .wait()
//!         .await?;
//!     println!("{} {:?}", outcome.status, outcome.document_id);
//!     pipeline.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf-ingest` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-ingest = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod canonical;
pub mod config;
pub mod dedup;
pub mod document;
pub mod error;
pub mod job;
pub mod machine;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod retry;
pub mod store;
pub mod temp;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use canonical::CanonicalUrl;
pub use config::{IngestConfig, IngestConfigBuilder};
pub use dedup::{DedupGate, Disposition, Redelivery};
pub use document::{Chunk, DocumentStatus, ExtractedDocument};
pub use error::{ErrorKind, IngestError, StageError, StoreError, ValidationError};
pub use job::{IngestionJob, JobError, JobOutcome, JobStatus, Stage};
pub use orchestrator::{Pipeline, Submission};
pub use pipeline::Services;
pub use progress::{IngestObserver, NoopObserver, Observer};
pub use retry::{RetryDecision, RetryPolicy};
pub use store::Stores;
