//! Configuration types for the ingestion pipeline.
//!
//! All pipeline behaviour is controlled through [`IngestConfig`], built via
//! its [`IngestConfigBuilder`]. A config that fails [`IngestConfigBuilder::build`]
//! is a startup error: the worker refuses to run rather than failing every
//! job it picks up.

use crate::error::IngestError;
use crate::retry::RetryPolicy;
use edgequake_llm::{EmbeddingProvider, LLMProvider};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Browser-like agent string. Several government portals answer 403 to
/// obvious bots.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Configuration for an ingestion pipeline.
///
/// # Example
/// ```rust
/// use edgequake_ingest::IngestConfig;
///
/// let config = IngestConfig::builder()
///     .max_attempts(5)
///     .pages_per_request(8)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct IngestConfig {
    // ── Fetch ────────────────────────────────────────────────────────────
    /// Whole-download deadline in seconds. Default: 40.
    pub download_timeout_secs: u64,

    /// Largest PDF accepted, in bytes. Default: 50 MiB.
    pub max_download_bytes: u64,

    /// `User-Agent` sent with downloads.
    pub user_agent: String,

    // ── Render ───────────────────────────────────────────────────────────
    /// Rendering DPI used when rasterising each PDF page. Range: 72–400. Default: 150.
    pub dpi: u32,

    /// Maximum rendered image dimension (width or height) in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    // ── Parse ────────────────────────────────────────────────────────────
    /// LLM model identifier, e.g. "gpt-4.1-mini". If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed vision provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the model may generate per request. Default: 16000.
    ///
    /// One request covers up to `pages_per_request` pages of dense legal
    /// text; a low cap truncates the JSON and turns every answer malformed.
    pub max_tokens: usize,

    /// Per-VLM-call timeout in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Page images sent per VLM request. Default: 10.
    pub pages_per_request: usize,

    /// Custom extraction instruction for the first request. If None, uses
    /// [`crate::prompts::EXTRACTION_PROMPT`].
    pub extraction_prompt: Option<String>,

    // ── Persist ──────────────────────────────────────────────────────────
    /// Pre-constructed embedding provider. If None, auto-detected from env.
    pub embedding_provider: Option<Arc<dyn EmbeddingProvider>>,

    // ── Validate ─────────────────────────────────────────────────────────
    /// Earliest plausible issuing year. Default: 1900.
    pub min_year: i32,

    /// Latest plausible year, relative to the current year. Default: 1.
    pub max_year_ahead: i32,

    // ── Retry ────────────────────────────────────────────────────────────
    pub retry: RetryPolicy,

    // ── Orchestrator ─────────────────────────────────────────────────────
    /// Jobs processed concurrently by one pipeline. Default: 4.
    pub max_concurrent_jobs: usize,

    /// Poll interval for joins on jobs owned by another worker. Default: 500.
    pub join_poll_interval_ms: u64,

    /// Lease on a dedup claim, renewed every third of it while the owning
    /// worker is alive. A job whose lease lapsed is taken over by the next
    /// worker that recovers or joins it. Default: 60 000.
    pub claim_lease_ms: u64,

    /// Directory for temp artifacts. If None, a private system temp dir.
    pub temp_dir: Option<PathBuf>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            download_timeout_secs: 40,
            max_download_bytes: 50 * 1024 * 1024,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            dpi: 150,
            max_rendered_pixels: 2000,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 16_000,
            api_timeout_secs: 120,
            pages_per_request: 10,
            extraction_prompt: None,
            embedding_provider: None,
            min_year: 1900,
            max_year_ahead: 1,
            retry: RetryPolicy::default(),
            max_concurrent_jobs: 4,
            join_poll_interval_ms: 500,
            claim_lease_ms: 60_000,
            temp_dir: None,
        }
    }
}

impl fmt::Debug for IngestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestConfig")
            .field("download_timeout_secs", &self.download_timeout_secs)
            .field("max_download_bytes", &self.max_download_bytes)
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field(
                "embedding_provider",
                &self.embedding_provider.as_ref().map(|_| "<dyn EmbeddingProvider>"),
            )
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("pages_per_request", &self.pages_per_request)
            .field("min_year", &self.min_year)
            .field("max_year_ahead", &self.max_year_ahead)
            .field("retry", &self.retry)
            .field("max_concurrent_jobs", &self.max_concurrent_jobs)
            .field("join_poll_interval_ms", &self.join_poll_interval_ms)
            .field("claim_lease_ms", &self.claim_lease_ms)
            .field("temp_dir", &self.temp_dir)
            .finish()
    }
}

impl IngestConfig {
    /// Create a new builder for `IngestConfig`.
    pub fn builder() -> IngestConfigBuilder {
        IngestConfigBuilder {
            config: Self::default(),
        }
    }

    /// Inclusive plausible-year range for a given current year.
    pub fn year_bounds(&self, current_year: i32) -> (i32, i32) {
        (self.min_year, current_year + self.max_year_ahead)
    }
}

/// Builder for [`IngestConfig`].
#[derive(Debug)]
pub struct IngestConfigBuilder {
    config: IngestConfig,
}

impl IngestConfigBuilder {
    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn max_download_bytes(mut self, bytes: u64) -> Self {
        self.config.max_download_bytes = bytes;
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config.user_agent = ua.into();
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.config.embedding_provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn pages_per_request(mut self, n: usize) -> Self {
        self.config.pages_per_request = n.max(1);
        self
    }

    pub fn extraction_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.extraction_prompt = Some(prompt.into());
        self
    }

    pub fn min_year(mut self, year: i32) -> Self {
        self.config.min_year = year;
        self
    }

    pub fn max_year_ahead(mut self, years: i32) -> Self {
        self.config.max_year_ahead = years;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.retry.max_attempts = n;
        self
    }

    pub fn retry_backoff_ms(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.config.retry.base_delay_ms = base_ms;
        self.config.retry.max_delay_ms = max_ms;
        self
    }

    pub fn malformed_output_attempts(mut self, n: u32) -> Self {
        self.config.retry.malformed_output_attempts = n;
        self
    }

    pub fn max_concurrent_jobs(mut self, n: usize) -> Self {
        self.config.max_concurrent_jobs = n.max(1);
        self
    }

    pub fn join_poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.join_poll_interval_ms = ms.max(1);
        self
    }

    pub fn claim_lease_ms(mut self, ms: u64) -> Self {
        self.config.claim_lease_ms = ms.max(30);
        self
    }

    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.temp_dir = Some(dir.into());
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<IngestConfig, IngestError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 400 {
            return Err(IngestError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                c.dpi
            )));
        }
        if c.retry.max_attempts == 0 {
            return Err(IngestError::InvalidConfig(
                "max_attempts must be ≥ 1".into(),
            ));
        }
        if c.retry.base_delay_ms > c.retry.max_delay_ms {
            return Err(IngestError::InvalidConfig(format!(
                "retry base delay ({}ms) exceeds the cap ({}ms)",
                c.retry.base_delay_ms, c.retry.max_delay_ms
            )));
        }
        if c.max_download_bytes == 0 {
            return Err(IngestError::InvalidConfig(
                "max_download_bytes must be > 0".into(),
            ));
        }
        if c.download_timeout_secs == 0 || c.api_timeout_secs == 0 {
            return Err(IngestError::InvalidConfig(
                "timeouts must be ≥ 1 second".into(),
            ));
        }
        if c.join_poll_interval_ms >= c.claim_lease_ms {
            return Err(IngestError::InvalidConfig(format!(
                "join poll interval ({}ms) must be shorter than the claim lease ({}ms)",
                c.join_poll_interval_ms, c.claim_lease_ms
            )));
        }
        if c.max_year_ahead < 0 {
            return Err(IngestError::InvalidConfig(format!(
                "max_year_ahead must be ≥ 0, got {}",
                c.max_year_ahead
            )));
        }
        Ok(self.config)
    }
}
