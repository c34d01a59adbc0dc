//! CLI binary for edgequake-ingest.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `IngestConfig`, submits every URL and prints the job outcomes.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_ingest::{
    Disposition, IngestConfig, IngestObserver, JobOutcome, JobStatus, Pipeline, Services, Stage,
    Stores, Submission,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

fn short(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

// ── CLI observer using indicatif ─────────────────────────────────────────────

/// Terminal observer: one bar counting finished jobs, one log line per event.
struct CliObserver {
    bar: ProgressBar,
}

impl CliObserver {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} jobs  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Ingesting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl IngestObserver for CliObserver {
    fn on_submitted(&self, job_id: Uuid, url: &str, disposition: &Disposition) {
        let label = match disposition {
            Disposition::Accepted => {
                self.bar.inc_length(1);
                cyan("accepted")
            }
            Disposition::Duplicate { .. } => {
                self.bar.inc_length(1);
                dim("duplicate")
            }
            Disposition::Joined { .. } => dim("joined"),
        };
        self.bar
            .println(format!("{} {}  {:<9}  {}", cyan("◆"), short(job_id), label, url));
    }

    fn on_stage_start(&self, job_id: Uuid, stage: Stage, attempt: u32) {
        let msg = if attempt > 1 {
            format!("{} {stage} (attempt {attempt})", short(job_id))
        } else {
            format!("{} {stage}", short(job_id))
        };
        self.bar.set_message(msg);
    }

    fn on_retry_scheduled(&self, job_id: Uuid, stage: Stage, attempt: u32, delay: Duration, error: &str) {
        let msg = if error.len() > 80 {
            let cut = error.char_indices().nth(79).map(|(i, _)| i).unwrap_or(error.len());
            format!("{}\u{2026}", &error[..cut])
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} {}  {stage} attempt {attempt} failed, retry in {:.1}s  {}",
            yellow("↻"),
            short(job_id),
            delay.as_secs_f64(),
            dim(&msg),
        ));
    }

    fn on_job_finished(&self, outcome: &JobOutcome) {
        self.bar.inc(1);
        self.bar.println(format!(
            "  {} {}  {}",
            status_mark(outcome.status),
            short(outcome.job_id),
            outcome.status
        ));
    }
}

fn status_mark(status: JobStatus) -> String {
    match status {
        JobStatus::Completed => green("✓"),
        JobStatus::Duplicate => dim("="),
        JobStatus::Cancelled => yellow("⊘"),
        JobStatus::Failed => red("✗"),
        JobStatus::Running => cyan("…"),
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Ingest one gazette scan (in-memory state, nothing survives the run)
  pdf-ingest https://gov.example/gazette/decree-12.pdf

  # Shared state directory: duplicates across runs are detected and
  # unfinished jobs from a crashed run are resumed first
  pdf-ingest --state-dir /var/lib/pdf-ingest URL1 URL2 URL3

  # Specific model, smaller batches, JSON outcomes
  pdf-ingest --provider openai --model gpt-4.1 --pages-per-request 4 --json URL

EXIT STATUS:
  0  every job COMPLETED, was a DUPLICATE, or was CANCELLED
  1  at least one job FAILED or could not be submitted

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key (vision + embeddings)
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  RUST_LOG                Log filter, overrides --verbose / --quiet
"#;

/// Ingest scanned legal PDFs by URL.
#[derive(Parser, Debug)]
#[command(
    name = "pdf-ingest",
    version,
    about = "Ingest scanned legal PDFs by URL using Vision LLMs",
    long_about = "Download scanned legal PDFs, extract title, year, issuing authority and \
sections with a Vision Language Model, validate the result and store it with one embedding \
per section. Each source URL is ingested exactly once.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// HTTP/HTTPS URLs of the PDFs to ingest.
    #[arg(required = true)]
    urls: Vec<String>,

    /// Directory for the file-backed stores. In-memory stores when unset.
    #[arg(long, env = "PDF_INGEST_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Vision LLM model ID (e.g. gpt-4.1-mini, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Rendering DPI (72–400).
    #[arg(long, env = "PDF_INGEST_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Longest rendered page edge in pixels.
    #[arg(long, env = "PDF_INGEST_MAX_PIXELS", default_value_t = 2000)]
    max_pixels: u32,

    /// Pages sent to the model per request.
    #[arg(long, env = "PDF_INGEST_PAGES_PER_REQUEST", default_value_t = 10)]
    pages_per_request: usize,

    /// Path to a text file replacing the built-in extraction instruction.
    #[arg(long, env = "PDF_INGEST_PROMPT")]
    prompt: Option<PathBuf>,

    /// Max LLM output tokens per request.
    #[arg(long, env = "PDF_INGEST_MAX_TOKENS", default_value_t = 16000)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "PDF_INGEST_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Per-request LLM timeout in seconds.
    #[arg(long, env = "PDF_INGEST_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "PDF_INGEST_DOWNLOAD_TIMEOUT", default_value_t = 40)]
    download_timeout: u64,

    /// Largest accepted PDF in MiB.
    #[arg(long, env = "PDF_INGEST_MAX_DOWNLOAD_MB", default_value_t = 50)]
    max_download_mb: u64,

    /// User-Agent header for downloads.
    #[arg(long, env = "PDF_INGEST_USER_AGENT")]
    user_agent: Option<String>,

    /// Oldest accepted publication year.
    #[arg(long, env = "PDF_INGEST_MIN_YEAR", default_value_t = 1900)]
    min_year: i32,

    /// Years past the current one still accepted as a publication year.
    #[arg(long, env = "PDF_INGEST_MAX_YEAR_AHEAD", default_value_t = 1)]
    max_year_ahead: i32,

    /// Attempts per stage for transient failures.
    #[arg(long, env = "PDF_INGEST_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// Attempts per stage for malformed model output.
    #[arg(long, env = "PDF_INGEST_MALFORMED_ATTEMPTS", default_value_t = 2)]
    malformed_attempts: u32,

    /// First retry delay in milliseconds (doubles per attempt).
    #[arg(long, env = "PDF_INGEST_RETRY_BASE_MS", default_value_t = 500)]
    retry_base_ms: u64,

    /// Retry delay cap in milliseconds.
    #[arg(long, env = "PDF_INGEST_RETRY_MAX_MS", default_value_t = 30_000)]
    retry_max_ms: u64,

    /// Jobs processed concurrently.
    #[arg(short, long, env = "PDF_INGEST_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Poll interval when waiting on a job owned by another worker.
    #[arg(long, env = "PDF_INGEST_JOIN_POLL_MS", default_value_t = 500)]
    join_poll_ms: u64,

    /// How long a dedup claim stays valid without a heartbeat. A crashed
    /// worker's jobs can be taken over once it lapses.
    #[arg(long, env = "PDF_INGEST_CLAIM_LEASE_MS", default_value_t = 60_000)]
    claim_lease_ms: u64,

    /// Directory for downloaded PDFs and rendered pages.
    #[arg(long, env = "PDF_INGEST_TEMP_DIR")]
    temp_dir: Option<PathBuf>,

    /// Print job outcomes as JSON.
    #[arg(long, env = "PDF_INGEST_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDF_INGEST_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF_INGEST_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF_INGEST_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build pipeline ───────────────────────────────────────────────────
    let config = build_config(&cli).await?;

    let stores = match cli.state_dir {
        Some(ref dir) => Stores::on_disk(dir)
            .await
            .with_context(|| format!("Failed to open state directory {:?}", dir))?,
        None => Stores::in_memory(),
    };
    let services = Services::from_config(&config, stores)
        .await
        .context("Failed to initialise pipeline services")?;

    let observer = show_progress.then(CliObserver::new);
    let mut pipeline = Pipeline::new(config, services);
    if let Some(ref obs) = observer {
        pipeline = pipeline.with_observer(obs.clone());
    }
    let pipeline = Arc::new(pipeline);

    {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let n = pipeline.cancel_all();
                eprintln!("{} cancelling {n} running job(s)…", yellow("⊘"));
            }
        });
    }

    // ── Submit ───────────────────────────────────────────────────────────
    let mut submissions: Vec<Submission> = Vec::new();
    let mut rejected = 0usize;

    if cli.state_dir.is_some() {
        let recovered = pipeline
            .recover()
            .await
            .context("Failed to recover unfinished jobs")?;
        if !recovered.is_empty() && !cli.quiet {
            eprintln!("{} resuming {} unfinished job(s)", cyan("◆"), recovered.len());
        }
        submissions.extend(recovered);
    }

    for url in &cli.urls {
        match pipeline.submit(url).await {
            Ok(s) => submissions.push(s),
            Err(e) => {
                rejected += 1;
                eprintln!("{} {}", red("✗"), e);
            }
        }
    }

    // ── Wait ─────────────────────────────────────────────────────────────
    let results = futures::future::join_all(submissions.into_iter().map(Submission::wait)).await;
    pipeline.shutdown().await;
    if let Some(ref obs) = observer {
        obs.bar.finish_and_clear();
    }

    let mut outcomes = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                rejected += 1;
                eprintln!("{} {}", red("✗"), e);
            }
        }
    }

    // ── Report ───────────────────────────────────────────────────────────
    if cli.json {
        let json = serde_json::to_string_pretty(&outcomes).context("Failed to serialise outcomes")?;
        println!("{json}");
    } else if !cli.quiet {
        for o in &outcomes {
            let detail = match (&o.document_id, &o.error) {
                (Some(doc), _) => format!("document {doc}"),
                (None, Some(err)) => format!("{:?} at {}: {}", err.kind, err.stage, err.message),
                (None, None) => String::new(),
            };
            println!("{} {}  {:<9}  {}", status_mark(o.status), o.job_id, o.status, detail);
        }
    }

    let failed = rejected + outcomes.iter().filter(|o| o.status == JobStatus::Failed).count();
    if failed > 0 {
        if !cli.quiet {
            eprintln!("{} {failed} job(s) failed", red("✘"));
        }
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// Map CLI args to `IngestConfig`.
async fn build_config(cli: &Cli) -> Result<IngestConfig> {
    let prompt = if let Some(ref path) = cli.prompt {
        Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read extraction prompt from {:?}", path))?,
        )
    } else {
        None
    };

    let mut builder = IngestConfig::builder()
        .dpi(cli.dpi)
        .max_rendered_pixels(cli.max_pixels)
        .pages_per_request(cli.pages_per_request)
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .api_timeout_secs(cli.api_timeout)
        .download_timeout_secs(cli.download_timeout)
        .max_download_bytes(cli.max_download_mb.saturating_mul(1024 * 1024))
        .min_year(cli.min_year)
        .max_year_ahead(cli.max_year_ahead)
        .max_attempts(cli.max_attempts)
        .malformed_output_attempts(cli.malformed_attempts)
        .retry_backoff_ms(cli.retry_base_ms, cli.retry_max_ms)
        .max_concurrent_jobs(cli.concurrency)
        .join_poll_interval_ms(cli.join_poll_ms)
        .claim_lease_ms(cli.claim_lease_ms);

    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref ua) = cli.user_agent {
        builder = builder.user_agent(ua);
    }
    if let Some(prompt) = prompt {
        builder = builder.extraction_prompt(prompt);
    }
    if let Some(ref dir) = cli.temp_dir {
        builder = builder.temp_dir(dir);
    }

    builder.build().context("Invalid configuration")
}
