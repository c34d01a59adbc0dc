//! Parse stage: send the page images to the VLM and decode its answer.
//!
//! The model is treated as an untrusted parser. Its raw text becomes a
//! [`ParseOutcome`]: `Success` carries the decoded fields, `Failure` carries
//! the raw text plus the reason it could not be decoded. Only `Success` ever
//! reaches Validate.
//!
//! ## Batching
//!
//! Long documents do not fit one request, so pages go out in batches of
//! `pages_per_request`. The first batch uses the full extraction instruction
//! (metadata plus chunks); later batches use a continuation instruction that
//! asks for chunks only. Chunks are appended in batch order, and a malformed
//! answer to any batch fails the whole attempt.
//!
//! ## Decoding rules
//!
//! - ```` ```json ```` fences are stripped.
//! - The answer must be one JSON object.
//! - A field with the wrong JSON type is a decode failure ([`ErrorKind::Malformed`]).
//! - A missing or `null` field decodes fine and is left for Validate to reject.
//! - `ministry` is accepted for `issuing_authority`; `title`/`content` for a
//!   chunk's `heading`/`text`.
//!
//! [`ErrorKind::Malformed`]: crate::error::ErrorKind::Malformed

use crate::config::IngestConfig;
use crate::error::{IngestError, StageError};
use crate::pipeline::{encode, suspend};
use crate::prompts::{continuation_prompt, EXTRACTION_PROMPT};
use crate::temp::TempScope;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default model when a provider is named without one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-mini";

/// Longest slice of a bad answer kept on the job record.
const EXCERPT_CHARS: usize = 400;

/// One multimodal request: an instruction plus ordered page images.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Return the model's raw text answer.
    async fn extract(&self, instruction: &str, images: Vec<ImageData>)
        -> Result<String, StageError>;
}

/// [`VisionModel`] over an `edgequake-llm` provider.
pub struct LlmVisionModel {
    provider: Arc<dyn LLMProvider>,
    temperature: f32,
    max_tokens: usize,
    timeout: Duration,
}

impl LlmVisionModel {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &IngestConfig) -> Self {
        Self {
            provider,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.api_timeout_secs),
        }
    }

    pub async fn from_config(config: &IngestConfig) -> Result<Self, IngestError> {
        let provider = resolve_provider(config).await?;
        info!(
            provider = config.provider_name.as_deref().unwrap_or("auto"),
            model = config.model.as_deref().unwrap_or("default"),
            "Vision model ready"
        );
        Ok(Self::new(provider, config))
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl VisionModel for LlmVisionModel {
    async fn extract(
        &self,
        instruction: &str,
        images: Vec<ImageData>,
    ) -> Result<String, StageError> {
        // Instruction in the system turn, pages in an image-only user turn.
        let messages = vec![
            ChatMessage::system(instruction),
            ChatMessage::user_with_images("", images),
        ];
        let options = self.options();
        let start = Instant::now();

        let response =
            match tokio::time::timeout(self.timeout, self.provider.chat(&messages, Some(&options)))
                .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return Err(classify_llm_error(&e.to_string(), self.timeout)),
                Err(_) => {
                    return Err(StageError::ModelTimeout {
                        secs: self.timeout.as_secs(),
                    })
                }
            };

        debug!(
            "VLM answered: {} input tokens, {} output tokens, {:?}",
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );
        Ok(response.content)
    }
}

/// Map a provider error message onto the retry taxonomy.
///
/// `edgequake-llm` surfaces HTTP failures as text, so this matches on the
/// status codes and phrases providers actually return.
fn classify_llm_error(message: &str, timeout: Duration) -> StageError {
    let lower = message.to_lowercase();
    let detail = message.to_string();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("rate_limit") {
        StageError::RateLimited { detail }
    } else if lower.contains("timed out") || lower.contains("timeout") {
        StageError::ModelTimeout {
            secs: timeout.as_secs(),
        }
    } else if lower.contains("401")
        || lower.contains("403")
        || lower.contains("unauthorized")
        || lower.contains("invalid api key")
        || lower.contains("authentication")
    {
        StageError::ModelRejected { detail }
    } else {
        StageError::ModelUnavailable { detail }
    }
}

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, IngestError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        IngestError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the vision provider, from most-specific to least-specific:
///
/// 1. a pre-built `config.provider`;
/// 2. `config.provider_name` (+ `config.model`, default [`DEFAULT_MODEL`]);
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, when both are set;
/// 4. OpenAI when `OPENAI_API_KEY` is present;
/// 5. `ProviderFactory::from_env` auto-detection.
pub async fn resolve_provider(config: &IngestConfig) -> Result<Arc<dyn LLMProvider>, IngestError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_vision_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| IngestError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No vision provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

// ── Decoding ────────────────────────────────────────────────────────────────

/// The model's answer, decoded but not yet validated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawExtraction {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub year: Option<i64>,
    #[serde(default, alias = "ministry")]
    pub issuing_authority: Option<String>,
    #[serde(default)]
    pub chunks: Option<Vec<RawChunk>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawChunk {
    #[serde(default, alias = "title")]
    pub heading: Option<String>,
    #[serde(default, alias = "content")]
    pub text: Option<String>,
}

impl RawExtraction {
    /// Append the chunks of a continuation batch; its metadata is ignored.
    fn absorb(&mut self, next: RawExtraction) {
        if let Some(theirs) = next.chunks {
            self.chunks.get_or_insert_with(Vec::new).extend(theirs);
        }
    }
}

/// Decoded model answer or the reason it could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Success(RawExtraction),
    Failure { raw: String, reason: String },
}

static RE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[A-Za-z]*[ \t]*\r?\n?(.*?)\r?\n?[ \t]*```$").unwrap()
});

/// Strip a surrounding ```` ``` ```` / ```` ```json ```` fence, if any.
pub fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    match RE_FENCE.captures(trimmed).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => trimmed,
    }
}

/// Decode one raw answer.
pub fn parse_response(raw: &str) -> ParseOutcome {
    let body = strip_fences(raw);
    if body.is_empty() {
        return ParseOutcome::Failure {
            raw: raw.to_string(),
            reason: "empty response".to_string(),
        };
    }
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) if !value.is_object() => ParseOutcome::Failure {
            raw: raw.to_string(),
            reason: format!("expected a JSON object, got {}", json_type(&value)),
        },
        Ok(value) => match serde_json::from_value::<RawExtraction>(value) {
            Ok(extraction) => ParseOutcome::Success(extraction),
            Err(e) => ParseOutcome::Failure {
                raw: raw.to_string(),
                reason: e.to_string(),
            },
        },
        Err(e) => ParseOutcome::Failure {
            raw: raw.to_string(),
            reason: format!("invalid JSON: {e}"),
        },
    }
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

fn excerpt(raw: &str) -> String {
    let mut out: String = raw.chars().take(EXCERPT_CHARS).collect();
    if raw.chars().count() > EXCERPT_CHARS {
        out.push('…');
    }
    out
}

/// Run the Parse stage over the rendered pages.
pub async fn parse(
    pages: &[PathBuf],
    scope: &TempScope,
    model: &dyn VisionModel,
    config: &IngestConfig,
    cancel: &CancellationToken,
) -> Result<RawExtraction, StageError> {
    if pages.is_empty() {
        return Err(StageError::EmptyDocument);
    }
    let per_request = config.pages_per_request.max(1);
    let requests = pages.len().div_ceil(per_request);
    let mut merged: Option<RawExtraction> = None;

    for (i, batch) in pages.chunks(per_request).enumerate() {
        let first_page = i * per_request + 1;
        let last_page = first_page + batch.len() - 1;
        let instruction = if i == 0 {
            config
                .extraction_prompt
                .clone()
                .unwrap_or_else(|| EXTRACTION_PROMPT.to_string())
        } else {
            continuation_prompt(first_page, last_page)
        };

        let mut images = Vec::with_capacity(batch.len());
        for path in batch {
            images.push(encode::image_data(&scope.read(path).await?));
        }

        debug!(
            request = i + 1,
            requests, first_page, last_page, "Sending pages to VLM"
        );
        let raw = suspend(cancel, model.extract(&instruction, images)).await?;

        match parse_response(&raw) {
            ParseOutcome::Success(extraction) => match merged.as_mut() {
                None => merged = Some(extraction),
                Some(acc) => acc.absorb(extraction),
            },
            ParseOutcome::Failure { raw, reason } => {
                return Err(StageError::MalformedOutput {
                    reason: format!("pages {first_page}-{last_page}: {reason}"),
                    excerpt: excerpt(&raw),
                });
            }
        }
    }

    merged.ok_or(StageError::EmptyDocument)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp::DiskTempStorage;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_fences("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn decodes_full_answer() {
        let raw = r#"{"title":"Decree 12","year":2023,"issuing_authority":"Ministry of Justice",
            "chunks":[{"heading":"Article 1","text":"Body"}]}"#;
        let ParseOutcome::Success(x) = parse_response(raw) else {
            panic!("expected success");
        };
        assert_eq!(x.title.as_deref(), Some("Decree 12"));
        assert_eq!(x.year, Some(2023));
        assert_eq!(x.chunks.unwrap().len(), 1);
    }

    #[test]
    fn accepts_legacy_field_names() {
        let raw = r#"```json
{"title":"T","year":2020,"ministry":"M","chunks":[{"chunk_id":1,"title":"H","content":"C"}]}
```"#;
        let ParseOutcome::Success(x) = parse_response(raw) else {
            panic!("expected success");
        };
        assert_eq!(x.issuing_authority.as_deref(), Some("M"));
        let chunk = &x.chunks.unwrap()[0];
        assert_eq!(chunk.heading.as_deref(), Some("H"));
        assert_eq!(chunk.text.as_deref(), Some("C"));
    }

    #[test]
    fn missing_fields_decode_for_validate_to_judge() {
        let ParseOutcome::Success(x) = parse_response(r#"{"year":2020}"#) else {
            panic!("expected success");
        };
        assert_eq!(x.title, None);
        assert_eq!(x.chunks, None);
    }

    #[test]
    fn wrong_shapes_are_failures() {
        for raw in [
            "Sorry, I cannot read this document.",
            "[1,2,3]",
            r#"{"title":"T","year":"two thousand"}"#,
            r#"{"title":42}"#,
            "",
        ] {
            assert!(
                matches!(parse_response(raw), ParseOutcome::Failure { .. }),
                "{raw:?} should fail"
            );
        }
    }

    #[test]
    fn classifies_provider_errors() {
        let t = Duration::from_secs(120);
        assert!(matches!(
            classify_llm_error("HTTP 429 Too Many Requests", t),
            StageError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_llm_error("request timed out", t),
            StageError::ModelTimeout { secs: 120 }
        ));
        assert!(matches!(
            classify_llm_error("401 Unauthorized: invalid api key", t),
            StageError::ModelRejected { .. }
        ));
        assert!(matches!(
            classify_llm_error("502 Bad Gateway", t),
            StageError::ModelUnavailable { .. }
        ));
    }

    /// Records every instruction and image count, answers from a script.
    struct Scripted {
        answers: Mutex<Vec<String>>,
        calls: Mutex<Vec<(String, usize)>>,
    }

    impl Scripted {
        fn new(answers: &[&str]) -> Self {
            Self {
                answers: Mutex::new(answers.iter().rev().map(|s| s.to_string()).collect()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl VisionModel for Scripted {
        async fn extract(
            &self,
            instruction: &str,
            images: Vec<ImageData>,
        ) -> Result<String, StageError> {
            self.calls
                .lock()
                .unwrap()
                .push((instruction.to_string(), images.len()));
            Ok(self.answers.lock().unwrap().pop().unwrap_or_default())
        }
    }

    async fn pages(scope: &TempScope, n: usize) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for i in 0..n {
            out.push(scope.write(format!("page{i}").as_bytes(), "png").await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn batches_pages_and_merges_chunks() {
        let scope = TempScope::new(Arc::new(DiskTempStorage::new().unwrap()), Uuid::new_v4());
        let pages = pages(&scope, 5).await;
        let model = Scripted::new(&[
            r#"{"title":"T","year":2021,"issuing_authority":"A","chunks":[{"heading":"1","text":"a"}]}"#,
            r#"{"chunks":[{"heading":"2","text":"b"}]}"#,
            r#"{"title":"ignored","chunks":[{"heading":"3","text":"c"}]}"#,
        ]);
        let config = IngestConfig::builder().pages_per_request(2).build().unwrap();

        let x = parse(&pages, &scope, &model, &config, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(x.title.as_deref(), Some("T"));
        let texts: Vec<_> = x
            .chunks
            .unwrap()
            .into_iter()
            .map(|c| c.text.unwrap())
            .collect();
        assert_eq!(texts, ["a", "b", "c"]);

        let calls = model.calls.lock().unwrap();
        assert_eq!(
            calls.iter().map(|(_, n)| *n).collect::<Vec<_>>(),
            [2, 2, 1]
        );
        assert_eq!(calls[0].0, EXTRACTION_PROMPT);
        assert!(calls[1].0.contains("pages 3 to 4"));
        assert!(calls[2].0.contains("pages 5 to 5"));
        drop(calls);
        scope.release().await;
    }

    #[tokio::test]
    async fn malformed_batch_fails_the_attempt() {
        let scope = TempScope::new(Arc::new(DiskTempStorage::new().unwrap()), Uuid::new_v4());
        let pages = pages(&scope, 1).await;
        let model = Scripted::new(&["not json at all"]);
        let err = parse(
            &pages,
            &scope,
            &model,
            &IngestConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        match err {
            StageError::MalformedOutput { excerpt, .. } => assert_eq!(excerpt, "not json at all"),
            other => panic!("expected malformed output, got {other:?}"),
        }
        scope.release().await;
    }
}
