//! LLM normalization: a vendor client behind a small trait, retry with
//! exponential backoff, and strict validation of whatever comes back.
//! Every accepted line passes the same normalization as the regex parser.

use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{ErrorCode, PipelineError};
use crate::extraction::cost::SessionCostTracker;
use crate::extraction::rows::{clean_description, normalize_unit};
use crate::models::{ExtractedLine, LineConfidence, Provenance};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_SECS: u64 = 2;
const BACKOFF_MAX_SECS: u64 = 10;

/// Truncation bounds: keep head and tail when text exceeds ~2000 tokens.
const MAX_OCR_CHARS: usize = 8000;
const HEAD_CHARS: usize = 6000;
const TAIL_CHARS: usize = 2000;

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

#[derive(Debug, Clone)]
pub struct LlmCompletion {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Client failure classes; only the first two are worth retrying.
#[derive(Debug)]
pub enum LlmError {
    RateLimited,
    Transient(String),
    Fatal(String),
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmError::RateLimited => write!(f, "rate limited"),
            LlmError::Transient(msg) => write!(f, "transient error: {msg}"),
            LlmError::Fatal(msg) => write!(f, "fatal error: {msg}"),
        }
    }
}

impl std::error::Error for LlmError {}

/// LLM vendor capability set.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmCompletion, LlmError>;
}

/// OpenAI-compatible chat-completions client.
pub struct OpenAiClient {
    client: reqwest::Client,
    base: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(config: &Config) -> Option<Self> {
        let api_key = config.llm_api_key.clone()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.llm_timeout_seconds))
            .build()
            .ok()?;
        Some(Self { client, base: config.llm_api_base.clone(), api_key })
    }
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: ChatUsage,
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmCompletion, LlmError> {
        let payload = json!({
            "model": request.model,
            "messages": [{ "role": "user", "content": request.prompt }],
            "response_format": { "type": "json_object" },
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::Transient(e.to_string()))?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => return Err(LlmError::RateLimited),
            status if status.is_server_error() => {
                return Err(LlmError::Transient(format!("server error {status}")));
            }
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(LlmError::Fatal(format!("{status}: {body}")));
            }
            _ => {}
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Fatal(format!("malformed response: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::Fatal("empty choices".to_string()))?;

        Ok(LlmCompletion {
            content,
            input_tokens: parsed.usage.prompt_tokens,
            output_tokens: parsed.usage.completion_tokens,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NormalizationResult {
    pub lines: Vec<ExtractedLine>,
    pub extraction_notes: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: f64,
    /// Aggregate confidence of the returned lines in [0, 1].
    pub confidence: f64,
}

pub struct LlmNormalizer<'a> {
    config: &'a Config,
    client: &'a dyn LlmClient,
}

impl<'a> LlmNormalizer<'a> {
    pub fn new(config: &'a Config, client: &'a dyn LlmClient) -> Self {
        Self { config, client }
    }

    /// Run one normalization call. Retries up to three times with
    /// exponential backoff on rate limits and transient errors; the actual
    /// spend is recorded into the tracker.
    pub async fn normalize(
        &self,
        tracker: &mut SessionCostTracker,
        ocr_text: &str,
        model: &str,
        max_tokens: u32,
        temperature: f64,
    ) -> Result<NormalizationResult, PipelineError> {
        let cleaned = clean_ocr_text(ocr_text);
        let request = LlmRequest {
            model: model.to_string(),
            prompt: build_prompt(&cleaned, model, &self.config.llm_normalization_model),
            max_tokens,
            temperature,
        };

        let completion = self.complete_with_retry(&request).await?;
        let cost = self.config.llm_cost(model, completion.input_tokens, completion.output_tokens);
        tracker.record_llm_call(
            self.config,
            model,
            completion.input_tokens,
            completion.output_tokens,
            cost,
        );

        let parsed: serde_json::Value = serde_json::from_str(&completion.content)
            .map_err(|e| {
                error!(model, error = %e, "LLM returned unparseable JSON");
                PipelineError::new(
                    ErrorCode::NormalizationFailed,
                    format!("LLM response was not valid JSON: {e}"),
                )
            })?;

        let mut lines = Vec::new();
        if let Some(raw_lines) = parsed.get("lines").and_then(|v| v.as_array()) {
            for raw in raw_lines {
                if let Some(line) = normalize_llm_line(raw, lines.len() as u32 + 1) {
                    lines.push(line);
                }
            }
        }

        let confidence = aggregate_confidence(&lines);
        info!(
            model,
            lines_extracted = lines.len(),
            input_tokens = completion.input_tokens,
            output_tokens = completion.output_tokens,
            cost,
            "LLM normalization complete"
        );

        Ok(NormalizationResult {
            lines,
            extraction_notes: parsed
                .get("extraction_notes")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            model: model.to_string(),
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
            cost,
            confidence,
        })
    }

    async fn complete_with_retry(
        &self,
        request: &LlmRequest,
    ) -> Result<LlmCompletion, PipelineError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.client.complete(request).await {
                Ok(completion) => return Ok(completion),
                Err(LlmError::Fatal(msg)) => {
                    return Err(PipelineError::new(
                        ErrorCode::NormalizationFailed,
                        format!("LLM call failed: {msg}"),
                    ));
                }
                Err(retryable) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(PipelineError::new(
                            ErrorCode::NormalizationFailed,
                            format!("LLM call failed after {MAX_ATTEMPTS} attempts: {retryable}"),
                        ));
                    }
                    let backoff = Duration::from_secs(
                        (BACKOFF_BASE_SECS << (attempt - 1)).min(BACKOFF_MAX_SECS),
                    );
                    warn!(
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        error = %retryable,
                        "LLM call retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

lazy_static! {
    static ref NON_PRINTABLE: Regex = Regex::new(r"[^\x20-\x7E\n]").unwrap();
    static ref SPACE_RUNS: Regex = Regex::new(r"[ \t]+").unwrap();
}

/// Runs of five or more identical characters are OCR smear; keep three.
fn squeeze_char_runs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        let mut run = 1usize;
        while chars.peek() == Some(&c) {
            chars.next();
            run += 1;
        }
        for _ in 0..if run >= 5 { 3 } else { run } {
            out.push(c);
        }
    }
    out
}

/// Strip OCR noise and truncate head+tail so the prompt stays inside the
/// token budget. Line structure survives.
pub fn clean_ocr_text(text: &str) -> String {
    let text = NON_PRINTABLE.replace_all(text, "");
    let text = SPACE_RUNS.replace_all(&text, " ");
    let text = squeeze_char_runs(&text);
    let text = text.trim();

    if text.len() <= MAX_OCR_CHARS {
        return text.to_string();
    }
    warn!(original_length = text.len(), truncated_length = MAX_OCR_CHARS, "OCR text truncated");
    let head = &text[..floor_char_boundary(text, HEAD_CHARS)];
    let tail = &text[ceil_char_boundary(text, text.len() - TAIL_CHARS)..];
    format!("{head}\n\n[...TRUNCATED...]\n\n{tail}")
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

fn build_prompt(ocr_text: &str, model: &str, mini_model: &str) -> String {
    if model == mini_model {
        format!(
            "Extract line items from this packing slip OCR text.\n\n\
             Required fields: quantity, unit, description\n\
             Optional: part_number\n\n\
             Return JSON: {{\"lines\": [...], \"extraction_notes\": \"...\"}}\n\n\
             OCR Text:\n{ocr_text}"
        )
    } else {
        format!(
            "You are an expert at extracting data from damaged or poorly scanned documents.\n\n\
             OCR Text (may contain errors):\n{ocr_text}\n\n\
             Task: Extract line items. Be aggressive - infer reasonable values when unclear.\n\n\
             Guidelines:\n\
             1. If quantity is \"?\" or unclear, estimate from context\n\
             2. If unit missing, infer from description\n\
             3. Combine split lines if obvious (OCR sometimes breaks items across lines)\n\
             4. Flag uncertain extractions with \"confidence\": \"low\"\n\n\
             Return JSON:\n\
             {{\"lines\": [{{\"quantity\": float, \"unit\": str, \"description\": str, \
             \"part_number\": str|null, \"confidence\": \"high|medium|low\"}}], \
             \"extraction_notes\": \"Issues encountered\"}}"
        )
    }
}

/// Validate and normalize one LLM-emitted line exactly the way the regex
/// parser does; invalid lines are dropped, not repaired.
fn normalize_llm_line(raw: &serde_json::Value, line_number: u32) -> Option<ExtractedLine> {
    let quantity = match raw.get("quantity") {
        Some(v) if v.is_number() => v.as_f64()?,
        Some(v) => v.as_str()?.trim().parse().ok()?,
        None => return None,
    };
    if quantity <= 0.0 {
        return None;
    }

    let description = clean_description(raw.get("description")?.as_str()?);
    if description.len() < 5 || description.len() > 500 {
        return None;
    }

    let unit = normalize_unit(raw.get("unit").and_then(|v| v.as_str()));
    let part_number = raw
        .get("part_number")
        .and_then(|v| v.as_str())
        .map(|p| p.trim().to_uppercase())
        .filter(|p| !p.is_empty());
    let confidence = raw
        .get("confidence")
        .and_then(|v| v.as_str())
        .map(LineConfidence::from_str)
        .unwrap_or(LineConfidence::Medium);

    Some(ExtractedLine {
        line_number,
        quantity,
        unit,
        description,
        part_number,
        confidence,
        provenance: Provenance::Llm,
        raw_text: raw.to_string(),
    })
}

fn aggregate_confidence(lines: &[ExtractedLine]) -> f64 {
    if lines.is_empty() {
        return 0.0;
    }
    let sum: f64 = lines
        .iter()
        .map(|l| match l.confidence {
            LineConfidence::High => 1.0,
            LineConfidence::Medium => 0.7,
            LineConfidence::Low => 0.4,
        })
        .sum();
    sum / lines.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use uuid::Uuid;

    struct ScriptedClient {
        responses: Mutex<Vec<Result<LlmCompletion, LlmError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<LlmCompletion, LlmError>>) -> Self {
            Self { responses: Mutex::new(responses), calls: Mutex::new(0) }
        }

        fn call_count(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete(&self, _request: &LlmRequest) -> Result<LlmCompletion, LlmError> {
            *self.calls.lock() += 1;
            self.responses.lock().remove(0)
        }
    }

    fn completion(content: &str) -> LlmCompletion {
        LlmCompletion { content: content.to_string(), input_tokens: 1500, output_tokens: 800 }
    }

    const GOOD_JSON: &str = r#"{
        "lines": [
            {"quantity": 12, "unit": "each", "description": "mtu oil filter", "part_number": "mtu-of-4568", "confidence": "high"},
            {"quantity": "3", "unit": "pieces", "description": "impeller kit"},
            {"quantity": 0, "unit": "ea", "description": "zero quantity dropped"},
            {"quantity": 2, "description": "abc"}
        ],
        "extraction_notes": "clean"
    }"#;

    #[tokio::test]
    async fn test_lines_validated_and_normalized() {
        let config = Config::from_env();
        let client = ScriptedClient::new(vec![Ok(completion(GOOD_JSON))]);
        let normalizer = LlmNormalizer::new(&config, &client);
        let mut tracker = SessionCostTracker::new(Uuid::new_v4());

        let result = normalizer
            .normalize(&mut tracker, "raw ocr", "gpt-4.1-mini", 2000, 0.1)
            .await
            .unwrap();

        // Zero-quantity and too-short-description lines are dropped.
        assert_eq!(result.lines.len(), 2);
        let first = &result.lines[0];
        assert_eq!(first.unit, "ea");
        assert_eq!(first.description, "Mtu Oil Filter");
        assert_eq!(first.part_number.as_deref(), Some("MTU-OF-4568"));
        assert_eq!(first.provenance, Provenance::Llm);
        let second = &result.lines[1];
        assert_eq!(second.quantity, 3.0);
        assert_eq!(second.unit, "pcs");
        assert_eq!(second.confidence, LineConfidence::Medium);

        assert_eq!(result.extraction_notes, "clean");
        assert_eq!(tracker.llm_calls, 1);
        assert!(tracker.total_cost > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retried() {
        let config = Config::from_env();
        let client = ScriptedClient::new(vec![
            Err(LlmError::RateLimited),
            Err(LlmError::Transient("gateway".into())),
            Ok(completion(r#"{"lines": [], "extraction_notes": ""}"#)),
        ]);
        let normalizer = LlmNormalizer::new(&config, &client);
        let mut tracker = SessionCostTracker::new(Uuid::new_v4());

        let result = normalizer
            .normalize(&mut tracker, "text", "gpt-4.1-mini", 2000, 0.1)
            .await
            .unwrap();
        assert_eq!(client.call_count(), 3);
        assert!(result.lines.is_empty());
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhaust_after_three_attempts() {
        let config = Config::from_env();
        let client = ScriptedClient::new(vec![
            Err(LlmError::RateLimited),
            Err(LlmError::RateLimited),
            Err(LlmError::RateLimited),
        ]);
        let normalizer = LlmNormalizer::new(&config, &client);
        let mut tracker = SessionCostTracker::new(Uuid::new_v4());

        let err = normalizer
            .normalize(&mut tracker, "text", "gpt-4.1-mini", 2000, 0.1)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NormalizationFailed);
        assert_eq!(client.call_count(), 3);
        // Failed calls never touch the tracker.
        assert_eq!(tracker.llm_calls, 0);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let config = Config::from_env();
        let client = ScriptedClient::new(vec![Err(LlmError::Fatal("bad key".into()))]);
        let normalizer = LlmNormalizer::new(&config, &client);
        let mut tracker = SessionCostTracker::new(Uuid::new_v4());

        let err = normalizer
            .normalize(&mut tracker, "text", "gpt-4.1-mini", 2000, 0.1)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NormalizationFailed);
        assert_eq!(client.call_count(), 1);
    }

    #[test]
    fn test_truncation_keeps_head_and_tail() {
        let text = "A".repeat(3000) + &"B".repeat(4000) + &"C".repeat(3000);
        let cleaned = clean_ocr_text(&text);
        // Repeated-character squeeze keeps this below the cap entirely.
        assert!(cleaned.len() <= MAX_OCR_CHARS);

        // Force truncation with non-repeating content.
        let long: String =
            (0..12000).map(|i| char::from(b'a' + (i % 23) as u8)).collect();
        let truncated = clean_ocr_text(&long);
        assert!(truncated.contains("[...TRUNCATED...]"));
        assert!(truncated.starts_with(&long[..100]));
        assert!(truncated.ends_with(&long[long.len() - 100..]));
    }

    #[test]
    fn test_clean_strips_noise() {
        assert_eq!(clean_ocr_text("a\tb\u{7f}c\nd"), "a bc\nd");
        assert_eq!(clean_ocr_text("xxxxxxxx"), "xxx");
    }

    #[test]
    fn test_aggregate_confidence_mapping() {
        assert_eq!(aggregate_confidence(&[]), 0.0);
    }
}
