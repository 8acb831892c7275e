//! Cloud OCR engine: a vision REST endpoint taking base64 image content.
//! Costs money per page, so it only runs as the high-accuracy fallback or
//! when configured as the primary.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::Config;
use crate::ocr::{OcrEngine, OcrFragment, OcrResult};

/// Flat per-image price recorded into result metadata.
const COST_PER_IMAGE_USD: f64 = 0.0015;

pub struct CloudOcr {
    client: Client,
    endpoint: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct CloudWord {
    text: String,
    #[serde(default)]
    confidence: f64,
    /// `[x1, y1, x2, y2]`
    #[serde(default)]
    bbox: [f64; 4],
}

#[derive(Debug, Deserialize)]
struct CloudResponse {
    text: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    words: Vec<CloudWord>,
}

impl CloudOcr {
    /// Precondition: endpoint and credentials are configured.
    pub fn new(config: &Config) -> Option<Self> {
        let endpoint = config.cloud_ocr_endpoint.clone()?;
        let api_key = config.cloud_ocr_api_key.clone()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.ocr_timeout_seconds))
            .build()
            .ok()?;
        Some(Self { client, endpoint, api_key })
    }
}

#[async_trait]
impl OcrEngine for CloudOcr {
    fn name(&self) -> &'static str {
        "cloud"
    }

    async fn extract(&self, image_bytes: &[u8]) -> Result<OcrResult> {
        let started = Instant::now();
        let payload = json!({
            "image": { "content": base64::engine::general_purpose::STANDARD.encode(image_bytes) },
            "features": ["DOCUMENT_TEXT_DETECTION"],
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .context("cloud OCR request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("cloud OCR returned {status}: {body}");
        }

        let parsed: CloudResponse =
            response.json().await.context("failed to parse cloud OCR response")?;

        let fragments = parsed
            .words
            .into_iter()
            .map(|w| OcrFragment {
                text: w.text,
                confidence: w.confidence,
                bbox: (w.bbox[0], w.bbox[1], w.bbox[2], w.bbox[3]),
            })
            .collect::<Vec<_>>();

        debug!(chars = parsed.text.len(), words = fragments.len(), "Cloud OCR complete");

        Ok(OcrResult {
            text: parsed.text,
            confidence: parsed.confidence,
            fragments,
            engine: self.name().to_string(),
            processing_time_ms: started.elapsed().as_millis() as u64,
            metadata: json!({ "estimated_cost_usd": COST_PER_IMAGE_USD }),
        })
    }

    async fn health_check(&self) -> bool {
        // A HEAD probe against the endpoint; credentials are not spent on a
        // real extraction.
        self.client
            .head(&self.endpoint)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map(|r| !r.status().is_server_error())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_requires_credentials() {
        let mut config = Config::from_env();
        config.cloud_ocr_endpoint = None;
        config.cloud_ocr_api_key = None;
        assert!(CloudOcr::new(&config).is_none());

        config.cloud_ocr_endpoint = Some("https://ocr.example/v1/annotate".into());
        assert!(CloudOcr::new(&config).is_none());

        config.cloud_ocr_api_key = Some("key".into());
        assert!(CloudOcr::new(&config).is_some());
    }

    #[test]
    fn test_response_shape_parses() {
        let raw = r#"{
            "text": "12 ea MTU Oil Filter",
            "confidence": 0.97,
            "words": [
                {"text": "12", "confidence": 0.99, "bbox": [10.0, 20.0, 30.0, 40.0]}
            ]
        }"#;
        let parsed: CloudResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.words.len(), 1);
        assert!((parsed.confidence - 0.97).abs() < 1e-9);
    }
}
