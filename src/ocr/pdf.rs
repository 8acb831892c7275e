//! PDF handling: embedded text first, rasterize-and-OCR only when a scan
//! carries no text layer.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::ocr::{command_available, OcrEngine, OcrResult};

/// Confidence assigned to an embedded text layer; it is the author's own
/// text, not a recognition guess.
const EMBEDDED_TEXT_CONFIDENCE: f64 = 0.95;

pub struct PdfTextExtractor {
    pdftotext_cmd: String,
    pdftoppm_cmd: String,
}

impl PdfTextExtractor {
    pub fn new(config: &Config) -> Self {
        Self {
            pdftotext_cmd: config.pdftotext_cmd.clone(),
            pdftoppm_cmd: config.pdftoppm_cmd.clone(),
        }
    }

    /// Embedded text layer, layout-preserved. `None` when the tool is absent
    /// or every page comes back empty.
    async fn embedded_text(&self, pdf_bytes: &[u8]) -> Result<Option<String>> {
        if !command_available(&self.pdftotext_cmd) {
            return Ok(None);
        }

        let mut child = Command::new(&self.pdftotext_cmd)
            .args(["-layout", "-", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn pdftotext")?;

        let mut stdin = child.stdin.take().context("pdftotext stdin unavailable")?;
        stdin.write_all(pdf_bytes).await.context("failed to feed pdftotext")?;
        drop(stdin);

        let output = child.wait_with_output().await.context("pdftotext did not exit")?;
        if !output.status.success() {
            anyhow::bail!("pdftotext exited with {}", output.status);
        }

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(text))
    }

    /// Rasterize every page to PNG via pdftoppm.
    async fn rasterize(&self, pdf_bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        if !command_available(&self.pdftoppm_cmd) {
            anyhow::bail!("no rasterizer available for scanned PDF");
        }

        let dir = std::env::temp_dir().join(format!("pdf-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.context("failed to create raster dir")?;
        let prefix = dir.join("page");

        let result = async {
            let mut child = Command::new(&self.pdftoppm_cmd)
                .args(["-png", "-r", "200", "-"])
                .arg(&prefix)
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .context("failed to spawn pdftoppm")?;

            let mut stdin = child.stdin.take().context("pdftoppm stdin unavailable")?;
            stdin.write_all(pdf_bytes).await.context("failed to feed pdftoppm")?;
            drop(stdin);

            let status = child.wait().await.context("pdftoppm did not exit")?;
            if !status.success() {
                anyhow::bail!("pdftoppm exited with {status}");
            }

            let mut pages: Vec<(String, Vec<u8>)> = Vec::new();
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.ends_with(".png") {
                    pages.push((name, tokio::fs::read(entry.path()).await?));
                }
            }
            pages.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(pages.into_iter().map(|(_, bytes)| bytes).collect())
        }
        .await;

        let _ = tokio::fs::remove_dir_all(&dir).await;
        result
    }

    /// Full PDF flow: embedded text, else rasterize each page and run the
    /// given image engine over it, concatenating page texts.
    pub async fn extract_with_engine(
        &self,
        pdf_bytes: &[u8],
        image_engine: Arc<dyn OcrEngine>,
    ) -> Result<OcrResult> {
        let started = Instant::now();

        if let Some(text) = self.embedded_text(pdf_bytes).await? {
            debug!(chars = text.len(), "PDF embedded text extracted");
            return Ok(OcrResult {
                text,
                confidence: EMBEDDED_TEXT_CONFIDENCE,
                fragments: Vec::new(),
                engine: "pdf_text".to_string(),
                processing_time_ms: started.elapsed().as_millis() as u64,
                metadata: json!({ "source": "embedded" }),
            });
        }

        info!("No embedded PDF text, rasterizing for OCR");
        let pages = self.rasterize(pdf_bytes).await?;
        if pages.is_empty() {
            anyhow::bail!("PDF produced no pages");
        }

        let mut texts = Vec::with_capacity(pages.len());
        let mut fragments = Vec::new();
        let mut conf_sum = 0.0;
        for page in &pages {
            let result = image_engine.extract(page).await?;
            conf_sum += result.confidence;
            texts.push(result.text);
            fragments.extend(result.fragments);
        }

        Ok(OcrResult {
            text: texts.join("\n\n"),
            confidence: conf_sum / pages.len() as f64,
            fragments,
            engine: image_engine.name().to_string(),
            processing_time_ms: started.elapsed().as_millis() as u64,
            metadata: json!({ "source": "rasterized", "pages": pages.len() }),
        })
    }
}

#[async_trait]
impl OcrEngine for PdfTextExtractor {
    fn name(&self) -> &'static str {
        "pdf_text"
    }

    /// Trait-level extract covers the embedded-text path only; the pipeline
    /// calls [`Self::extract_with_engine`] so scanned PDFs can borrow the
    /// selected image engine.
    async fn extract(&self, pdf_bytes: &[u8]) -> Result<OcrResult> {
        let started = Instant::now();
        match self.embedded_text(pdf_bytes).await? {
            Some(text) => Ok(OcrResult {
                text,
                confidence: EMBEDDED_TEXT_CONFIDENCE,
                fragments: Vec::new(),
                engine: "pdf_text".to_string(),
                processing_time_ms: started.elapsed().as_millis() as u64,
                metadata: json!({ "source": "embedded" }),
            }),
            None => anyhow::bail!("PDF carries no embedded text"),
        }
    }

    async fn health_check(&self) -> bool {
        command_available(&self.pdftotext_cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_tools_degrade_cleanly() {
        let mut config = Config::from_env();
        config.pdftotext_cmd = "no-such-pdftotext".into();
        config.pdftoppm_cmd = "no-such-pdftoppm".into();
        let extractor = PdfTextExtractor::new(&config);

        // Without pdftotext the embedded path reports "no text" rather than
        // erroring, and rasterization refuses with a clear message.
        assert!(extractor.embedded_text(b"%PDF-1.4").await.unwrap().is_none());
        assert!(extractor.rasterize(b"%PDF-1.4").await.is_err());
        assert!(!extractor.health_check().await);
    }
}
