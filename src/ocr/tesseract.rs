//! Fast lossy local engine: tesseract driven over stdin/stdout in TSV mode.
//! Baseline accuracy, cheap, always worth trying first when nothing better
//! is installed.

use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::Config;
use crate::ocr::{command_available, OcrEngine, OcrFragment, OcrResult};

pub struct TesseractOcr {
    cmd: String,
}

impl TesseractOcr {
    /// Precondition: the tesseract binary is present.
    pub fn new(config: &Config) -> Option<Self> {
        if !command_available(&config.tesseract_cmd) {
            debug!(cmd = %config.tesseract_cmd, "tesseract binary not found");
            return None;
        }
        Some(Self { cmd: config.tesseract_cmd.clone() })
    }
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    async fn extract(&self, image_bytes: &[u8]) -> Result<OcrResult> {
        let started = Instant::now();

        let mut child = Command::new(&self.cmd)
            .args(["stdin", "stdout", "tsv"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn tesseract")?;

        let mut stdin = child.stdin.take().context("tesseract stdin unavailable")?;
        stdin.write_all(image_bytes).await.context("failed to feed tesseract")?;
        drop(stdin);

        let output = child.wait_with_output().await.context("tesseract did not exit")?;
        if !output.status.success() {
            anyhow::bail!("tesseract exited with {}", output.status);
        }

        let tsv = String::from_utf8_lossy(&output.stdout);
        let (text, fragments, confidence) = parse_tsv(&tsv);

        Ok(OcrResult {
            text,
            confidence,
            fragments,
            engine: self.name().to_string(),
            processing_time_ms: started.elapsed().as_millis() as u64,
            metadata: json!({ "format": "tsv" }),
        })
    }

    async fn health_check(&self) -> bool {
        Command::new(&self.cmd)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

/// Parse tesseract TSV output: word-level rows carry coordinates and a
/// 0-100 confidence; -1 marks structural rows.
fn parse_tsv(tsv: &str) -> (String, Vec<OcrFragment>, f64) {
    let mut fragments = Vec::new();
    let mut lines: Vec<String> = Vec::new();
    let mut current_line_key = (0u32, 0u32, 0u32);
    let mut current_words: Vec<String> = Vec::new();
    let mut conf_sum = 0.0;
    let mut conf_count = 0.0;

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 {
            continue;
        }
        let level: u32 = cols[0].parse().unwrap_or(0);
        if level != 5 {
            continue;
        }
        let conf: f64 = cols[10].parse().unwrap_or(-1.0);
        let word = cols[11].trim();
        if conf < 0.0 || word.is_empty() {
            continue;
        }

        let key = (
            cols[2].parse().unwrap_or(0),
            cols[3].parse().unwrap_or(0),
            cols[4].parse().unwrap_or(0),
        );
        if key != current_line_key && !current_words.is_empty() {
            lines.push(current_words.join(" "));
            current_words.clear();
        }
        current_line_key = key;
        current_words.push(word.to_string());

        let left: f64 = cols[6].parse().unwrap_or(0.0);
        let top: f64 = cols[7].parse().unwrap_or(0.0);
        let width: f64 = cols[8].parse().unwrap_or(0.0);
        let height: f64 = cols[9].parse().unwrap_or(0.0);
        fragments.push(OcrFragment {
            text: word.to_string(),
            confidence: conf / 100.0,
            bbox: (left, top, left + width, top + height),
        });
        conf_sum += conf;
        conf_count += 1.0;
    }
    if !current_words.is_empty() {
        lines.push(current_words.join(" "));
    }

    let confidence = if conf_count > 0.0 { conf_sum / conf_count / 100.0 } else { 0.0 };
    (lines.join("\n"), fragments, confidence)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_TSV: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
        1\t1\t0\t0\t0\t0\t0\t0\t800\t600\t-1\t\n\
        5\t1\t1\t1\t1\t1\t50\t100\t30\t20\t96\t12\n\
        5\t1\t1\t1\t1\t2\t90\t100\t25\t20\t91\tea\n\
        5\t1\t1\t1\t1\t3\t130\t100\t80\t20\t88\tFilter\n\
        5\t1\t1\t1\t2\t1\t50\t130\t40\t20\t93\tMTU-OF\n";

    #[test]
    fn test_tsv_words_grouped_into_lines() {
        let (text, fragments, confidence) = parse_tsv(SAMPLE_TSV);
        assert_eq!(text, "12 ea Filter\nMTU-OF");
        assert_eq!(fragments.len(), 4);
        assert!((confidence - 0.92).abs() < 0.001);
        assert_eq!(fragments[0].bbox, (50.0, 100.0, 80.0, 120.0));
    }

    #[test]
    fn test_tsv_structural_rows_skipped() {
        let (text, fragments, confidence) = parse_tsv("header\n1\t1\t0\t0\t0\t0\t0\t0\t8\t6\t-1\t\n");
        assert!(text.is_empty());
        assert!(fragments.is_empty());
        assert_eq!(confidence, 0.0);
    }
}
