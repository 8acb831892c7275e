//! Higher-accuracy local engine: a PaddleOCR CLI sidecar emitting JSON.
//! Slow but markedly better on dense packing-slip tables; needs real RAM.

use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use sysinfo::System;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::ocr::{command_available, OcrEngine, OcrFragment, OcrResult};

const MIN_AVAILABLE_RAM_BYTES: u64 = 3_500 * 1024 * 1024;

pub struct PaddleOcr {
    cmd: String,
}

/// One recognized region in the sidecar's JSON output.
#[derive(Debug, Deserialize)]
struct PaddleRegion {
    text: String,
    confidence: f64,
    /// Quadrilateral `[[x, y]; 4]`, clockwise from top-left.
    #[serde(rename = "box")]
    quad: Vec<[f64; 2]>,
}

impl PaddleOcr {
    /// Preconditions: binary present and enough free memory for the model.
    pub fn new(config: &Config) -> Option<Self> {
        if !command_available(&config.paddle_cmd) {
            debug!(cmd = %config.paddle_cmd, "paddle binary not found");
            return None;
        }
        let mut system = System::new();
        system.refresh_memory();
        if system.available_memory() < MIN_AVAILABLE_RAM_BYTES {
            warn!(
                available_mb = system.available_memory() / (1024 * 1024),
                "Insufficient RAM for paddle engine"
            );
            return None;
        }
        Some(Self { cmd: config.paddle_cmd.clone() })
    }
}

#[async_trait]
impl OcrEngine for PaddleOcr {
    fn name(&self) -> &'static str {
        "paddle"
    }

    async fn extract(&self, image_bytes: &[u8]) -> Result<OcrResult> {
        let started = Instant::now();

        // The sidecar wants a file path.
        let path = std::env::temp_dir().join(format!("{}.png", Uuid::new_v4()));
        tokio::fs::write(&path, image_bytes)
            .await
            .context("failed to stage image for paddle")?;

        let output = Command::new(&self.cmd)
            .args(["--output", "json", "--image"])
            .arg(&path)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await;
        let _ = tokio::fs::remove_file(&path).await;

        let output = output.context("failed to run paddle sidecar")?;
        if !output.status.success() {
            anyhow::bail!("paddle sidecar exited with {}", output.status);
        }

        let regions: Vec<PaddleRegion> = serde_json::from_slice(&output.stdout)
            .context("failed to parse paddle JSON output")?;
        let (text, fragments, confidence) = assemble(regions);

        Ok(OcrResult {
            text,
            confidence,
            fragments,
            engine: self.name().to_string(),
            processing_time_ms: started.elapsed().as_millis() as u64,
            metadata: json!({ "format": "json" }),
        })
    }

    async fn health_check(&self) -> bool {
        Command::new(&self.cmd)
            .arg("--help")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

/// Order regions top-to-bottom / left-to-right, group rows by vertical
/// overlap, and flatten the quads into axis-aligned boxes.
fn assemble(mut regions: Vec<PaddleRegion>) -> (String, Vec<OcrFragment>, f64) {
    regions.retain(|r| r.quad.len() == 4 && !r.text.trim().is_empty());
    if regions.is_empty() {
        return (String::new(), Vec::new(), 0.0);
    }

    // Row grouping first (15 px vertical tolerance), then left-to-right
    // inside each row; reading order survives out-of-order sidecar output.
    regions.sort_by(|a, b| {
        a.quad[0][1].partial_cmp(&b.quad[0][1]).unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut rows: Vec<Vec<PaddleRegion>> = Vec::new();
    for region in regions {
        match rows.last_mut() {
            Some(row) if (region.quad[0][1] - row[0].quad[0][1]).abs() <= 15.0 => {
                row.push(region)
            }
            _ => rows.push(vec![region]),
        }
    }
    for row in &mut rows {
        row.sort_by(|a, b| {
            a.quad[0][0].partial_cmp(&b.quad[0][0]).unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    let mut fragments = Vec::new();
    let mut lines: Vec<String> = Vec::new();
    let mut conf_sum = 0.0;

    for row in &rows {
        let mut words: Vec<String> = Vec::with_capacity(row.len());
        for region in row {
            let xs = region.quad.iter().map(|p| p[0]);
            let ys = region.quad.iter().map(|p| p[1]);
            let x1 = xs.clone().fold(f64::INFINITY, f64::min);
            let y1 = ys.clone().fold(f64::INFINITY, f64::min);
            let x2 = xs.fold(f64::NEG_INFINITY, f64::max);
            let y2 = ys.fold(f64::NEG_INFINITY, f64::max);

            words.push(region.text.trim().to_string());
            fragments.push(OcrFragment {
                text: region.text.trim().to_string(),
                confidence: region.confidence,
                bbox: (x1, y1, x2, y2),
            });
            conf_sum += region.confidence;
        }
        lines.push(words.join(" "));
    }

    let confidence = conf_sum / fragments.len() as f64;
    (lines.join("\n"), fragments, confidence)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(text: &str, confidence: f64, x: f64, y: f64) -> PaddleRegion {
        PaddleRegion {
            text: text.into(),
            confidence,
            quad: vec![[x, y], [x + 40.0, y], [x + 40.0, y + 18.0], [x, y + 18.0]],
        }
    }

    #[test]
    fn test_regions_grouped_into_rows() {
        let (text, fragments, confidence) = assemble(vec![
            region("ea", 0.95, 100.0, 50.0),
            region("12", 0.99, 40.0, 51.0),
            region("Filter", 0.90, 160.0, 49.0),
            region("4", 0.80, 40.0, 95.0),
        ]);
        assert_eq!(text, "12 ea Filter\n4");
        assert_eq!(fragments.len(), 4);
        assert!((confidence - 0.91).abs() < 0.001);
    }

    #[test]
    fn test_empty_regions() {
        let (text, fragments, confidence) = assemble(vec![]);
        assert!(text.is_empty() && fragments.is_empty());
        assert_eq!(confidence, 0.0);
    }
}
