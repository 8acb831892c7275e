//! OCR engine abstraction: pluggable engines behind one result contract,
//! priority-based selection, and the low-confidence cloud fallback.

pub mod cloud;
pub mod paddle;
pub mod pdf;
pub mod preprocess;
pub mod tesseract;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{ErrorCode, PipelineError};

/// Confidence below which the cloud fallback is consulted.
pub const FALLBACK_CONFIDENCE_THRESHOLD: f64 = 0.6;

/// One recognized fragment with its bounding box `(x1, y1, x2, y2)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrFragment {
    pub text: String,
    pub confidence: f64,
    pub bbox: (f64, f64, f64, f64),
}

impl OcrFragment {
    pub fn left(&self) -> f64 {
        self.bbox.0
    }

    pub fn top(&self) -> f64 {
        self.bbox.1
    }
}

/// Uniform OCR result contract across engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResult {
    pub text: String,
    /// Overall confidence in [0, 1].
    pub confidence: f64,
    pub fragments: Vec<OcrFragment>,
    pub engine: String,
    pub processing_time_ms: u64,
    /// Opaque engine metadata (estimated cost, fallback provenance).
    pub metadata: serde_json::Value,
}

/// Engine capability set.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &'static str;
    async fn extract(&self, image_bytes: &[u8]) -> Result<OcrResult>;
    async fn health_check(&self) -> bool;
}

/// True when `cmd` resolves to an executable (absolute path or on PATH).
pub(crate) fn command_available(cmd: &str) -> bool {
    if cmd.contains('/') {
        return std::path::Path::new(cmd).exists();
    }
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(cmd).is_file())
        })
        .unwrap_or(false)
}

fn build_engine(name: &str, config: &Config) -> Option<Arc<dyn OcrEngine>> {
    if !config.ocr_engines_enabled.get(name).copied().unwrap_or(false) {
        return None;
    }
    match name {
        "tesseract" => tesseract::TesseractOcr::new(config).map(|e| Arc::new(e) as _),
        "paddle" => paddle::PaddleOcr::new(config).map(|e| Arc::new(e) as _),
        "cloud" => cloud::CloudOcr::new(config).map(|e| Arc::new(e) as _),
        "pdf" => Some(Arc::new(pdf::PdfTextExtractor::new(config)) as _),
        other => {
            warn!(engine = other, "Unknown OCR engine in priority list");
            None
        }
    }
}

lazy_static! {
    // Process-wide memoized engine choice. Some engines are expensive to
    // probe, and callers must all share one instance.
    static ref SELECTED_ENGINE: Mutex<Option<Arc<dyn OcrEngine>>> = Mutex::new(None);
}

/// Highest-priority engine whose preconditions hold. Memoized for the
/// process lifetime; see [`reset_engine_selection`].
pub fn select_engine(config: &Config) -> Result<Arc<dyn OcrEngine>, PipelineError> {
    let mut selected = SELECTED_ENGINE.lock();
    if let Some(engine) = selected.as_ref() {
        return Ok(engine.clone());
    }

    for name in &config.ocr_engine_priority {
        if name == "pdf" {
            // The PDF extractor is not a general-purpose image engine.
            continue;
        }
        if let Some(engine) = build_engine(name, config) {
            info!(engine = engine.name(), "🔍 OCR engine selected");
            *selected = Some(engine.clone());
            return Ok(engine);
        }
    }

    Err(PipelineError::new(
        ErrorCode::OcrFailed,
        "No OCR engine available; enable at least one engine",
    ))
}

/// Drop the memoized engine so the next call re-runs selection. Tests switch
/// engines through this.
pub fn reset_engine_selection() {
    *SELECTED_ENGINE.lock() = None;
}

/// Name of the currently selected engine, if any (health endpoint).
pub fn selected_engine_name() -> Option<&'static str> {
    SELECTED_ENGINE.lock().as_ref().map(|e| e.name())
}

/// Run OCR over preprocessed image bytes with the fallback policy applied:
/// a low-confidence primary result triggers the cloud engine, and the better
/// of the two wins. A failed primary with a working fallback succeeds with
/// the primary error attached as metadata.
pub async fn run_with_fallback(
    config: &Config,
    engine: Arc<dyn OcrEngine>,
    image_bytes: &[u8],
) -> Result<OcrResult, PipelineError> {
    let timeout = Duration::from_secs(config.ocr_timeout_seconds);

    let primary = match tokio::time::timeout(timeout, engine.extract(image_bytes)).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("{} timed out", engine.name())),
    };

    let needs_fallback = match &primary {
        Ok(result) => result.confidence < FALLBACK_CONFIDENCE_THRESHOLD,
        Err(_) => true,
    };

    let fallback_engine = if needs_fallback
        && config.enable_cloud_ocr_fallback
        && engine.name() != "cloud"
    {
        cloud::CloudOcr::new(config)
    } else {
        None
    };

    if let Some(cloud) = fallback_engine {
        match tokio::time::timeout(timeout, cloud.extract(image_bytes)).await {
            Ok(Ok(mut fallback)) => {
                return Ok(match primary {
                    Ok(primary) if primary.confidence >= fallback.confidence => primary,
                    Ok(primary) => {
                        fallback.metadata["fallback_from"] = json!(primary.engine);
                        fallback.metadata["primary_confidence"] = json!(primary.confidence);
                        fallback
                    }
                    Err(primary_error) => {
                        warn!(error = %primary_error, "Primary OCR failed, cloud fallback succeeded");
                        fallback.metadata["primary_error"] = json!(primary_error);
                        fallback
                    }
                });
            }
            Ok(Err(e)) => warn!(error = %e, "Cloud OCR fallback failed"),
            Err(_) => warn!("Cloud OCR fallback timed out"),
        }
    }

    primary.map_err(|e| {
        PipelineError::new(ErrorCode::OcrFailed, format!("OCR extraction failed: {e}"))
    })
}
