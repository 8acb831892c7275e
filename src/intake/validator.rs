//! File validation: size, MIME allow-list, dimensions, and the Document
//! Quality Score gate.

use image::{GenericImageView, GrayImage};
use serde_json::json;
use tracing::warn;

use crate::config::Config;
use crate::error::{ErrorCode, PipelineError};
use crate::models::{QualityMetadata, UploadKind};

/// Document Quality Score breakdown. Component scores are 0-100.
#[derive(Debug, Clone)]
pub struct DqsResult {
    pub total: f64,
    pub acceptable: bool,
    pub blur: f64,
    pub glare: f64,
    pub contrast: f64,
    pub feedback: String,
}

/// Result of a successful validation, fed into the upload record.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub mime_type: String,
    pub file_size_bytes: u64,
    pub is_image: bool,
    pub quality: QualityMetadata,
}

pub struct FileValidator<'a> {
    config: &'a Config,
    kind: UploadKind,
}

impl<'a> FileValidator<'a> {
    pub fn new(config: &'a Config, kind: UploadKind) -> Self {
        Self { config, kind }
    }

    /// Validate a file payload. Image kinds additionally pass the dimension
    /// and DQS gates; PDFs get size and MIME checks only.
    pub fn validate(&self, mime_type: &str, bytes: &[u8]) -> Result<ValidationOutcome, PipelineError> {
        self.check_size(bytes.len() as u64)?;
        self.check_mime(mime_type)?;

        if mime_type.starts_with("image/") {
            return self.validate_image(mime_type, bytes);
        }

        Ok(ValidationOutcome {
            mime_type: mime_type.to_string(),
            file_size_bytes: bytes.len() as u64,
            is_image: false,
            quality: QualityMetadata::default(),
        })
    }

    fn check_size(&self, size_bytes: u64) -> Result<(), PipelineError> {
        let max = self.config.max_file_size_bytes();
        if size_bytes > max {
            let size_mb = size_bytes as f64 / (1024.0 * 1024.0);
            return Err(PipelineError::with_details(
                ErrorCode::FileTooLarge,
                format!(
                    "File size {size_mb:.2}MB exceeds maximum {}MB",
                    self.config.max_file_size_mb
                ),
                json!({ "size_bytes": size_bytes, "max_bytes": max }),
            ));
        }
        Ok(())
    }

    fn check_mime(&self, mime_type: &str) -> Result<(), PipelineError> {
        let allowed = self.kind.allowed_mime_types();
        if !allowed.contains(&mime_type) {
            return Err(PipelineError::with_details(
                ErrorCode::InvalidFileType,
                format!("File type {mime_type} not allowed for {}", self.kind.as_str()),
                json!({ "mime_type": mime_type, "allowed_types": allowed }),
            ));
        }
        Ok(())
    }

    fn validate_image(
        &self,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<ValidationOutcome, PipelineError> {
        let decoded = match image::load_from_memory(bytes) {
            Ok(img) => img,
            // HEIC is accepted at the gate but decoded later by the
            // preprocessing sidecar; quality probing is skipped.
            Err(_) if mime_type == "image/heic" => {
                return Ok(ValidationOutcome {
                    mime_type: mime_type.to_string(),
                    file_size_bytes: bytes.len() as u64,
                    is_image: true,
                    quality: QualityMetadata::default(),
                });
            }
            Err(e) => {
                return Err(PipelineError::new(
                    ErrorCode::InvalidImage,
                    format!("Failed to decode image: {e}"),
                ));
            }
        };

        let (width, height) = (decoded.width(), decoded.height());
        if width < self.config.min_image_width || height < self.config.min_image_height {
            return Err(PipelineError::with_details(
                ErrorCode::ImageTooSmall,
                format!(
                    "Image {width}x{height} below minimum {}x{}",
                    self.config.min_image_width, self.config.min_image_height
                ),
                json!({ "width": width, "height": height }),
            ));
        }

        let gray = decoded.to_luma8();
        let dqs = compute_dqs(&gray, self.config);

        if !dqs.acceptable {
            warn!(
                dqs = dqs.total,
                blur = dqs.blur,
                glare = dqs.glare,
                contrast = dqs.contrast,
                width,
                height,
                "📷 Poor image quality detected"
            );
            return Err(PipelineError::with_details(
                ErrorCode::ImageQualityTooLow,
                format!("Image quality too low (DQS: {:.0}/100). {}", dqs.total, dqs.feedback),
                json!({
                    "dqs_score": dqs.total,
                    "threshold": self.config.dqs_threshold,
                    "details": { "blur": dqs.blur, "glare": dqs.glare, "contrast": dqs.contrast },
                    "feedback": dqs.feedback,
                }),
            ));
        }

        Ok(ValidationOutcome {
            mime_type: mime_type.to_string(),
            file_size_bytes: bytes.len() as u64,
            is_image: true,
            quality: QualityMetadata {
                width: Some(width),
                height: Some(height),
                blur: Some(dqs.blur),
                glare: Some(dqs.glare),
                contrast: Some(dqs.contrast),
                dqs: Some(dqs.total),
            },
        })
    }
}

/// Variance of the 4-neighbor Laplacian response: the blur proxy.
/// Higher variance means sharper edges.
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut n = 0.0f64;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = gray.get_pixel(x, y)[0] as f64;
            let response = gray.get_pixel(x, y - 1)[0] as f64
                + gray.get_pixel(x, y + 1)[0] as f64
                + gray.get_pixel(x - 1, y)[0] as f64
                + gray.get_pixel(x + 1, y)[0] as f64
                - 4.0 * center;
            sum += response;
            sum_sq += response * response;
            n += 1.0;
        }
    }
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

/// Percent of pixels brighter than the near-white threshold.
pub fn glare_percent(gray: &GrayImage, threshold: u8) -> f64 {
    let total = gray.pixels().len() as f64;
    if total == 0.0 {
        return 0.0;
    }
    let hot = gray.pixels().filter(|p| p[0] > threshold).count() as f64;
    hot / total * 100.0
}

/// Michelson contrast: `(Lmax - Lmin) / (Lmax + Lmin)`.
pub fn michelson_contrast(gray: &GrayImage) -> f64 {
    let mut min = u8::MAX;
    let mut max = u8::MIN;
    for p in gray.pixels() {
        min = min.min(p[0]);
        max = max.max(p[0]);
    }
    let (min, max) = (min as f64, max as f64);
    if max + min == 0.0 {
        return 0.0;
    }
    (max - min) / (max + min)
}

pub fn compute_dqs(gray: &GrayImage, config: &Config) -> DqsResult {
    score_components(
        laplacian_variance(gray),
        glare_percent(gray, config.glare_pixel_threshold),
        michelson_contrast(gray),
        config,
    )
}

/// Weighted DQS over normalized components, with the remediation hint keyed
/// to the weakest one.
pub fn score_components(
    laplacian_var: f64,
    glare_pct: f64,
    contrast_ratio: f64,
    config: &Config,
) -> DqsResult {
    let blur = (laplacian_var / 150.0 * 100.0).min(100.0);
    let glare = (100.0 - glare_pct * 10.0).max(0.0);
    let contrast = contrast_ratio * 100.0;

    let total = blur * config.dqs_blur_weight
        + glare * config.dqs_glare_weight
        + contrast * config.dqs_contrast_weight;

    DqsResult {
        total,
        acceptable: total >= config.dqs_threshold,
        blur,
        glare,
        contrast,
        feedback: feedback_for(blur, glare, contrast),
    }
}

fn feedback_for(blur: f64, glare: f64, contrast: f64) -> String {
    let components = [
        (blur, "Hold phone steady or move to better lighting"),
        (glare, "Turn off flash or tilt document away from overhead lights"),
        (contrast, "Ensure document is on a dark, flat surface"),
    ];
    let (score, message) = components
        .iter()
        .copied()
        .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
        .unwrap_or((100.0, ""));

    if score < 50.0 {
        format!("Image quality issue: {message}")
    } else if score < 70.0 {
        format!("Image quality could be better: {message}")
    } else {
        "Image quality is good".to_string()
    }
}
