//! Runtime configuration.
//!
//! Every knob is an environment variable with a sensible default so the
//! service boots with nothing but a database path. `.env` is honored via
//! dotenv in main.

use std::collections::HashMap;
use std::env;

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(var: &str, default: bool) -> bool {
    env::var(var)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

/// Per-model pricing: USD per input token and per output token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_token: f64,
    pub output_per_token: f64,
}

/// Application configuration, loaded once at startup and shared via `Arc`.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub blob_root: String,
    pub temp_root: String,
    pub port: u16,
    pub environment: String,

    // Intake
    pub max_file_size_mb: u64,
    pub max_uploads_per_hour: i64,
    pub upload_rate_limit_window_seconds: i64,
    pub min_image_width: u32,
    pub min_image_height: u32,
    pub dqs_threshold: f64,
    pub dqs_blur_weight: f64,
    pub dqs_glare_weight: f64,
    pub dqs_contrast_weight: f64,
    pub glare_pixel_threshold: u8,

    // OCR
    pub ocr_engine_priority: Vec<String>,
    pub ocr_engines_enabled: HashMap<String, bool>,
    pub tesseract_cmd: String,
    pub paddle_cmd: String,
    pub pdftotext_cmd: String,
    pub pdftoppm_cmd: String,
    pub heif_convert_cmd: String,
    pub cloud_ocr_endpoint: Option<String>,
    pub cloud_ocr_api_key: Option<String>,
    pub enable_cloud_ocr_fallback: bool,
    pub ocr_timeout_seconds: u64,

    // LLM / cost control
    pub llm_api_base: String,
    pub llm_api_key: Option<String>,
    pub llm_normalization_model: String,
    pub llm_escalation_model: String,
    pub enable_llm_escalation: bool,
    pub max_llm_calls_per_session: u32,
    pub max_cost_per_session: f64,
    pub llm_coverage_threshold: f64,
    pub llm_timeout_seconds: u64,
    pub model_pricing: HashMap<String, ModelPricing>,

    // Auth
    pub jwt_secret: String,

    // Housekeeping
    pub temp_max_age_hours: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let mut model_pricing = HashMap::new();
        // Defaults follow the per-token convention; override with
        // LLM_PRICE_<MODEL>_INPUT / _OUTPUT where model names are uppercased
        // with non-alphanumerics mapped to underscores.
        model_pricing.insert(
            "gpt-4.1-nano".to_string(),
            ModelPricing { input_per_token: 0.000_000_1, output_per_token: 0.000_000_2 },
        );
        model_pricing.insert(
            "gpt-4.1-mini".to_string(),
            ModelPricing { input_per_token: 0.000_015, output_per_token: 0.000_03 },
        );
        model_pricing.insert(
            "gpt-4.1".to_string(),
            ModelPricing { input_per_token: 0.000_075, output_per_token: 0.000_15 },
        );
        for (model, pricing) in model_pricing.iter_mut() {
            let key: String = model
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
                .collect();
            pricing.input_per_token =
                env_parse(&format!("LLM_PRICE_{key}_INPUT"), pricing.input_per_token);
            pricing.output_per_token =
                env_parse(&format!("LLM_PRICE_{key}_OUTPUT"), pricing.output_per_token);
        }

        let priority = env::var("OCR_ENGINE_PRIORITY")
            .unwrap_or_else(|_| "paddle,cloud,tesseract,pdf".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        let mut engines_enabled = HashMap::new();
        for name in ["tesseract", "paddle", "cloud", "pdf"] {
            engines_enabled.insert(
                name.to_string(),
                env_flag(&format!("OCR_ENABLE_{}", name.to_uppercase()), true),
            );
        }

        Self {
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "quartermaster.db".into()),
            blob_root: env::var("BLOB_ROOT").unwrap_or_else(|_| "blob_storage".into()),
            temp_root: env::var("TEMP_ROOT").unwrap_or_else(|_| "temp_uploads".into()),
            port: env_parse("PORT", 8001),
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".into()),

            max_file_size_mb: env_parse("MAX_FILE_SIZE_MB", 15),
            max_uploads_per_hour: env_parse("MAX_UPLOADS_PER_HOUR", 50),
            upload_rate_limit_window_seconds: env_parse("UPLOAD_RATE_LIMIT_WINDOW_SECONDS", 3600),
            min_image_width: env_parse("MIN_IMAGE_WIDTH", 800),
            min_image_height: env_parse("MIN_IMAGE_HEIGHT", 600),
            dqs_threshold: env_parse("DQS_THRESHOLD", 70.0),
            dqs_blur_weight: env_parse("DQS_BLUR_WEIGHT", 0.4),
            dqs_glare_weight: env_parse("DQS_GLARE_WEIGHT", 0.3),
            dqs_contrast_weight: env_parse("DQS_CONTRAST_WEIGHT", 0.3),
            glare_pixel_threshold: env_parse("GLARE_PIXEL_THRESHOLD", 250),

            ocr_engine_priority: priority,
            ocr_engines_enabled: engines_enabled,
            tesseract_cmd: env::var("TESSERACT_CMD").unwrap_or_else(|_| "tesseract".into()),
            paddle_cmd: env::var("PADDLE_CMD").unwrap_or_else(|_| "paddleocr".into()),
            pdftotext_cmd: env::var("PDFTOTEXT_CMD").unwrap_or_else(|_| "pdftotext".into()),
            pdftoppm_cmd: env::var("PDFTOPPM_CMD").unwrap_or_else(|_| "pdftoppm".into()),
            heif_convert_cmd: env::var("HEIF_CONVERT_CMD").unwrap_or_else(|_| "heif-convert".into()),
            cloud_ocr_endpoint: env::var("CLOUD_OCR_ENDPOINT").ok(),
            cloud_ocr_api_key: env::var("CLOUD_OCR_API_KEY").ok(),
            enable_cloud_ocr_fallback: env_flag("ENABLE_CLOUD_OCR_FALLBACK", true),
            ocr_timeout_seconds: env_parse("OCR_TIMEOUT_SECONDS", 60),

            llm_api_base: env::var("LLM_API_BASE")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            llm_api_key: env::var("LLM_API_KEY").ok(),
            llm_normalization_model: env::var("LLM_NORMALIZATION_MODEL")
                .unwrap_or_else(|_| "gpt-4.1-mini".into()),
            llm_escalation_model: env::var("LLM_ESCALATION_MODEL")
                .unwrap_or_else(|_| "gpt-4.1".into()),
            enable_llm_escalation: env_flag("ENABLE_LLM_ESCALATION", true),
            max_llm_calls_per_session: env_parse("MAX_LLM_CALLS_PER_SESSION", 3),
            max_cost_per_session: env_parse("MAX_COST_PER_SESSION", 0.50),
            llm_coverage_threshold: env_parse("LLM_COVERAGE_THRESHOLD", 0.8),
            llm_timeout_seconds: env_parse("LLM_TIMEOUT_SECONDS", 45),
            model_pricing,

            jwt_secret: env::var("JWT_SECRET").unwrap_or_else(|_| "dev-secret".into()),

            temp_max_age_hours: env_parse("TEMP_MAX_AGE_HOURS", 24),
        }
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    /// Cost of a call against the configured per-model price table.
    /// Unknown models are charged at the escalation model's rate so a
    /// misconfigured name can never make a call look free.
    pub fn llm_cost(&self, model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
        let pricing = self
            .model_pricing
            .get(model)
            .or_else(|| self.model_pricing.get(&self.llm_escalation_model))
            .copied()
            .unwrap_or(ModelPricing { input_per_token: 0.000_075, output_per_token: 0.000_15 });
        input_tokens as f64 * pricing.input_per_token
            + output_tokens as f64 * pricing.output_per_token
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
