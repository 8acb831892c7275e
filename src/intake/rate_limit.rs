//! Tenant-level upload rate limiting over the upload repository.
//!
//! The counter read is best-effort: a repository failure admits the request.
//! Hard guarantees live in the atomic inventory and commit steps, not here.

use chrono::{Duration, Utc};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::UploadRepository;
use crate::error::PipelineError;

pub struct UploadRateLimiter<'a> {
    config: &'a Config,
}

impl<'a> UploadRateLimiter<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn check(
        &self,
        uploads: &dyn UploadRepository,
        yacht_id: Uuid,
    ) -> Result<(), PipelineError> {
        let window_start =
            Utc::now() - Duration::seconds(self.config.upload_rate_limit_window_seconds);

        let count = match uploads.count_since(yacht_id, window_start) {
            Ok(count) => count,
            Err(e) => {
                // Availability over strict enforcement for the counter read.
                error!(yacht_id = %yacht_id, error = %e, "Rate limit check failed, admitting");
                return Ok(());
            }
        };

        if count >= self.config.max_uploads_per_hour {
            warn!(
                yacht_id = %yacht_id,
                upload_count = count,
                limit = self.config.max_uploads_per_hour,
                "🛑 Upload rate limit exceeded"
            );
            return Err(PipelineError::rate_limited(
                count,
                self.config.max_uploads_per_hour,
                self.config.upload_rate_limit_window_seconds,
            ));
        }

        debug!(yacht_id = %yacht_id, upload_count = count, "Rate limit check passed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, UploadRepository};
    use crate::error::ErrorCode;
    use crate::models::{ProcessingStatus, QualityMetadata, UploadKind, UploadRecord};
    use tempfile::NamedTempFile;

    fn upload(yacht_id: Uuid, sha: &str) -> UploadRecord {
        UploadRecord {
            id: Uuid::new_v4(),
            yacht_id,
            uploaded_by: Uuid::new_v4(),
            file_name: "f.png".into(),
            mime_type: "image/png".into(),
            file_size_bytes: 1,
            sha256: sha.into(),
            storage_path: "p".into(),
            upload_kind: UploadKind::Receiving,
            processing_status: ProcessingStatus::Queued,
            quality: QualityMetadata::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_limit_boundary() {
        let file = NamedTempFile::new().unwrap();
        let db = Database::new(file.path().to_str().unwrap()).unwrap();
        let config = Config::from_env();
        let limiter = UploadRateLimiter::new(&config);
        let yacht = Uuid::new_v4();

        // The Nth upload is admitted while the window holds N-1 records.
        for i in 0..config.max_uploads_per_hour {
            limiter.check(&db, yacht).unwrap();
            db.insert(&upload(yacht, &format!("sha{i}"))).unwrap();
        }

        // Window is full: the 51st is rejected with retry metadata.
        let err = limiter.check(&db, yacht).unwrap_err();
        assert_eq!(err.code, ErrorCode::RateLimitExceeded);
        let details = err.details.unwrap();
        assert_eq!(details["current_count"], config.max_uploads_per_hour);
        assert_eq!(details["retry_after_seconds"], config.upload_rate_limit_window_seconds);

        // Other tenants are unaffected.
        limiter.check(&db, Uuid::new_v4()).unwrap();
    }
}
