//! Intake gate: decide fast whether a file enters the pipeline, and record
//! it exactly once.

pub mod dedup;
pub mod rate_limit;
pub mod sanitize;
pub mod storage;
pub mod validator;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::UploadRepository;
use crate::error::PipelineError;
use crate::models::{ProcessingStatus, UploadKind, UploadRecord};

use storage::BlobStore;

/// One inbound file payload.
pub struct IncomingFile {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Per-file admission result. Validation failures are terminal for the file
/// but not for its siblings.
#[derive(Debug, Clone, Serialize)]
pub struct FileAdmission {
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<Uuid>,
    pub is_duplicate: bool,
    pub processing_status: Option<ProcessingStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub message: String,
}

pub struct IntakeGate<'a> {
    config: &'a Config,
    uploads: &'a dyn UploadRepository,
    blobs: &'a dyn BlobStore,
}

impl<'a> IntakeGate<'a> {
    pub fn new(
        config: &'a Config,
        uploads: &'a dyn UploadRepository,
        blobs: &'a dyn BlobStore,
    ) -> Self {
        Self { config, uploads, blobs }
    }

    /// Admit a batch of files for one tenant. The rate limit gates the whole
    /// request; everything after is per-file with partial success.
    pub async fn admit(
        &self,
        yacht_id: Uuid,
        actor_id: Uuid,
        kind: UploadKind,
        files: Vec<IncomingFile>,
    ) -> Result<Vec<FileAdmission>, PipelineError> {
        rate_limit::UploadRateLimiter::new(self.config).check(self.uploads, yacht_id)?;

        let validator = validator::FileValidator::new(self.config, kind);
        let mut admissions = Vec::with_capacity(files.len());

        for file in files {
            match self.admit_one(&validator, yacht_id, actor_id, kind, &file).await {
                Ok(admission) => admissions.push(admission),
                Err(e) => {
                    warn!(file = %file.file_name, error = %e, "File rejected at intake");
                    admissions.push(FileAdmission {
                        file_name: file.file_name.clone(),
                        upload_id: None,
                        is_duplicate: false,
                        processing_status: Some(ProcessingStatus::Failed),
                        storage_path: None,
                        error_code: Some(e.code.as_str().to_string()),
                        message: e.message,
                    });
                }
            }
        }

        Ok(admissions)
    }

    async fn admit_one(
        &self,
        validator: &validator::FileValidator<'_>,
        yacht_id: Uuid,
        actor_id: Uuid,
        kind: UploadKind,
        file: &IncomingFile,
    ) -> Result<FileAdmission, PipelineError> {
        let outcome = validator.validate(&file.mime_type, &file.bytes)?;

        let sha256 = dedup::sha256_hex(&file.bytes);
        if let Some(existing) = dedup::check_duplicate(self.uploads, yacht_id, &sha256) {
            return Ok(FileAdmission {
                file_name: file.file_name.clone(),
                upload_id: Some(existing.id),
                is_duplicate: true,
                processing_status: Some(existing.processing_status),
                storage_path: Some(existing.storage_path),
                error_code: None,
                message: "Duplicate file - using existing upload".to_string(),
            });
        }

        let upload_id = Uuid::new_v4();
        let storage_path = storage::storage_key(yacht_id, kind, &file.file_name, upload_id);
        self.blobs
            .put(&storage_path, &file.bytes)
            .await
            .map_err(|e| PipelineError::internal(format!("blob store write failed: {e}")))?;

        let record = UploadRecord {
            id: upload_id,
            yacht_id,
            uploaded_by: actor_id,
            file_name: file.file_name.clone(),
            mime_type: outcome.mime_type,
            file_size_bytes: outcome.file_size_bytes,
            sha256,
            storage_path: storage_path.clone(),
            upload_kind: kind,
            processing_status: ProcessingStatus::Queued,
            quality: outcome.quality,
            created_at: Utc::now(),
        };

        // The unique (tenant, sha256) index resolves concurrent identical
        // uploads to a single row; the returned record is the winner's.
        let stored = self.uploads.insert(&record)?;
        let lost_race = stored.id != upload_id;
        if lost_race {
            // Our blob write is orphaned; the winner's object stays.
            let _ = self.blobs.delete(&storage_path).await;
        }

        info!(
            upload_id = %stored.id,
            yacht_id = %yacht_id,
            file = %file.file_name,
            duplicate = lost_race,
            "📥 Upload admitted"
        );

        Ok(FileAdmission {
            file_name: file.file_name.clone(),
            upload_id: Some(stored.id),
            is_duplicate: lost_race,
            processing_status: Some(stored.processing_status),
            storage_path: Some(stored.storage_path),
            error_code: None,
            message: if lost_race {
                "Duplicate file - using existing upload".to_string()
            } else {
                "Upload successful - queued for processing".to_string()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use image::{GrayImage, Luma};
    use storage::LocalBlobStore;
    use tempfile::{NamedTempFile, TempDir};

    fn sharp_png(w: u32, h: u32) -> Vec<u8> {
        let img = GrayImage::from_fn(w, h, |x, y| {
            if (x + y) % 2 == 0 { Luma([10]) } else { Luma([200]) }
        });
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    async fn gate_fixture() -> (Config, Database, LocalBlobStore, NamedTempFile, TempDir) {
        let db_file = NamedTempFile::new().unwrap();
        let db = Database::new(db_file.path().to_str().unwrap()).unwrap();
        let blob_dir = TempDir::new().unwrap();
        let blobs = LocalBlobStore::new(blob_dir.path());
        (Config::from_env(), db, blobs, db_file, blob_dir)
    }

    #[tokio::test]
    async fn test_duplicate_upload_is_record_level_noop() {
        let (config, db, blobs, _f, _d) = gate_fixture().await;
        let gate = IntakeGate::new(&config, &db, &blobs);
        let yacht = Uuid::new_v4();
        let actor = Uuid::new_v4();
        let bytes = sharp_png(800, 600);

        let first = gate
            .admit(yacht, actor, UploadKind::Receiving, vec![IncomingFile {
                file_name: "slip.png".into(),
                mime_type: "image/png".into(),
                bytes: bytes.clone(),
            }])
            .await
            .unwrap();
        assert!(!first[0].is_duplicate);
        let first_id = first[0].upload_id.unwrap();

        let second = gate
            .admit(yacht, actor, UploadKind::Receiving, vec![IncomingFile {
                file_name: "slip-copy.png".into(),
                mime_type: "image/png".into(),
                bytes,
            }])
            .await
            .unwrap();
        assert!(second[0].is_duplicate);
        assert_eq!(second[0].upload_id.unwrap(), first_id);
    }

    #[tokio::test]
    async fn test_partial_success_across_siblings() {
        let (config, db, blobs, _f, _d) = gate_fixture().await;
        let gate = IntakeGate::new(&config, &db, &blobs);

        let results = gate
            .admit(Uuid::new_v4(), Uuid::new_v4(), UploadKind::Receiving, vec![
                IncomingFile {
                    file_name: "good.png".into(),
                    mime_type: "image/png".into(),
                    bytes: sharp_png(800, 600),
                },
                IncomingFile {
                    file_name: "bad.gif".into(),
                    mime_type: "image/gif".into(),
                    bytes: vec![0u8; 10],
                },
            ])
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].upload_id.is_some());
        assert_eq!(results[1].error_code.as_deref(), Some("INVALID_FILE_TYPE"));
        assert_eq!(results[1].processing_status, Some(ProcessingStatus::Failed));
    }

    #[tokio::test]
    async fn test_stored_bytes_hash_matches_record() {
        let (config, db, blobs, _f, _d) = gate_fixture().await;
        let gate = IntakeGate::new(&config, &db, &blobs);
        let yacht = Uuid::new_v4();
        let bytes = sharp_png(800, 600);

        let results = gate
            .admit(yacht, Uuid::new_v4(), UploadKind::Receiving, vec![IncomingFile {
                file_name: "slip.png".into(),
                mime_type: "image/png".into(),
                bytes: bytes.clone(),
            }])
            .await
            .unwrap();

        let record = db.get(yacht, results[0].upload_id.unwrap()).unwrap().unwrap();
        let stored = blobs.get(&record.storage_path).await.unwrap();
        assert_eq!(dedup::sha256_hex(&stored), record.sha256);
    }
}
