//! Pipeline orchestrator: Intake → OCR → Extraction → Reconciliation →
//! draft session. Each request owns its cost tracker and temp staging;
//! commit is a separate, explicitly privileged step.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{Database, SessionRepository, UploadRepository};
use crate::error::{ErrorCode, PipelineError};
use crate::extraction::cost::SessionCostTracker;
use crate::extraction::llm::LlmClient;
use crate::intake::storage::{BlobStore, TempStore};
use crate::intake::{FileAdmission, IncomingFile, IntakeGate};
use crate::models::{
    DraftLine, ProcessingStatus, ProcessingSummary, Provenance, ReceivingSession, UploadKind,
};
use crate::ocr::{self, OcrEngine, OcrResult};
use crate::reconciliation::{orders, Reconciler};

/// Result of processing one upload into draft lines.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingResult {
    pub session_id: Uuid,
    pub lines_extracted: usize,
    pub coverage: f64,
    pub llm_invocations: u32,
    pub total_cost: f64,
    pub primary_method: String,
    pub document_kind: String,
    pub manual_review_required: bool,
    pub order_found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_number: Option<String>,
}

pub struct ReceivingPipeline {
    config: Arc<Config>,
    db: Arc<Database>,
    blobs: Arc<dyn BlobStore>,
    temp: TempStore,
    llm: Option<Arc<dyn LlmClient>>,
    ocr_override: Option<Arc<dyn OcrEngine>>,
}

impl ReceivingPipeline {
    pub fn new(
        config: Arc<Config>,
        db: Arc<Database>,
        blobs: Arc<dyn BlobStore>,
        llm: Option<Arc<dyn LlmClient>>,
    ) -> Self {
        let temp = TempStore::new(&config.temp_root);
        Self { config, db, blobs, temp, llm, ocr_override: None }
    }

    /// Pin the OCR engine instead of going through the selector. Tests use
    /// this to run the pipeline without sidecar binaries.
    pub fn with_ocr_engine(mut self, engine: Arc<dyn OcrEngine>) -> Self {
        self.ocr_override = Some(engine);
        self
    }

    pub fn temp_store(&self) -> &TempStore {
        &self.temp
    }

    /// Intake stage for a batch of files.
    pub async fn admit_files(
        &self,
        yacht_id: Uuid,
        actor_id: Uuid,
        kind: UploadKind,
        files: Vec<IncomingFile>,
    ) -> Result<Vec<FileAdmission>, PipelineError> {
        IntakeGate::new(&self.config, self.db.as_ref(), self.blobs.as_ref())
            .admit(yacht_id, actor_id, kind, files)
            .await
    }

    /// Fetch or create the draft session that processing feeds into.
    pub fn ensure_session(
        &self,
        yacht_id: Uuid,
        actor_id: Uuid,
        session_id: Option<Uuid>,
    ) -> Result<ReceivingSession, PipelineError> {
        if let Some(session_id) = session_id {
            return self
                .db
                .get_session(yacht_id, session_id)?
                .ok_or_else(|| PipelineError::new(ErrorCode::SessionNotFound, "Unknown session"));
        }
        self.db.create_session(yacht_id, actor_id)
    }

    /// Process one admitted upload end to end into draft lines.
    pub async fn process_upload(
        &self,
        yacht_id: Uuid,
        upload_id: Uuid,
        session_id: Uuid,
    ) -> Result<ProcessingResult, PipelineError> {
        match self.process_inner(yacht_id, upload_id, session_id).await {
            Ok(result) => {
                self.db.update_status(yacht_id, upload_id, ProcessingStatus::Completed)?;
                Ok(result)
            }
            Err(e) => {
                error!(upload_id = %upload_id, error = %e, "Upload processing failed");
                let _ = self.db.update_status(yacht_id, upload_id, ProcessingStatus::Failed);
                Err(e)
            }
        }
    }

    async fn process_inner(
        &self,
        yacht_id: Uuid,
        upload_id: Uuid,
        session_id: Uuid,
    ) -> Result<ProcessingResult, PipelineError> {
        let upload = self
            .db
            .get(yacht_id, upload_id)?
            .ok_or_else(|| PipelineError::new(ErrorCode::NotFound, "Upload not found"))?;
        self.db.update_status(yacht_id, upload_id, ProcessingStatus::Processing)?;

        let bytes = self
            .blobs
            .get(&upload.storage_path)
            .await
            .map_err(|e| PipelineError::internal(format!("blob fetch failed: {e}")))?;

        // Stage into tenant-scoped temp space for the duration of the
        // request; the guard removes it on every exit path.
        let ext = upload.file_name.rsplit('.').next().unwrap_or("bin");
        let _staged = self
            .temp
            .stage(yacht_id, ext, &bytes)
            .await
            .map_err(|e| PipelineError::internal(format!("temp staging failed: {e}")))?;

        let ocr_result = self.run_ocr(&upload.mime_type, &bytes).await?;

        let mut tracker = SessionCostTracker::new(session_id);
        let extraction = crate::extraction::extract(
            &self.config,
            self.llm.as_deref(),
            &mut tracker,
            &ocr_result,
        )
        .await;

        // Resolve an extracted order number against this tenant's orders.
        let extracted_order = extraction
            .entities
            .as_ref()
            .and_then(|e| e.order_number.clone());
        let matched_order = match &extracted_order {
            Some(number) => orders::find_order_by_number(self.db.as_ref(), yacht_id, number)?,
            None => None,
        };

        let reconciled =
            Reconciler::new(self.db.as_ref(), self.db.as_ref()).reconcile(yacht_id, extraction.lines)?;

        let mut lines_extracted = 0usize;
        for item in &reconciled {
            let draft = DraftLine {
                id: Uuid::new_v4(),
                session_id,
                yacht_id,
                line_number: item.line.line_number,
                quantity: item.line.quantity,
                unit: item.line.unit.clone(),
                description: item.line.description.clone(),
                extracted_part_number: item.line.part_number.clone(),
                unit_price: None,
                confidence: item.line.confidence,
                provenance: item.line.provenance,
                raw_text: item.line.raw_text.clone(),
                is_verified: false,
                verified_by: None,
                verified_at: None,
                source_upload_id: Some(upload_id),
                suggested_part: item.suggested_part.clone(),
                discrepancy: item.discrepancy.clone(),
            };
            self.db.insert_line(&draft)?;
            lines_extracted += 1;
        }

        let summary = ProcessingSummary {
            lines_extracted: lines_extracted as u32,
            lines_verified: 0,
            llm_calls: tracker.llm_calls,
            total_cost: tracker.total_cost,
            primary_method: Some(extraction.primary_method.as_str().to_string()),
        };
        self.db.update_summary(yacht_id, session_id, &summary)?;

        info!(
            upload_id = %upload_id,
            session_id = %session_id,
            lines = lines_extracted,
            llm_calls = tracker.llm_calls,
            cost = tracker.total_cost,
            engine = %ocr_result.engine,
            "🚚 Upload processed into draft lines"
        );

        Ok(ProcessingResult {
            session_id,
            lines_extracted,
            coverage: extraction.coverage,
            llm_invocations: tracker.llm_calls,
            total_cost: tracker.total_cost,
            primary_method: extraction.primary_method.as_str().to_string(),
            document_kind: extraction.classification.kind.as_str().to_string(),
            manual_review_required: extraction.manual_review_required
                || extraction.primary_method == Provenance::Regex && lines_extracted == 0,
            order_found: matched_order.is_some(),
            order_number: matched_order
                .map(|o| o.order_number)
                .or(extracted_order),
        })
    }

    async fn run_ocr(&self, mime_type: &str, bytes: &[u8]) -> Result<OcrResult, PipelineError> {
        if mime_type == "application/pdf" {
            let extractor = crate::ocr::pdf::PdfTextExtractor::new(&self.config);
            let engine = self.image_engine()?;
            return extractor
                .extract_with_engine(bytes, engine)
                .await
                .map_err(|e| PipelineError::new(ErrorCode::OcrFailed, e.to_string()));
        }

        let preprocessed = crate::ocr::preprocess::preprocess_image(&self.config, bytes).await;
        let engine = self.image_engine()?;
        ocr::run_with_fallback(&self.config, engine, &preprocessed).await
    }

    fn image_engine(&self) -> Result<Arc<dyn OcrEngine>, PipelineError> {
        match &self.ocr_override {
            Some(engine) => Ok(engine.clone()),
            None => ocr::select_engine(&self.config),
        }
    }

    /// Background temp sweeper loop; runs until the process exits.
    pub async fn run_temp_sweeper(config: Arc<Config>) {
        let temp = TempStore::new(&config.temp_root);
        let max_age = std::time::Duration::from_secs(config.temp_max_age_hours * 3600);
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            if let Err(e) = temp.sweep(max_age).await {
                error!(error = %e, "Temp sweep failed");
            }
        }
    }
}

/// Mark a draft line verified; returns the refreshed session lines count.
pub fn verify_line(
    db: &Database,
    yacht_id: Uuid,
    session_id: Uuid,
    line_id: Uuid,
    actor_id: Uuid,
) -> Result<(), PipelineError> {
    if !db.update_line_verified(yacht_id, session_id, line_id, actor_id)? {
        return Err(PipelineError::new(ErrorCode::NotFound, "Draft line not found"));
    }

    // Keep the session summary's verified count current.
    let lines = db.list_lines(yacht_id, session_id)?;
    if let Some(session) = db.get_session(yacht_id, session_id)? {
        let mut summary = session.summary;
        summary.lines_verified = lines.iter().filter(|l| l.is_verified).count() as u32;
        db.update_summary(yacht_id, session_id, &summary)?;
    }
    info!(line_id = %line_id, yacht_id = %yacht_id, at = %Utc::now(), "Line verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::storage::LocalBlobStore;
    use crate::ocr::OcrFragment;
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use image::{GrayImage, Luma};
    use serde_json::json;
    use tempfile::{NamedTempFile, TempDir};

    struct StubOcr {
        text: String,
    }

    #[async_trait]
    impl OcrEngine for StubOcr {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn extract(&self, _image_bytes: &[u8]) -> AnyResult<OcrResult> {
            Ok(OcrResult {
                text: self.text.clone(),
                confidence: 0.93,
                fragments: vec![OcrFragment {
                    text: "12".into(),
                    confidence: 0.95,
                    bbox: (10.0, 10.0, 30.0, 28.0),
                }],
                engine: "stub".into(),
                processing_time_ms: 2,
                metadata: json!({}),
            })
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    fn sharp_png() -> Vec<u8> {
        let img = GrayImage::from_fn(800, 600, |x, y| {
            if (x + y) % 2 == 0 { Luma([10]) } else { Luma([200]) }
        });
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    struct Fixture {
        pipeline: ReceivingPipeline,
        db: Arc<Database>,
        yacht: Uuid,
        actor: Uuid,
        _db_file: NamedTempFile,
        _blob_dir: TempDir,
        _temp_dir: TempDir,
    }

    fn fixture(ocr_text: &str) -> Fixture {
        let db_file = NamedTempFile::new().unwrap();
        let db = Arc::new(Database::new(db_file.path().to_str().unwrap()).unwrap());
        let blob_dir = TempDir::new().unwrap();
        let temp_dir = TempDir::new().unwrap();

        let mut config = Config::from_env();
        config.temp_root = temp_dir.path().to_string_lossy().into_owned();
        let config = Arc::new(config);

        let blobs = Arc::new(LocalBlobStore::new(blob_dir.path()));
        let pipeline = ReceivingPipeline::new(config, db.clone(), blobs, None)
            .with_ocr_engine(Arc::new(StubOcr { text: ocr_text.into() }));

        Fixture {
            pipeline,
            db,
            yacht: Uuid::new_v4(),
            actor: Uuid::new_v4(),
            _db_file: db_file,
            _blob_dir: blob_dir,
            _temp_dir: temp_dir,
        }
    }

    const SLIP_TEXT: &str = "PACKING SLIP\n\
                             Order Number: ORD-2024-042\n\
                             Ship To: MY Excellence\n\
                             Carrier: UPS\n\
                             12 ea MTU Oil Filter MTU-OF-4568\n\
                             3 box Exhaust Gasket Set EGS-2210\n\
                             7 ea Coolant Hose Clamp CHC-0091";

    #[tokio::test]
    async fn test_upload_to_draft_lines_end_to_end() {
        let f = fixture(SLIP_TEXT);
        let part = crate::models::Part {
            id: Uuid::new_v4(),
            yacht_id: f.yacht,
            part_number: "MTU-OF-4568".into(),
            name: "MTU Oil Filter".into(),
            manufacturer: None,
            quantity_on_hand: 2.0,
            minimum_quantity: 1.0,
            bin_location: None,
        };
        f.db.seed_part(&part).unwrap();
        f.db.seed_purchase_order(
            f.yacht,
            "ORD-2024-042",
            Some("MTU Parts Direct"),
            Utc::now(),
            &[(part.id, 12.0)],
        )
        .unwrap();

        let admissions = f
            .pipeline
            .admit_files(f.yacht, f.actor, UploadKind::Receiving, vec![IncomingFile {
                file_name: "slip.png".into(),
                mime_type: "image/png".into(),
                bytes: sharp_png(),
            }])
            .await
            .unwrap();
        let upload_id = admissions[0].upload_id.unwrap();

        let session = f.pipeline.ensure_session(f.yacht, f.actor, None).unwrap();
        let result =
            f.pipeline.process_upload(f.yacht, upload_id, session.id).await.unwrap();

        assert_eq!(result.lines_extracted, 3);
        assert_eq!(result.primary_method, "regex");
        assert_eq!(result.document_kind, "packing_list");
        assert!(result.order_found);
        assert_eq!(result.order_number.as_deref(), Some("ORD-2024-042"));
        assert_eq!(result.llm_invocations, 0);

        // Draft lines persisted with the exact-match suggestion attached.
        let lines = f.db.list_lines(f.yacht, session.id).unwrap();
        assert_eq!(lines.len(), 3);
        let first = &lines[0];
        assert_eq!(first.description, "MTU Oil Filter");
        let suggestion = first.suggested_part.as_ref().unwrap();
        assert_eq!(suggestion.match_reason.as_str(), "exact_part_number");
        assert!(!first.is_verified);

        // Upload marked completed.
        let upload = f.db.get(f.yacht, upload_id).unwrap().unwrap();
        assert_eq!(upload.processing_status, ProcessingStatus::Completed);

        // Session summary updated.
        let session = f.db.get_session(f.yacht, session.id).unwrap().unwrap();
        assert_eq!(session.summary.lines_extracted, 3);
        assert_eq!(session.summary.primary_method.as_deref(), Some("regex"));
    }

    #[tokio::test]
    async fn test_verify_line_updates_summary() {
        let f = fixture(SLIP_TEXT);
        let admissions = f
            .pipeline
            .admit_files(f.yacht, f.actor, UploadKind::Receiving, vec![IncomingFile {
                file_name: "slip.png".into(),
                mime_type: "image/png".into(),
                bytes: sharp_png(),
            }])
            .await
            .unwrap();
        let session = f.pipeline.ensure_session(f.yacht, f.actor, None).unwrap();
        f.pipeline
            .process_upload(f.yacht, admissions[0].upload_id.unwrap(), session.id)
            .await
            .unwrap();

        let lines = f.db.list_lines(f.yacht, session.id).unwrap();
        verify_line(&f.db, f.yacht, session.id, lines[0].id, f.actor).unwrap();

        let refreshed = f.db.list_lines(f.yacht, session.id).unwrap();
        assert!(refreshed[0].is_verified);
        assert_eq!(refreshed[0].verified_by, Some(f.actor));
        let session = f.db.get_session(f.yacht, session.id).unwrap().unwrap();
        assert_eq!(session.summary.lines_verified, 1);

        // Unknown line id is a NotFound.
        let err = verify_line(&f.db, f.yacht, session.id, Uuid::new_v4(), f.actor).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_missing_upload_fails_cleanly() {
        let f = fixture(SLIP_TEXT);
        let session = f.pipeline.ensure_session(f.yacht, f.actor, None).unwrap();
        let err = f
            .pipeline
            .process_upload(f.yacht, Uuid::new_v4(), session.id)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_ensure_session_rejects_unknown_id() {
        let f = fixture(SLIP_TEXT);
        let err = f
            .pipeline
            .ensure_session(f.yacht, f.actor, Some(Uuid::new_v4()))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionNotFound);
    }
}
