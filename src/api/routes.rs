//! Route handlers for the receiving API.

use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::Json,
    Extension,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::error;
use uuid::Uuid;

use crate::api::AppState;
use crate::auth::Claims;
use crate::commit::CommitEngine;
use crate::db::{SessionRepository, UploadRepository};
use crate::error::{ApiError, ErrorCode, PipelineError};
use crate::intake::{FileAdmission, IncomingFile};
use crate::middleware::logging::RequestId;
use crate::models::{DraftLine, ReceivingSession, UploadKind};
use crate::ocr;

fn api_error(state: &AppState, request_id: Option<&RequestId>, inner: PipelineError) -> ApiError {
    ApiError {
        inner,
        request_id: request_id.map(|r| r.0.clone()),
        expose_internal: state.config.is_development(),
    }
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub status: &'static str,
    pub session_id: Uuid,
    pub images: Vec<FileAdmission>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_eta_seconds: Option<u32>,
}

/// POST /api/v1/images/upload
///
/// Multipart body: any number of `files` parts plus `upload_type` and an
/// optional `session_id`. Accepted files are queued and processed on a
/// background task; rejected files report their error inline.
pub async fn upload_images(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    request_id: Option<Extension<RequestId>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let request_id = request_id.map(|Extension(r)| r);
    let wrap = |e: PipelineError| api_error(&state, request_id.as_ref(), e);

    let mut files: Vec<IncomingFile> = Vec::new();
    let mut upload_type = UploadKind::Receiving;
    let mut session_id: Option<Uuid> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| wrap(PipelineError::internal(format!("multipart error: {e}"))))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "files" | "files[]" | "file" => {
                let file_name = field.file_name().unwrap_or("unnamed").to_string();
                let mime_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| wrap(PipelineError::internal(format!("file read error: {e}"))))?;
                files.push(IncomingFile { file_name, mime_type, bytes: bytes.to_vec() });
            }
            "upload_type" => {
                let text = field.text().await.unwrap_or_default();
                upload_type = UploadKind::from_str(&text).ok_or_else(|| {
                    wrap(PipelineError::new(
                        ErrorCode::InvalidFileType,
                        format!("Unknown upload_type: {text}"),
                    ))
                })?;
            }
            "session_id" => {
                let text = field.text().await.unwrap_or_default();
                session_id = Some(Uuid::parse_str(&text).map_err(|_| {
                    wrap(PipelineError::new(ErrorCode::NotFound, "Malformed session_id"))
                })?);
            }
            _ => {}
        }
    }

    let session = state
        .pipeline
        .ensure_session(claims.yacht_id, claims.sub, session_id)
        .map_err(wrap)?;

    let admissions = state
        .pipeline
        .admit_files(claims.yacht_id, claims.sub, upload_type, files)
        .await
        .map_err(wrap)?;

    // Queue processing for every newly admitted file.
    let mut queued = 0u32;
    for admission in &admissions {
        let (Some(upload_id), None) = (admission.upload_id, admission.error_code.as_ref()) else {
            continue;
        };
        if admission.is_duplicate {
            continue;
        }
        queued += 1;
        let pipeline = state.pipeline.clone();
        let yacht_id = claims.yacht_id;
        let session_id = session.id;
        tokio::spawn(async move {
            if let Err(e) = pipeline.process_upload(yacht_id, upload_id, session_id).await {
                error!(upload_id = %upload_id, error = %e, "Background processing failed");
            }
        });
    }

    let all_ok = admissions.iter().all(|a| a.error_code.is_none());
    Ok(Json(UploadResponse {
        status: if all_ok { "success" } else { "partial_success" },
        session_id: session.id,
        images: admissions,
        processing_eta_seconds: (queued > 0).then_some(30),
    }))
}

/// GET /api/v1/images/:image_id/status
pub async fn image_status(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    request_id: Option<Extension<RequestId>>,
    Path(image_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let request_id = request_id.map(|Extension(r)| r);
    let upload = state
        .db
        .get(claims.yacht_id, image_id)
        .map_err(|e| api_error(&state, request_id.as_ref(), e))?
        .ok_or_else(|| {
            api_error(
                &state,
                request_id.as_ref(),
                PipelineError::new(ErrorCode::NotFound, "Image not found"),
            )
        })?;

    Ok(Json(json!({
        "image_id": upload.id,
        "file_name": upload.file_name,
        "processing_status": upload.processing_status.as_str(),
        "upload_type": upload.upload_kind.as_str(),
        "quality": upload.quality,
        "uploaded_at": upload.created_at.to_rfc3339(),
    })))
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session: ReceivingSession,
    pub lines: Vec<DraftLine>,
    pub verification: VerificationSummary,
    pub permissions: Permissions,
}

#[derive(Debug, Serialize)]
pub struct VerificationSummary {
    pub total_lines: usize,
    pub verified_lines: usize,
    pub all_verified: bool,
}

#[derive(Debug, Serialize)]
pub struct Permissions {
    pub can_verify: bool,
    pub can_commit: bool,
}

/// GET /api/v1/receiving/sessions/:session_id
pub async fn get_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    request_id: Option<Extension<RequestId>>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionResponse>, ApiError> {
    let request_id = request_id.map(|Extension(r)| r);
    let wrap = |e: PipelineError| api_error(&state, request_id.as_ref(), e);

    let session = state
        .db
        .get_session(claims.yacht_id, session_id)
        .map_err(wrap)?
        .ok_or_else(|| wrap(PipelineError::new(ErrorCode::SessionNotFound, "Unknown session")))?;
    let lines = state.db.list_lines(claims.yacht_id, session_id).map_err(wrap)?;

    let verified_lines = lines.iter().filter(|l| l.is_verified).count();
    let verification = VerificationSummary {
        total_lines: lines.len(),
        verified_lines,
        all_verified: !lines.is_empty() && verified_lines == lines.len(),
    };
    let permissions = Permissions {
        can_verify: true,
        can_commit: claims.role.is_privileged(),
    };

    Ok(Json(SessionResponse { session, lines, verification, permissions }))
}

/// PATCH /api/v1/receiving/sessions/:session_id/lines/:line_id/verify
pub async fn verify_line(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    request_id: Option<Extension<RequestId>>,
    Path((session_id, line_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Value>, ApiError> {
    let request_id = request_id.map(|Extension(r)| r);
    crate::pipeline::verify_line(&state.db, claims.yacht_id, session_id, line_id, claims.sub)
        .map_err(|e| api_error(&state, request_id.as_ref(), e))?;

    Ok(Json(json!({
        "status": "success",
        "line_id": line_id,
        "verified_by": claims.sub,
        "verified_at": Utc::now().to_rfc3339(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct CommitRequest {
    #[serde(default)]
    pub commitment_notes: String,
    #[serde(default)]
    pub override_unverified: bool,
}

/// POST /api/v1/receiving/sessions/:session_id/commit
///
/// Privileged: the caller needs the HOD capability.
pub async fn commit_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    request_id: Option<Extension<RequestId>>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<CommitRequest>,
) -> Result<Json<Value>, ApiError> {
    let request_id = request_id.map(|Extension(r)| r);
    let wrap = |e: PipelineError| api_error(&state, request_id.as_ref(), e);

    if !claims.role.is_privileged() {
        return Err(wrap(PipelineError::new(
            ErrorCode::ForbiddenPrivilegedAction,
            "Committing a receiving session requires the HOD role",
        )));
    }

    let summary = CommitEngine::new(&state.db)
        .commit(
            claims.yacht_id,
            session_id,
            claims.sub,
            &request.commitment_notes,
            request.override_unverified,
        )
        .map_err(wrap)?;

    Ok(Json(json!({
        "status": "success",
        "receiving_event": summary.event,
        "inventory_updates": summary.inventory,
        "finance_updates": summary.finance,
        "audit_trail": {
            "audit_log_id": summary.audit_id,
            "signature": summary.event.signature,
        },
        "low_stock_alerts": summary.low_stock_alerts,
        "committed_at": summary.event.created_at.to_rfc3339(),
    })))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let engine = ocr::selected_engine_name()
        .map(str::to_string)
        .or_else(|| {
            ocr::select_engine(&state.config).ok().map(|e| e.name().to_string())
        });

    let status = if engine.is_some() { "ok" } else { "degraded" };
    let code = if engine.is_some() { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        code,
        Json(json!({
            "status": status,
            "ocr_engine": engine,
            "timestamp": Utc::now().to_rfc3339(),
        })),
    )
}
