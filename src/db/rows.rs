//! Row-level helpers shared by the store and the commit engine.
//!
//! Everything takes a `&Connection` so the same code runs inside the commit
//! engine's transaction (a `Transaction` derefs to `Connection`).

use chrono::{DateTime, Datelike, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{
    DraftLine, LineConfidence, Part, ProcessingStatus, ProcessingSummary, Provenance,
    QualityMetadata, ReceivingEvent, ReceivingSession, SessionStatus, UploadKind, UploadRecord,
};

use super::OrderRow;

pub(crate) fn uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn opt_uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let text: Option<String> = row.get(idx)?;
    match text {
        Some(t) => Uuid::parse_str(&t)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

pub(crate) fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    match text {
        Some(t) => DateTime::parse_from_rfc3339(&t)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

fn upload_row(row: &Row<'_>) -> rusqlite::Result<UploadRecord> {
    let kind: String = row.get(8)?;
    let status: String = row.get(9)?;
    let quality_json: String = row.get(10)?;
    Ok(UploadRecord {
        id: uuid_col(row, 0)?,
        yacht_id: uuid_col(row, 1)?,
        uploaded_by: uuid_col(row, 2)?,
        file_name: row.get(3)?,
        mime_type: row.get(4)?,
        file_size_bytes: row.get::<_, i64>(5)? as u64,
        sha256: row.get(6)?,
        storage_path: row.get(7)?,
        upload_kind: UploadKind::from_str(&kind).unwrap_or(UploadKind::Receiving),
        processing_status: ProcessingStatus::from_str(&status)
            .unwrap_or(ProcessingStatus::Queued),
        quality: serde_json::from_str::<QualityMetadata>(&quality_json).unwrap_or_default(),
        created_at: time_col(row, 11)?,
    })
}

const UPLOAD_COLUMNS: &str = "id, yacht_id, uploaded_by, file_name, mime_type, file_size_bytes, \
     sha256, storage_path, upload_kind, processing_status, quality_json, created_at";

/// Insert an upload record. The `(yacht_id, sha256)` unique index makes this
/// safe under concurrent duplicate uploads: the losing insert reads and
/// returns the winner's row.
pub fn insert_upload(
    conn: &Connection,
    upload: &UploadRecord,
) -> Result<UploadRecord, PipelineError> {
    let inserted = conn.execute(
        "INSERT INTO uploads (id, yacht_id, uploaded_by, file_name, mime_type,
            file_size_bytes, sha256, storage_path, upload_kind, processing_status,
            quality_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT (yacht_id, sha256) DO NOTHING",
        params![
            upload.id.to_string(),
            upload.yacht_id.to_string(),
            upload.uploaded_by.to_string(),
            upload.file_name,
            upload.mime_type,
            upload.file_size_bytes as i64,
            upload.sha256,
            upload.storage_path,
            upload.upload_kind.as_str(),
            upload.processing_status.as_str(),
            serde_json::to_string(&upload.quality).unwrap_or_else(|_| "{}".into()),
            upload.created_at.to_rfc3339(),
        ],
    )?;

    if inserted > 0 {
        return Ok(upload.clone());
    }
    find_upload_by_sha(conn, upload.yacht_id, &upload.sha256)?
        .ok_or_else(|| PipelineError::internal("duplicate upload row vanished"))
}

pub fn find_upload_by_sha(
    conn: &Connection,
    yacht_id: Uuid,
    sha256: &str,
) -> Result<Option<UploadRecord>, PipelineError> {
    conn.query_row(
        &format!("SELECT {UPLOAD_COLUMNS} FROM uploads WHERE yacht_id = ?1 AND sha256 = ?2"),
        params![yacht_id.to_string(), sha256],
        upload_row,
    )
    .optional()
    .map_err(PipelineError::from)
}

pub fn get_upload(
    conn: &Connection,
    yacht_id: Uuid,
    id: Uuid,
) -> Result<Option<UploadRecord>, PipelineError> {
    conn.query_row(
        &format!("SELECT {UPLOAD_COLUMNS} FROM uploads WHERE yacht_id = ?1 AND id = ?2"),
        params![yacht_id.to_string(), id.to_string()],
        upload_row,
    )
    .optional()
    .map_err(PipelineError::from)
}

fn part_row(row: &Row<'_>) -> rusqlite::Result<Part> {
    Ok(Part {
        id: uuid_col(row, 0)?,
        yacht_id: uuid_col(row, 1)?,
        part_number: row.get(2)?,
        name: row.get(3)?,
        manufacturer: row.get(4)?,
        quantity_on_hand: row.get(5)?,
        minimum_quantity: row.get(6)?,
        bin_location: row.get(7)?,
    })
}

const PART_COLUMNS: &str =
    "id, yacht_id, part_number, name, manufacturer, quantity_on_hand, minimum_quantity, bin_location";

pub fn list_parts(conn: &Connection, yacht_id: Uuid) -> Result<Vec<Part>, PipelineError> {
    let mut stmt =
        conn.prepare(&format!("SELECT {PART_COLUMNS} FROM parts WHERE yacht_id = ?1"))?;
    let parts = stmt
        .query_map(params![yacht_id.to_string()], part_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(parts)
}

pub fn get_part(
    conn: &Connection,
    yacht_id: Uuid,
    part_id: Uuid,
) -> Result<Option<Part>, PipelineError> {
    conn.query_row(
        &format!("SELECT {PART_COLUMNS} FROM parts WHERE yacht_id = ?1 AND id = ?2"),
        params![yacht_id.to_string(), part_id.to_string()],
        part_row,
    )
    .optional()
    .map_err(PipelineError::from)
}

/// Atomic inventory step: precondition and mutation in one statement.
/// Returns the new quantity, or `None` when the `quantity_on_hand + delta >= 0`
/// precondition rejected the write (no rows affected).
pub fn atomic_apply_delta(
    conn: &Connection,
    yacht_id: Uuid,
    part_id: Uuid,
    delta: f64,
) -> Result<Option<f64>, PipelineError> {
    conn.query_row(
        "UPDATE parts
         SET quantity_on_hand = quantity_on_hand + ?1, version = version + 1
         WHERE yacht_id = ?2 AND id = ?3 AND quantity_on_hand + ?1 >= 0
         RETURNING quantity_on_hand",
        params![delta, yacht_id.to_string(), part_id.to_string()],
        |row| row.get(0),
    )
    .optional()
    .map_err(PipelineError::from)
}

pub(crate) fn order_row(row: &Row<'_>) -> rusqlite::Result<OrderRow> {
    Ok(OrderRow {
        order_id: uuid_col(row, 0)?,
        order_number: row.get(1)?,
        supplier: row.get(2)?,
        order_date: time_col(row, 3)?,
        status: row.get(4)?,
    })
}

fn session_row(row: &Row<'_>) -> rusqlite::Result<ReceivingSession> {
    let status: String = row.get(3)?;
    let summary_json: String = row.get(5)?;
    Ok(ReceivingSession {
        id: uuid_col(row, 0)?,
        yacht_id: uuid_col(row, 1)?,
        session_number: row.get(2)?,
        status: SessionStatus::from_str(&status).unwrap_or(SessionStatus::Draft),
        created_by: uuid_col(row, 4)?,
        summary: serde_json::from_str::<ProcessingSummary>(&summary_json).unwrap_or_default(),
        event_id: opt_uuid_col(row, 6)?,
        created_at: time_col(row, 7)?,
        committed_at: opt_time_col(row, 8)?,
        committed_by: opt_uuid_col(row, 9)?,
    })
}

pub fn get_session(
    conn: &Connection,
    yacht_id: Uuid,
    session_id: Uuid,
) -> Result<Option<ReceivingSession>, PipelineError> {
    conn.query_row(
        "SELECT id, yacht_id, session_number, status, created_by, summary_json,
                event_id, created_at, committed_at, committed_by
         FROM receiving_sessions WHERE yacht_id = ?1 AND id = ?2",
        params![yacht_id.to_string(), session_id.to_string()],
        session_row,
    )
    .optional()
    .map_err(PipelineError::from)
}

fn draft_line_row(row: &Row<'_>) -> rusqlite::Result<DraftLine> {
    let confidence: String = row.get(9)?;
    let provenance: String = row.get(10)?;
    let suggested_json: Option<String> = row.get(16)?;
    let discrepancy_json: Option<String> = row.get(17)?;
    Ok(DraftLine {
        id: uuid_col(row, 0)?,
        session_id: uuid_col(row, 1)?,
        yacht_id: uuid_col(row, 2)?,
        line_number: row.get::<_, i64>(3)? as u32,
        quantity: row.get(4)?,
        unit: row.get(5)?,
        description: row.get(6)?,
        extracted_part_number: row.get(7)?,
        unit_price: row.get(8)?,
        confidence: LineConfidence::from_str(&confidence),
        provenance: if provenance == "llm" { Provenance::Llm } else { Provenance::Regex },
        raw_text: row.get(11)?,
        is_verified: row.get::<_, i64>(12)? != 0,
        verified_by: opt_uuid_col(row, 13)?,
        verified_at: opt_time_col(row, 14)?,
        source_upload_id: opt_uuid_col(row, 15)?,
        suggested_part: suggested_json.and_then(|j| serde_json::from_str(&j).ok()),
        discrepancy: discrepancy_json.and_then(|j| serde_json::from_str(&j).ok()),
    })
}

pub fn insert_draft_line(conn: &Connection, line: &DraftLine) -> Result<(), PipelineError> {
    conn.execute(
        "INSERT INTO draft_lines
            (id, session_id, yacht_id, line_number, quantity, unit, description,
             extracted_part_number, unit_price, confidence, provenance, raw_text,
             is_verified, verified_by, verified_at, source_upload_id,
             suggested_part_json, discrepancy_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            line.id.to_string(),
            line.session_id.to_string(),
            line.yacht_id.to_string(),
            line.line_number as i64,
            line.quantity,
            line.unit,
            line.description,
            line.extracted_part_number,
            line.unit_price,
            line.confidence.as_str(),
            line.provenance.as_str(),
            line.raw_text,
            line.is_verified as i64,
            line.verified_by.map(|u| u.to_string()),
            line.verified_at.map(|t| t.to_rfc3339()),
            line.source_upload_id.map(|u| u.to_string()),
            line.suggested_part.as_ref().and_then(|s| serde_json::to_string(s).ok()),
            line.discrepancy.as_ref().and_then(|d| serde_json::to_string(d).ok()),
        ],
    )?;
    Ok(())
}

pub fn list_draft_lines(
    conn: &Connection,
    yacht_id: Uuid,
    session_id: Uuid,
) -> Result<Vec<DraftLine>, PipelineError> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, yacht_id, line_number, quantity, unit, description,
                extracted_part_number, unit_price, confidence, provenance, raw_text,
                is_verified, verified_by, verified_at, source_upload_id,
                suggested_part_json, discrepancy_json
         FROM draft_lines WHERE yacht_id = ?1 AND session_id = ?2
         ORDER BY line_number ASC",
    )?;
    let lines = stmt
        .query_map(params![yacht_id.to_string(), session_id.to_string()], draft_line_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(lines)
}

/// Count this tenant's events created in the given year (event numbering).
pub fn count_events_in_year(
    conn: &Connection,
    yacht_id: Uuid,
    year: i32,
) -> Result<i64, PipelineError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM receiving_events
         WHERE yacht_id = ?1 AND created_at >= ?2 AND created_at < ?3",
        params![
            yacht_id.to_string(),
            format!("{year}-01-01T00:00:00+00:00"),
            format!("{}-01-01T00:00:00+00:00", year + 1),
        ],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn insert_event(conn: &Connection, event: &ReceivingEvent) -> Result<(), PipelineError> {
    conn.execute(
        "INSERT INTO receiving_events
            (id, yacht_id, session_id, event_number, committed_by, commitment_notes,
             lines_committed, total_cost, signature, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            event.id.to_string(),
            event.yacht_id.to_string(),
            event.session_id.to_string(),
            event.event_number,
            event.committed_by.to_string(),
            event.commitment_notes,
            event.lines_committed as i64,
            event.total_cost,
            event.signature,
            event.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn event_row(row: &Row<'_>) -> rusqlite::Result<ReceivingEvent> {
    Ok(ReceivingEvent {
        id: uuid_col(row, 0)?,
        yacht_id: uuid_col(row, 1)?,
        session_id: uuid_col(row, 2)?,
        event_number: row.get(3)?,
        committed_by: uuid_col(row, 4)?,
        commitment_notes: row.get(5)?,
        lines_committed: row.get::<_, i64>(6)? as u32,
        total_cost: row.get(7)?,
        signature: row.get(8)?,
        created_at: time_col(row, 9)?,
    })
}

pub fn get_event(
    conn: &Connection,
    yacht_id: Uuid,
    event_id: Uuid,
) -> Result<Option<ReceivingEvent>, PipelineError> {
    conn.query_row(
        "SELECT id, yacht_id, session_id, event_number, committed_by, commitment_notes,
                lines_committed, total_cost, signature, created_at
         FROM receiving_events WHERE yacht_id = ?1 AND id = ?2",
        params![yacht_id.to_string(), event_id.to_string()],
        event_row,
    )
    .optional()
    .map_err(PipelineError::from)
}

pub fn insert_inventory_transaction(
    conn: &Connection,
    yacht_id: Uuid,
    part_id: Uuid,
    quantity: f64,
    kind: &str,
    reference_id: Uuid,
    reference_kind: &str,
    actor: Uuid,
) -> Result<Uuid, PipelineError> {
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO inventory_transactions
            (id, yacht_id, part_id, quantity, transaction_kind, reference_id,
             reference_kind, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id.to_string(),
            yacht_id.to_string(),
            part_id.to_string(),
            quantity,
            kind,
            reference_id.to_string(),
            reference_kind,
            actor.to_string(),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(id)
}

#[allow(clippy::too_many_arguments)]
pub fn insert_finance_transaction(
    conn: &Connection,
    yacht_id: Uuid,
    reference_id: Uuid,
    amount: f64,
    currency: &str,
    description: &str,
    signature: &str,
    actor: Uuid,
) -> Result<Uuid, PipelineError> {
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO finance_transactions
            (id, yacht_id, reference_id, reference_kind, transaction_kind, category,
             amount, currency, description, signature, created_by, created_at)
         VALUES (?1, ?2, ?3, 'receiving_event', 'expense', 'parts_inventory',
                 ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id.to_string(),
            yacht_id.to_string(),
            reference_id.to_string(),
            amount,
            currency,
            description,
            signature,
            actor.to_string(),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(id)
}

#[allow(clippy::too_many_arguments)]
pub fn insert_audit_entry(
    conn: &Connection,
    yacht_id: Uuid,
    user_id: Uuid,
    action: &str,
    entity_type: &str,
    entity_id: Uuid,
    old_values: &serde_json::Value,
    new_values: &serde_json::Value,
    signature: &str,
) -> Result<Uuid, PipelineError> {
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO audit_log
            (id, yacht_id, user_id, action, entity_type, entity_id,
             old_values, new_values, signature, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            id.to_string(),
            yacht_id.to_string(),
            user_id.to_string(),
            action,
            entity_type,
            entity_id.to_string(),
            old_values.to_string(),
            new_values.to_string(),
            signature,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(id)
}

/// Double-commit guard: flips a session to committed only while it is still
/// a draft. Zero rows affected means someone else won the race.
pub fn commit_session_if_draft(
    conn: &Connection,
    yacht_id: Uuid,
    session_id: Uuid,
    actor: Uuid,
    event_id: Uuid,
    committed_at: DateTime<Utc>,
) -> Result<bool, PipelineError> {
    let affected = conn.execute(
        "UPDATE receiving_sessions
         SET status = 'committed', committed_by = ?1, committed_at = ?2, event_id = ?3
         WHERE id = ?4 AND yacht_id = ?5 AND status = 'draft'",
        params![
            actor.to_string(),
            committed_at.to_rfc3339(),
            event_id.to_string(),
            session_id.to_string(),
            yacht_id.to_string(),
        ],
    )?;
    Ok(affected > 0)
}

/// Event-number generation with the timestamp fallback used when the yearly
/// count cannot be read.
pub fn next_event_number(conn: &Connection, yacht_id: Uuid) -> String {
    let year = Utc::now().year();
    match count_events_in_year(conn, yacht_id, year) {
        Ok(count) => format!("RCV-EVT-{year}-{:03}", count + 1),
        Err(_) => format!("RCV-EVT-{year}-{}", Utc::now().timestamp()),
    }
}
