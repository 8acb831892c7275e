//! Commit engine: one verified draft session becomes an immutable event,
//! inventory mutations, finance records, and a signed audit entry, all
//! inside a single database transaction.

pub mod signature;

use chrono::Utc;
use rusqlite::TransactionBehavior;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{rows, Database};
use crate::error::{ErrorCode, PipelineError};
use crate::models::{LowStockAlert, ReceivingEvent};

#[derive(Debug, Clone, Default, Serialize)]
pub struct InventorySummary {
    pub parts_updated: u32,
    pub total_quantity_added: f64,
    pub transactions_created: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinanceSummary {
    pub transactions_created: u32,
    pub total_cost: f64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitSummary {
    pub event: ReceivingEvent,
    pub inventory: InventorySummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finance: Option<FinanceSummary>,
    pub audit_id: Uuid,
    pub low_stock_alerts: Vec<LowStockAlert>,
}

pub struct CommitEngine<'a> {
    db: &'a Database,
}

impl<'a> CommitEngine<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Commit a draft session. Fails with SESSION_NOT_FOUND, UNVERIFIED_LINES
    /// or SESSION_ALREADY_COMMITTED; on any failure every write in this call
    /// is rolled back by the enclosing transaction.
    pub fn commit(
        &self,
        yacht_id: Uuid,
        session_id: Uuid,
        actor_id: Uuid,
        notes: &str,
        override_unverified: bool,
    ) -> Result<CommitSummary, PipelineError> {
        let mut conn = self.db.open()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(PipelineError::from)?;

        let lines = rows::list_draft_lines(&tx, yacht_id, session_id)?;
        if lines.is_empty() {
            return Err(PipelineError::new(
                ErrorCode::SessionNotFound,
                format!("No draft lines found for session {session_id}"),
            ));
        }

        let unverified = lines.iter().filter(|l| !l.is_verified).count();
        if unverified > 0 && !override_unverified {
            return Err(PipelineError::with_details(
                ErrorCode::UnverifiedLines,
                format!("{unverified} lines not verified"),
                json!({ "unverified_count": unverified, "total_lines": lines.len() }),
            ));
        }

        let committed_at = Utc::now();
        let event_number = rows::next_event_number(&tx, yacht_id);

        let total_cost: f64 = lines
            .iter()
            .filter_map(|l| l.unit_price.filter(|p| *p > 0.0).map(|p| p * l.quantity))
            .sum();
        let line_ids: Vec<String> = lines.iter().map(|l| l.id.to_string()).collect();

        let event = ReceivingEvent {
            id: Uuid::new_v4(),
            yacht_id,
            session_id,
            event_number,
            committed_by: actor_id,
            commitment_notes: notes.to_string(),
            lines_committed: lines.len() as u32,
            total_cost: (total_cost > 0.0).then_some(total_cost),
            signature: signature::sign(&json!({
                "session_id": session_id.to_string(),
                "tenant_id": yacht_id.to_string(),
                "actor_id": actor_id.to_string(),
                "lines": line_ids,
                "timestamp": committed_at.to_rfc3339(),
            })),
            created_at: committed_at,
        };
        rows::insert_event(&tx, &event)?;

        // Inventory: one conditional UPDATE per matched line. Receiving only
        // increments, so a missed precondition means the part row is gone.
        let mut inventory = InventorySummary::default();
        let mut low_stock_alerts = Vec::new();
        for line in &lines {
            let Some(suggested) = &line.suggested_part else {
                warn!(line_id = %line.id, "Draft line has no part match, inventory untouched");
                continue;
            };
            match rows::atomic_apply_delta(&tx, yacht_id, suggested.part_id, line.quantity)? {
                Some(_new_quantity) => {
                    inventory.parts_updated += 1;
                    inventory.total_quantity_added += line.quantity;
                    rows::insert_inventory_transaction(
                        &tx,
                        yacht_id,
                        suggested.part_id,
                        line.quantity,
                        "receiving",
                        event.id,
                        "receiving_event",
                        actor_id,
                    )?;
                    inventory.transactions_created += 1;

                    if let Some(part) = rows::get_part(&tx, yacht_id, suggested.part_id)? {
                        if part.quantity_on_hand < part.minimum_quantity {
                            low_stock_alerts.push(LowStockAlert {
                                part_id: part.id,
                                part_number: part.part_number,
                                current_quantity: part.quantity_on_hand,
                                minimum_quantity: part.minimum_quantity,
                                shortage: part.minimum_quantity - part.quantity_on_hand,
                            });
                        }
                    }
                }
                None => {
                    warn!(
                        line_id = %line.id,
                        part_id = %suggested.part_id,
                        "Part row missing at commit time, skipping inventory update"
                    );
                }
            }
        }

        // Finance: per priced line; failures are logged and skipped, never
        // fatal for the commit.
        let mut finance_created = 0u32;
        let mut finance_total = 0.0f64;
        for line in &lines {
            let Some(unit_price) = line.unit_price.filter(|p| *p > 0.0) else { continue };
            let amount = unit_price * line.quantity;
            let description = format!(
                "Receiving: {} (qty: {} @ ${unit_price:.2})",
                line.description, line.quantity
            );
            let finance_signature = signature::sign(&json!({
                "tenant_id": yacht_id.to_string(),
                "event_id": event.id.to_string(),
                "amount": amount,
                "currency": "USD",
                "description": description,
                "timestamp": committed_at.to_rfc3339(),
            }));
            match rows::insert_finance_transaction(
                &tx,
                yacht_id,
                event.id,
                amount,
                "USD",
                &description,
                &finance_signature,
                actor_id,
            ) {
                Ok(_) => {
                    finance_created += 1;
                    finance_total += amount;
                }
                Err(e) => {
                    error!(line_id = %line.id, error = %e, "Finance transaction failed, skipping");
                }
            }
        }
        let finance = (finance_created > 0).then(|| FinanceSummary {
            transactions_created: finance_created,
            total_cost: finance_total,
            currency: "USD".to_string(),
        });

        let old_values = json!({ "status": "draft" });
        let new_values = json!({
            "status": "committed",
            "event_id": event.id.to_string(),
            "lines_committed": lines.len(),
        });
        let audit_signature = signature::sign(&json!({
            "tenant_id": yacht_id.to_string(),
            "user_id": actor_id.to_string(),
            "action": "commit_receiving_session",
            "entity_type": "receiving_session",
            "entity_id": session_id.to_string(),
            "old_values": old_values,
            "new_values": new_values,
            "timestamp": committed_at.to_rfc3339(),
        }));
        let audit_id = rows::insert_audit_entry(
            &tx,
            yacht_id,
            actor_id,
            "commit_receiving_session",
            "receiving_session",
            session_id,
            &old_values,
            &new_values,
            &audit_signature,
        )?;

        // The double-commit guard. Losing the race rolls back everything
        // written above when the transaction drops.
        if !rows::commit_session_if_draft(&tx, yacht_id, session_id, actor_id, event.id, committed_at)? {
            return Err(PipelineError::new(
                ErrorCode::SessionAlreadyCommitted,
                format!("Session {session_id} has already been committed"),
            ));
        }

        tx.commit().map_err(PipelineError::from)?;

        info!(
            session_id = %session_id,
            event_id = %event.id,
            event_number = %event.event_number,
            lines_committed = lines.len(),
            parts_updated = inventory.parts_updated,
            "✅ Session committed"
        );

        Ok(CommitSummary { event, inventory, finance, audit_id, low_stock_alerts })
    }

    /// Atomic stock deduction for part usage outside receiving. The
    /// `quantity >= delta` precondition and the mutation are one statement;
    /// zero rows affected means INSUFFICIENT_STOCK, never a partial write.
    pub fn record_deduction(
        &self,
        yacht_id: Uuid,
        part_id: Uuid,
        quantity: f64,
        actor_id: Uuid,
        reference_id: Uuid,
    ) -> Result<f64, PipelineError> {
        let mut conn = self.db.open()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(PipelineError::from)?;

        let Some(new_quantity) = rows::atomic_apply_delta(&tx, yacht_id, part_id, -quantity)?
        else {
            return Err(PipelineError::new(
                ErrorCode::InsufficientStock,
                format!("Insufficient stock for part {part_id}: cannot deduct {quantity}"),
            ));
        };
        rows::insert_inventory_transaction(
            &tx,
            yacht_id,
            part_id,
            -quantity,
            "deduction",
            reference_id,
            "work_order",
            actor_id,
        )?;
        tx.commit().map_err(PipelineError::from)?;
        Ok(new_quantity)
    }

    /// Integrity read: recompute an event's signature from its stored fields
    /// and the stored line ids; divergence is SIGNATURE_MISMATCH.
    pub fn verify_event_signature(
        &self,
        yacht_id: Uuid,
        event_id: Uuid,
    ) -> Result<ReceivingEvent, PipelineError> {
        let event = self
            .db
            .get_event(yacht_id, event_id)?
            .ok_or_else(|| PipelineError::new(ErrorCode::NotFound, "Event not found"))?;
        let lines = {
            let conn = self.db.open()?;
            rows::list_draft_lines(&conn, yacht_id, event.session_id)?
        };
        let line_ids: Vec<String> = lines.iter().map(|l| l.id.to_string()).collect();
        let payload = json!({
            "session_id": event.session_id.to_string(),
            "tenant_id": event.yacht_id.to_string(),
            "actor_id": event.committed_by.to_string(),
            "lines": line_ids,
            "timestamp": event.created_at.to_rfc3339(),
        });
        if !signature::verify(&payload, &event.signature) {
            return Err(PipelineError::new(
                ErrorCode::SignatureMismatch,
                format!("Signature mismatch for event {event_id}"),
            ));
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CatalogRepository, SessionRepository};
    use crate::models::{
        DraftLine, LineConfidence, MatchReason, Part, Provenance, SuggestedMatch,
    };
    use tempfile::NamedTempFile;

    struct Fixture {
        db: Database,
        _file: NamedTempFile,
        yacht: Uuid,
        actor: Uuid,
        session: Uuid,
        part: Part,
    }

    fn fixture(verified: bool, unit_price: Option<f64>) -> Fixture {
        let file = NamedTempFile::new().unwrap();
        let db = Database::new(file.path().to_str().unwrap()).unwrap();
        let yacht = Uuid::new_v4();
        let actor = Uuid::new_v4();

        let part = Part {
            id: Uuid::new_v4(),
            yacht_id: yacht,
            part_number: "MTU-OF-4568".into(),
            name: "MTU Oil Filter".into(),
            manufacturer: None,
            quantity_on_hand: 3.0,
            minimum_quantity: 20.0,
            bin_location: None,
        };
        db.seed_part(&part).unwrap();

        let session = db.create_session(yacht, actor).unwrap();
        for n in 0..2u32 {
            db.insert_line(&DraftLine {
                id: Uuid::new_v4(),
                session_id: session.id,
                yacht_id: yacht,
                line_number: n + 1,
                quantity: 6.0,
                unit: "ea".into(),
                description: "MTU Oil Filter".into(),
                extracted_part_number: Some("MTU-OF-4568".into()),
                unit_price,
                confidence: LineConfidence::High,
                provenance: Provenance::Regex,
                raw_text: "6 ea MTU Oil Filter MTU-OF-4568".into(),
                is_verified: verified,
                verified_by: verified.then(|| actor),
                verified_at: verified.then(Utc::now),
                source_upload_id: None,
                suggested_part: Some(SuggestedMatch {
                    part_id: part.id,
                    part_number: part.part_number.clone(),
                    part_name: part.name.clone(),
                    manufacturer: None,
                    confidence: 1.0,
                    match_reason: MatchReason::ExactPartNumber,
                    current_stock: part.quantity_on_hand,
                    bin_location: None,
                    alternatives: Vec::new(),
                    shopping_list: None,
                    recent_order: None,
                }),
                discrepancy: None,
            })
            .unwrap();
        }

        Fixture { db, _file: file, yacht, actor, session: session.id, part }
    }

    #[test]
    fn test_commit_happy_path() {
        let f = fixture(true, Some(45.50));
        let engine = CommitEngine::new(&f.db);
        let summary = engine.commit(f.yacht, f.session, f.actor, "all verified", false).unwrap();

        assert_eq!(summary.event.lines_committed, 2);
        assert!(summary.event.event_number.starts_with("RCV-EVT-"));
        assert_eq!(summary.inventory.parts_updated, 2);
        assert_eq!(summary.inventory.total_quantity_added, 12.0);
        assert_eq!(summary.inventory.transactions_created, 2);

        let finance = summary.finance.unwrap();
        assert_eq!(finance.transactions_created, 2);
        assert!((finance.total_cost - 2.0 * 6.0 * 45.50).abs() < 1e-9);

        // Stock 3 + 12 = 15, still under minimum 20.
        assert_eq!(summary.low_stock_alerts.len(), 2);
        assert_eq!(summary.low_stock_alerts.last().unwrap().current_quantity, 15.0);

        // Session flipped atomically.
        let session = f.db.get_session(f.yacht, f.session).unwrap().unwrap();
        assert_eq!(session.status.as_str(), "committed");
        assert_eq!(session.event_id, Some(summary.event.id));

        // Stored signature verifies bit-for-bit.
        let verified = engine.verify_event_signature(f.yacht, summary.event.id).unwrap();
        assert_eq!(verified.signature, summary.event.signature);
    }

    #[test]
    fn test_unverified_lines_block_commit() {
        let f = fixture(false, None);
        let engine = CommitEngine::new(&f.db);
        let err = engine.commit(f.yacht, f.session, f.actor, "", false).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnverifiedLines);
        assert_eq!(err.details.unwrap()["unverified_count"], 2);

        // Nothing was written.
        let conn = f.db.open().unwrap();
        let events: i64 = conn
            .query_row("SELECT COUNT(*) FROM receiving_events", [], |r| r.get(0))
            .unwrap();
        assert_eq!(events, 0);
    }

    #[test]
    fn test_override_commits_unverified() {
        let f = fixture(false, None);
        let engine = CommitEngine::new(&f.db);
        let summary = engine.commit(f.yacht, f.session, f.actor, "forced", true).unwrap();
        assert_eq!(summary.event.lines_committed, 2);
        assert!(summary.finance.is_none());
    }

    #[test]
    fn test_double_commit_rejected() {
        let f = fixture(true, None);
        let engine = CommitEngine::new(&f.db);
        engine.commit(f.yacht, f.session, f.actor, "first", false).unwrap();
        let err = engine.commit(f.yacht, f.session, f.actor, "second", false).unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionAlreadyCommitted);

        // Exactly one event exists for the session.
        let conn = f.db.open().unwrap();
        let events: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM receiving_events WHERE session_id = ?1",
                [f.session.to_string()],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(events, 1);
        // Inventory was applied exactly once: 3 + 12.
        let part = f.db.get_part(f.yacht, f.part.id).unwrap().unwrap();
        assert_eq!(part.quantity_on_hand, 15.0);
    }

    #[test]
    fn test_missing_session() {
        let f = fixture(true, None);
        let engine = CommitEngine::new(&f.db);
        let err = engine.commit(f.yacht, Uuid::new_v4(), f.actor, "", false).unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionNotFound);
    }

    #[test]
    fn test_event_numbers_increment() {
        let f1 = fixture(true, None);
        let engine = CommitEngine::new(&f1.db);
        let first = engine.commit(f1.yacht, f1.session, f1.actor, "", false).unwrap();
        let year = Utc::now().format("%Y");
        assert_eq!(first.event.event_number, format!("RCV-EVT-{year}-001"));

        let session2 = f1.db.create_session(f1.yacht, f1.actor).unwrap();
        f1.db
            .insert_line(&DraftLine {
                id: Uuid::new_v4(),
                session_id: session2.id,
                yacht_id: f1.yacht,
                line_number: 1,
                quantity: 1.0,
                unit: "ea".into(),
                description: "MTU Oil Filter".into(),
                extracted_part_number: None,
                unit_price: None,
                confidence: LineConfidence::Medium,
                provenance: Provenance::Regex,
                raw_text: String::new(),
                is_verified: true,
                verified_by: Some(f1.actor),
                verified_at: Some(Utc::now()),
                source_upload_id: None,
                suggested_part: None,
                discrepancy: None,
            })
            .unwrap();
        let second = engine.commit(f1.yacht, session2.id, f1.actor, "", false).unwrap();
        assert_eq!(second.event.event_number, format!("RCV-EVT-{year}-002"));
    }

    #[test]
    fn test_deduction_insufficient_stock() {
        let f = fixture(true, None);
        let engine = CommitEngine::new(&f.db);
        // Stock is 3; a deduction of 2 succeeds, a further 2 does not.
        let left = engine
            .record_deduction(f.yacht, f.part.id, 2.0, f.actor, Uuid::new_v4())
            .unwrap();
        assert_eq!(left, 1.0);

        let err = engine
            .record_deduction(f.yacht, f.part.id, 2.0, f.actor, Uuid::new_v4())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InsufficientStock);
        assert_eq!(f.db.get_part(f.yacht, f.part.id).unwrap().unwrap().quantity_on_hand, 1.0);
    }

    #[test]
    fn test_tampered_signature_detected() {
        let f = fixture(true, None);
        let engine = CommitEngine::new(&f.db);
        let summary = engine.commit(f.yacht, f.session, f.actor, "", false).unwrap();

        let conn = f.db.open().unwrap();
        conn.execute(
            "UPDATE receiving_events SET commitment_notes = 'tampered', signature = ?1 WHERE id = ?2",
            rusqlite::params!["0".repeat(64), summary.event.id.to_string()],
        )
        .unwrap();

        let err = engine.verify_event_signature(f.yacht, summary.event.id).unwrap_err();
        assert_eq!(err.code, ErrorCode::SignatureMismatch);
    }
}
