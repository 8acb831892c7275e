//! End-to-end scenarios across the pipeline: duplicate intake, draft
//! processing, and the concurrency guarantees of the commit engine.

use std::sync::Arc;
use std::thread;

use chrono::Utc;
use tempfile::{NamedTempFile, TempDir};
use uuid::Uuid;

use quartermaster_backend::commit::CommitEngine;
use quartermaster_backend::config::Config;
use quartermaster_backend::db::{
    atomic_apply_delta, CatalogRepository, Database, SessionRepository,
};
use quartermaster_backend::error::ErrorCode;
use quartermaster_backend::intake::storage::LocalBlobStore;
use quartermaster_backend::intake::IncomingFile;
use quartermaster_backend::models::{
    DraftLine, LineConfidence, MatchReason, Part, Provenance, SuggestedMatch, UploadKind,
};
use quartermaster_backend::pipeline::ReceivingPipeline;

fn test_db() -> (Arc<Database>, NamedTempFile) {
    let file = NamedTempFile::new().unwrap();
    let db = Arc::new(Database::new(file.path().to_str().unwrap()).unwrap());
    (db, file)
}

fn seed_part(db: &Database, yacht: Uuid, stock: f64) -> Part {
    let part = Part {
        id: Uuid::new_v4(),
        yacht_id: yacht,
        part_number: "MTU-OF-4568".into(),
        name: "MTU Oil Filter".into(),
        manufacturer: None,
        quantity_on_hand: stock,
        minimum_quantity: 0.0,
        bin_location: None,
    };
    db.seed_part(&part).unwrap();
    part
}

fn seed_verified_session(db: &Database, yacht: Uuid, actor: Uuid, part: &Part) -> Uuid {
    let session = db.create_session(yacht, actor).unwrap();
    db.insert_line(&DraftLine {
        id: Uuid::new_v4(),
        session_id: session.id,
        yacht_id: yacht,
        line_number: 1,
        quantity: 5.0,
        unit: "ea".into(),
        description: "MTU Oil Filter".into(),
        extracted_part_number: Some(part.part_number.clone()),
        unit_price: None,
        confidence: LineConfidence::High,
        provenance: Provenance::Regex,
        raw_text: "5 ea MTU Oil Filter MTU-OF-4568".into(),
        is_verified: true,
        verified_by: Some(actor),
        verified_at: Some(Utc::now()),
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
    session.id
}

#[test]
fn test_concurrent_commits_exactly_one_wins() {
    let (db, _file) = test_db();
    let yacht = Uuid::new_v4();
    let actor = Uuid::new_v4();
    let part = seed_part(&db, yacht, 0.0);
    let session_id = seed_verified_session(&db, yacht, actor, &part);

    let handles: Vec<_> = (0..2)
        .map(|n| {
            let db = db.clone();
            thread::spawn(move || {
                let engine = CommitEngine::new(&db);
                engine.commit(yacht, session_id, actor, &format!("committer {n}"), false)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let successes = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| {
            matches!(r, Err(e) if e.code == ErrorCode::SessionAlreadyCommitted)
        })
        .count();

    assert_eq!(successes, 1, "exactly one commit must win");
    assert_eq!(conflicts, 1, "the loser must see SESSION_ALREADY_COMMITTED");

    // Post-state: one event for the session, inventory applied once.
    let conn = db.open().unwrap();
    let events: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM receiving_events WHERE session_id = ?1",
            [session_id.to_string()],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(events, 1);
    let stock = db.get_part(yacht, part.id).unwrap().unwrap().quantity_on_hand;
    assert_eq!(stock, 5.0);
}

#[test]
fn test_concurrent_deductions_never_go_negative() {
    let (db, _file) = test_db();
    let yacht = Uuid::new_v4();
    let part = seed_part(&db, yacht, 10.0);

    // Three concurrent deductions of 5 against stock 10: two succeed.
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let db = db.clone();
            let part_id = part.id;
            thread::spawn(move || {
                let conn = db.open().unwrap();
                atomic_apply_delta(&conn, yacht, part_id, -5.0).unwrap()
            })
        })
        .collect();

    let results: Vec<Option<f64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let successes = results.iter().filter(|r| r.is_some()).count();
    assert_eq!(successes, 2);

    let stock = db.get_part(yacht, part.id).unwrap().unwrap().quantity_on_hand;
    assert_eq!(stock, 0.0);
}

#[test]
fn test_increment_then_decrement_restores_pre_state() {
    let (db, _file) = test_db();
    let yacht = Uuid::new_v4();
    let part = seed_part(&db, yacht, 7.0);
    let conn = db.open().unwrap();
    assert_eq!(atomic_apply_delta(&conn, yacht, part.id, 4.5).unwrap(), Some(11.5));
    assert_eq!(atomic_apply_delta(&conn, yacht, part.id, -4.5).unwrap(), Some(7.0));
}

fn sharp_png() -> Vec<u8> {
    use image::{GrayImage, Luma};
    let img = GrayImage::from_fn(800, 600, |x, y| {
        if (x + y) % 2 == 0 { Luma([10]) } else { Luma([200]) }
    });
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageLuma8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

#[tokio::test]
async fn test_duplicate_upload_is_noop_at_record_level() {
    let (db, _file) = test_db();
    let blob_dir = TempDir::new().unwrap();
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::from_env();
    config.temp_root = temp_dir.path().to_string_lossy().into_owned();
    let pipeline = ReceivingPipeline::new(
        Arc::new(config),
        db.clone(),
        Arc::new(LocalBlobStore::new(blob_dir.path())),
        None,
    );

    let yacht = Uuid::new_v4();
    let actor = Uuid::new_v4();
    let bytes = sharp_png();

    let first = pipeline
        .admit_files(yacht, actor, UploadKind::Receiving, vec![IncomingFile {
            file_name: "slip.png".into(),
            mime_type: "image/png".into(),
            bytes: bytes.clone(),
        }])
        .await
        .unwrap();
    assert!(!first[0].is_duplicate);
    let first_id = first[0].upload_id.unwrap();

    let second = pipeline
        .admit_files(yacht, actor, UploadKind::Receiving, vec![IncomingFile {
            file_name: "slip-again.png".into(),
            mime_type: "image/png".into(),
            bytes,
        }])
        .await
        .unwrap();
    assert!(second[0].is_duplicate);
    assert_eq!(second[0].upload_id.unwrap(), first_id);

    // Exactly one row for the tenant.
    let conn = db.open().unwrap();
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM uploads WHERE yacht_id = ?1",
            [yacht.to_string()],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn test_commit_then_override_flow() {
    let (db, _file) = test_db();
    let yacht = Uuid::new_v4();
    let actor = Uuid::new_v4();
    let part = seed_part(&db, yacht, 1.0);

    // Unverified session: commit blocked, then forced through.
    let session = db.create_session(yacht, actor).unwrap();
    db.insert_line(&DraftLine {
        id: Uuid::new_v4(),
        session_id: session.id,
        yacht_id: yacht,
        line_number: 1,
        quantity: 2.0,
        unit: "ea".into(),
        description: "MTU Oil Filter".into(),
        extracted_part_number: None,
        unit_price: None,
        confidence: LineConfidence::Medium,
        provenance: Provenance::Regex,
        raw_text: String::new(),
        is_verified: false,
        verified_by: None,
        verified_at: None,
        source_upload_id: None,
        suggested_part: Some(SuggestedMatch {
            part_id: part.id,
            part_number: part.part_number.clone(),
            part_name: part.name.clone(),
            manufacturer: None,
            confidence: 0.9,
            match_reason: MatchReason::FuzzyPartNumber,
            current_stock: 1.0,
            bin_location: None,
            alternatives: Vec::new(),
            shopping_list: None,
            recent_order: None,
        }),
        discrepancy: None,
    })
    .unwrap();

    let engine = CommitEngine::new(&db);
    let blocked = engine.commit(yacht, session.id, actor, "", false).unwrap_err();
    assert_eq!(blocked.code, ErrorCode::UnverifiedLines);

    let forced = engine.commit(yacht, session.id, actor, "override", true).unwrap();
    assert_eq!(forced.event.lines_committed, 1);
    assert_eq!(db.get_part(yacht, part.id).unwrap().unwrap().quantity_on_hand, 3.0);
}
