//! Repository contracts and the SQLite store behind them.
//!
//! The store keeps only a path and opens a connection per call; the commit
//! engine opens its own connection and runs every commit step inside one
//! transaction via the row-level helpers in [`rows`]. Tenant isolation is
//! structural: every query is parameterized by `yacht_id`.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{
    DraftLine, Part, ProcessingStatus, ProcessingSummary, ReceivingEvent, ReceivingSession,
    SessionStatus, ShoppingStatus, UploadRecord,
};

pub mod rows;

/// Upload-record persistence consumed by the intake gate.
pub trait UploadRepository: Send + Sync {
    fn insert(&self, upload: &UploadRecord) -> Result<UploadRecord, PipelineError>;
    fn find_by_tenant_sha(
        &self,
        yacht_id: Uuid,
        sha256: &str,
    ) -> Result<Option<UploadRecord>, PipelineError>;
    fn count_since(
        &self,
        yacht_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, PipelineError>;
    fn get(&self, yacht_id: Uuid, id: Uuid) -> Result<Option<UploadRecord>, PipelineError>;
    fn update_status(
        &self,
        yacht_id: Uuid,
        id: Uuid,
        status: ProcessingStatus,
    ) -> Result<(), PipelineError>;
}

/// Catalog access consumed by reconciliation and the commit engine.
pub trait CatalogRepository: Send + Sync {
    fn list_parts(&self, yacht_id: Uuid) -> Result<Vec<Part>, PipelineError>;
    fn get_part(&self, yacht_id: Uuid, part_id: Uuid) -> Result<Option<Part>, PipelineError>;
}

/// Shopping-list and purchase-order reads consumed by reconciliation.
pub trait OrdersRepository: Send + Sync {
    fn shopping_match(
        &self,
        yacht_id: Uuid,
        part_id: Uuid,
    ) -> Result<Option<ShoppingRow>, PipelineError>;
    fn recent_po_lines_for_part(
        &self,
        yacht_id: Uuid,
        part_id: Uuid,
        days: i64,
    ) -> Result<Vec<PoLineRow>, PipelineError>;
    fn find_order(
        &self,
        yacht_id: Uuid,
        order_number: &str,
    ) -> Result<Option<OrderRow>, PipelineError>;
    fn list_order_numbers(&self, yacht_id: Uuid) -> Result<Vec<OrderRow>, PipelineError>;
}

/// Session and draft-line persistence consumed by the orchestrator.
pub trait SessionRepository: Send + Sync {
    fn create_session(&self, yacht_id: Uuid, created_by: Uuid)
        -> Result<ReceivingSession, PipelineError>;
    fn get_session(
        &self,
        yacht_id: Uuid,
        session_id: Uuid,
    ) -> Result<Option<ReceivingSession>, PipelineError>;
    fn insert_line(&self, line: &DraftLine) -> Result<(), PipelineError>;
    fn list_lines(&self, yacht_id: Uuid, session_id: Uuid)
        -> Result<Vec<DraftLine>, PipelineError>;
    fn update_line_verified(
        &self,
        yacht_id: Uuid,
        session_id: Uuid,
        line_id: Uuid,
        actor: Uuid,
    ) -> Result<bool, PipelineError>;
    fn update_summary(
        &self,
        yacht_id: Uuid,
        session_id: Uuid,
        summary: &ProcessingSummary,
    ) -> Result<(), PipelineError>;
}

#[derive(Debug, Clone)]
pub struct ShoppingRow {
    pub item_id: Uuid,
    pub quantity_requested: f64,
    pub quantity_approved: Option<f64>,
    pub status: ShoppingStatus,
}

#[derive(Debug, Clone)]
pub struct PoLineRow {
    pub order_id: Uuid,
    pub order_number: String,
    pub supplier: Option<String>,
    pub quantity: f64,
    pub order_date: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OrderRow {
    pub order_id: Uuid,
    pub order_number: String,
    pub supplier: Option<String>,
    pub order_date: DateTime<Utc>,
    pub status: String,
}

/// SQLite-backed store for every repository contract.
pub struct Database {
    db_path: String,
}

impl Database {
    pub fn new(db_path: &str) -> Result<Self> {
        let db = Self { db_path: db_path.to_string() };
        db.init_schema()?;
        Ok(db)
    }

    /// Open a fresh connection. Callers that need multi-statement atomicity
    /// (the commit engine) start a transaction on it.
    pub fn open(&self) -> Result<Connection, PipelineError> {
        let conn = Connection::open(&self.db_path)
            .map_err(|e| PipelineError::internal(format!("failed to open database: {e}")))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = Connection::open(&self.db_path).context("failed to open database")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS uploads (
                id TEXT PRIMARY KEY,
                yacht_id TEXT NOT NULL,
                uploaded_by TEXT NOT NULL,
                file_name TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                file_size_bytes INTEGER NOT NULL,
                sha256 TEXT NOT NULL,
                storage_path TEXT NOT NULL,
                upload_kind TEXT NOT NULL,
                processing_status TEXT NOT NULL,
                quality_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_uploads_tenant_sha
                ON uploads (yacht_id, sha256);

            CREATE TABLE IF NOT EXISTS parts (
                id TEXT PRIMARY KEY,
                yacht_id TEXT NOT NULL,
                part_number TEXT NOT NULL,
                name TEXT NOT NULL,
                manufacturer TEXT,
                quantity_on_hand REAL NOT NULL DEFAULT 0,
                minimum_quantity REAL NOT NULL DEFAULT 0,
                bin_location TEXT,
                version INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_parts_tenant ON parts (yacht_id);

            CREATE TABLE IF NOT EXISTS shopping_list (
                item_id TEXT PRIMARY KEY,
                yacht_id TEXT NOT NULL,
                part_id TEXT NOT NULL,
                quantity_requested REAL NOT NULL,
                quantity_approved REAL,
                status TEXT NOT NULL,
                requested_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS purchase_orders (
                order_id TEXT PRIMARY KEY,
                yacht_id TEXT NOT NULL,
                order_number TEXT NOT NULL,
                supplier TEXT,
                order_date TEXT NOT NULL,
                status TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS purchase_order_items (
                order_id TEXT NOT NULL,
                part_id TEXT NOT NULL,
                quantity REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS receiving_sessions (
                id TEXT PRIMARY KEY,
                yacht_id TEXT NOT NULL,
                session_number TEXT NOT NULL,
                status TEXT NOT NULL,
                created_by TEXT NOT NULL,
                summary_json TEXT NOT NULL,
                event_id TEXT,
                created_at TEXT NOT NULL,
                committed_at TEXT,
                committed_by TEXT
            );

            CREATE TABLE IF NOT EXISTS draft_lines (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                yacht_id TEXT NOT NULL,
                line_number INTEGER NOT NULL,
                quantity REAL NOT NULL,
                unit TEXT NOT NULL,
                description TEXT NOT NULL,
                extracted_part_number TEXT,
                unit_price REAL,
                confidence TEXT NOT NULL,
                provenance TEXT NOT NULL,
                raw_text TEXT NOT NULL,
                is_verified INTEGER NOT NULL DEFAULT 0,
                verified_by TEXT,
                verified_at TEXT,
                source_upload_id TEXT,
                suggested_part_json TEXT,
                discrepancy_json TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_draft_lines_session
                ON draft_lines (session_id, yacht_id);

            CREATE TABLE IF NOT EXISTS receiving_events (
                id TEXT PRIMARY KEY,
                yacht_id TEXT NOT NULL,
                session_id TEXT NOT NULL UNIQUE,
                event_number TEXT NOT NULL,
                committed_by TEXT NOT NULL,
                commitment_notes TEXT NOT NULL,
                lines_committed INTEGER NOT NULL,
                total_cost REAL,
                signature TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS inventory_transactions (
                id TEXT PRIMARY KEY,
                yacht_id TEXT NOT NULL,
                part_id TEXT NOT NULL,
                quantity REAL NOT NULL,
                transaction_kind TEXT NOT NULL,
                reference_id TEXT,
                reference_kind TEXT,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS finance_transactions (
                id TEXT PRIMARY KEY,
                yacht_id TEXT NOT NULL,
                reference_id TEXT NOT NULL,
                reference_kind TEXT NOT NULL,
                transaction_kind TEXT NOT NULL,
                category TEXT NOT NULL,
                amount REAL NOT NULL,
                currency TEXT NOT NULL,
                description TEXT NOT NULL,
                signature TEXT NOT NULL,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id TEXT PRIMARY KEY,
                yacht_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                action TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                old_values TEXT NOT NULL,
                new_values TEXT NOT NULL,
                signature TEXT NOT NULL,
                created_at TEXT NOT NULL
            );",
        )
        .context("failed to initialize schema")?;

        info!(path = %self.db_path, "📦 Database schema ready");
        Ok(())
    }

    /// Test/seed helper: insert a catalog part as-is.
    pub fn seed_part(&self, part: &Part) -> Result<(), PipelineError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO parts (id, yacht_id, part_number, name, manufacturer,
                quantity_on_hand, minimum_quantity, bin_location, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
            params![
                part.id.to_string(),
                part.yacht_id.to_string(),
                part.part_number,
                part.name,
                part.manufacturer,
                part.quantity_on_hand,
                part.minimum_quantity,
                part.bin_location,
            ],
        )?;
        Ok(())
    }

    pub fn seed_shopping_item(
        &self,
        yacht_id: Uuid,
        part_id: Uuid,
        quantity_requested: f64,
        quantity_approved: Option<f64>,
        status: ShoppingStatus,
    ) -> Result<Uuid, PipelineError> {
        let conn = self.open()?;
        let item_id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO shopping_list
                (item_id, yacht_id, part_id, quantity_requested, quantity_approved, status, requested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                item_id.to_string(),
                yacht_id.to_string(),
                part_id.to_string(),
                quantity_requested,
                quantity_approved,
                status.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(item_id)
    }

    pub fn seed_purchase_order(
        &self,
        yacht_id: Uuid,
        order_number: &str,
        supplier: Option<&str>,
        order_date: DateTime<Utc>,
        lines: &[(Uuid, f64)],
    ) -> Result<Uuid, PipelineError> {
        let conn = self.open()?;
        let order_id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO purchase_orders (order_id, yacht_id, order_number, supplier, order_date, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'ordered')",
            params![
                order_id.to_string(),
                yacht_id.to_string(),
                order_number,
                supplier,
                order_date.to_rfc3339(),
            ],
        )?;
        for (part_id, quantity) in lines {
            conn.execute(
                "INSERT INTO purchase_order_items (order_id, part_id, quantity) VALUES (?1, ?2, ?3)",
                params![order_id.to_string(), part_id.to_string(), quantity],
            )?;
        }
        Ok(order_id)
    }
}

impl UploadRepository for Database {
    fn insert(&self, upload: &UploadRecord) -> Result<UploadRecord, PipelineError> {
        let conn = self.open()?;
        rows::insert_upload(&conn, upload)
    }

    fn find_by_tenant_sha(
        &self,
        yacht_id: Uuid,
        sha256: &str,
    ) -> Result<Option<UploadRecord>, PipelineError> {
        let conn = self.open()?;
        rows::find_upload_by_sha(&conn, yacht_id, sha256)
    }

    fn count_since(&self, yacht_id: Uuid, since: DateTime<Utc>) -> Result<i64, PipelineError> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM uploads WHERE yacht_id = ?1 AND created_at >= ?2",
            params![yacht_id.to_string(), since.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn get(&self, yacht_id: Uuid, id: Uuid) -> Result<Option<UploadRecord>, PipelineError> {
        let conn = self.open()?;
        rows::get_upload(&conn, yacht_id, id)
    }

    fn update_status(
        &self,
        yacht_id: Uuid,
        id: Uuid,
        status: ProcessingStatus,
    ) -> Result<(), PipelineError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE uploads SET processing_status = ?1 WHERE id = ?2 AND yacht_id = ?3",
            params![status.as_str(), id.to_string(), yacht_id.to_string()],
        )?;
        Ok(())
    }
}

impl CatalogRepository for Database {
    fn list_parts(&self, yacht_id: Uuid) -> Result<Vec<Part>, PipelineError> {
        let conn = self.open()?;
        rows::list_parts(&conn, yacht_id)
    }

    fn get_part(&self, yacht_id: Uuid, part_id: Uuid) -> Result<Option<Part>, PipelineError> {
        let conn = self.open()?;
        rows::get_part(&conn, yacht_id, part_id)
    }
}

impl OrdersRepository for Database {
    fn shopping_match(
        &self,
        yacht_id: Uuid,
        part_id: Uuid,
    ) -> Result<Option<ShoppingRow>, PipelineError> {
        let conn = self.open()?;
        conn.query_row(
            "SELECT item_id, quantity_requested, quantity_approved, status
             FROM shopping_list
             WHERE yacht_id = ?1 AND part_id = ?2 AND status IN ('approved', 'ordered')
             ORDER BY requested_at DESC LIMIT 1",
            params![yacht_id.to_string(), part_id.to_string()],
            |row| {
                Ok(ShoppingRow {
                    item_id: rows::uuid_col(row, 0)?,
                    quantity_requested: row.get(1)?,
                    quantity_approved: row.get(2)?,
                    status: ShoppingStatus::from_str(&row.get::<_, String>(3)?)
                        .unwrap_or(ShoppingStatus::Approved),
                })
            },
        )
        .optional()
        .map_err(PipelineError::from)
    }

    fn recent_po_lines_for_part(
        &self,
        yacht_id: Uuid,
        part_id: Uuid,
        days: i64,
    ) -> Result<Vec<PoLineRow>, PipelineError> {
        let conn = self.open()?;
        let cutoff = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT o.order_id, o.order_number, o.supplier, i.quantity, o.order_date
             FROM purchase_order_items i
             JOIN purchase_orders o ON o.order_id = i.order_id
             WHERE o.yacht_id = ?1 AND i.part_id = ?2 AND o.order_date >= ?3
               AND o.status IN ('ordered', 'in_transit', 'partially_received')
             ORDER BY o.order_date DESC LIMIT 5",
        )?;
        let lines = stmt
            .query_map(params![yacht_id.to_string(), part_id.to_string(), cutoff], |row| {
                Ok(PoLineRow {
                    order_id: rows::uuid_col(row, 0)?,
                    order_number: row.get(1)?,
                    supplier: row.get(2)?,
                    quantity: row.get(3)?,
                    order_date: rows::time_col(row, 4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(lines)
    }

    fn find_order(
        &self,
        yacht_id: Uuid,
        order_number: &str,
    ) -> Result<Option<OrderRow>, PipelineError> {
        let conn = self.open()?;
        conn.query_row(
            "SELECT order_id, order_number, supplier, order_date, status
             FROM purchase_orders WHERE yacht_id = ?1 AND order_number = ?2 LIMIT 1",
            params![yacht_id.to_string(), order_number],
            rows::order_row,
        )
        .optional()
        .map_err(PipelineError::from)
    }

    fn list_order_numbers(&self, yacht_id: Uuid) -> Result<Vec<OrderRow>, PipelineError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT order_id, order_number, supplier, order_date, status
             FROM purchase_orders WHERE yacht_id = ?1",
        )?;
        let orders = stmt
            .query_map(params![yacht_id.to_string()], rows::order_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(orders)
    }
}

impl SessionRepository for Database {
    fn create_session(
        &self,
        yacht_id: Uuid,
        created_by: Uuid,
    ) -> Result<ReceivingSession, PipelineError> {
        let mut conn = self.open()?;
        // Transactional so the per-tenant yearly sequence stays monotonic
        // under concurrent session creation.
        let tx = conn.transaction().map_err(PipelineError::from)?;
        let year = Utc::now().year();
        let seq: i64 = tx.query_row(
            "SELECT COUNT(*) FROM receiving_sessions
             WHERE yacht_id = ?1 AND session_number LIKE ?2",
            params![yacht_id.to_string(), format!("RCV-{year}-%")],
            |row| row.get(0),
        )?;
        let session = ReceivingSession {
            id: Uuid::new_v4(),
            yacht_id,
            session_number: format!("RCV-{year}-{:03}", seq + 1),
            status: SessionStatus::Draft,
            created_by,
            summary: ProcessingSummary::default(),
            event_id: None,
            created_at: Utc::now(),
            committed_at: None,
            committed_by: None,
        };
        tx.execute(
            "INSERT INTO receiving_sessions
                (id, yacht_id, session_number, status, created_by, summary_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session.id.to_string(),
                session.yacht_id.to_string(),
                session.session_number,
                session.status.as_str(),
                session.created_by.to_string(),
                serde_json::to_string(&session.summary).unwrap_or_default(),
                session.created_at.to_rfc3339(),
            ],
        )?;
        tx.commit().map_err(PipelineError::from)?;
        Ok(session)
    }

    fn get_session(
        &self,
        yacht_id: Uuid,
        session_id: Uuid,
    ) -> Result<Option<ReceivingSession>, PipelineError> {
        let conn = self.open()?;
        rows::get_session(&conn, yacht_id, session_id)
    }

    fn insert_line(&self, line: &DraftLine) -> Result<(), PipelineError> {
        let conn = self.open()?;
        rows::insert_draft_line(&conn, line)
    }

    fn list_lines(
        &self,
        yacht_id: Uuid,
        session_id: Uuid,
    ) -> Result<Vec<DraftLine>, PipelineError> {
        let conn = self.open()?;
        rows::list_draft_lines(&conn, yacht_id, session_id)
    }

    fn update_line_verified(
        &self,
        yacht_id: Uuid,
        session_id: Uuid,
        line_id: Uuid,
        actor: Uuid,
    ) -> Result<bool, PipelineError> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE draft_lines SET is_verified = 1, verified_by = ?1, verified_at = ?2
             WHERE id = ?3 AND session_id = ?4 AND yacht_id = ?5",
            params![
                actor.to_string(),
                Utc::now().to_rfc3339(),
                line_id.to_string(),
                session_id.to_string(),
                yacht_id.to_string(),
            ],
        )?;
        Ok(affected > 0)
    }

    fn update_summary(
        &self,
        yacht_id: Uuid,
        session_id: Uuid,
        summary: &ProcessingSummary,
    ) -> Result<(), PipelineError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE receiving_sessions SET summary_json = ?1 WHERE id = ?2 AND yacht_id = ?3",
            params![
                serde_json::to_string(summary).unwrap_or_default(),
                session_id.to_string(),
                yacht_id.to_string(),
            ],
        )?;
        Ok(())
    }
}

impl Database {
    pub fn get_event(
        &self,
        yacht_id: Uuid,
        event_id: Uuid,
    ) -> Result<Option<ReceivingEvent>, PipelineError> {
        let conn = self.open()?;
        rows::get_event(&conn, yacht_id, event_id)
    }
}

// Re-exported so call sites don't need to reach into rows for the common case.
pub use rows::atomic_apply_delta;
