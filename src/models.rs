//! Domain entities shared across the pipeline stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a file claims to be at intake time; drives the MIME allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadKind {
    Receiving,
    ShippingLabel,
    Discrepancy,
    PartPhoto,
    Finance,
}

impl UploadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadKind::Receiving => "receiving",
            UploadKind::ShippingLabel => "shipping_label",
            UploadKind::Discrepancy => "discrepancy",
            UploadKind::PartPhoto => "part_photo",
            UploadKind::Finance => "finance",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "receiving" => Some(UploadKind::Receiving),
            "shipping_label" => Some(UploadKind::ShippingLabel),
            "discrepancy" => Some(UploadKind::Discrepancy),
            "part_photo" => Some(UploadKind::PartPhoto),
            "finance" => Some(UploadKind::Finance),
            _ => None,
        }
    }

    /// MIME allow-list per upload kind.
    pub fn allowed_mime_types(&self) -> &'static [&'static str] {
        match self {
            UploadKind::Receiving | UploadKind::ShippingLabel => {
                &["image/jpeg", "image/png", "image/heic", "application/pdf"]
            }
            UploadKind::Discrepancy => &["image/jpeg", "image/png", "image/heic"],
            UploadKind::PartPhoto => &["image/jpeg", "image/png"],
            UploadKind::Finance => &["application/pdf", "image/jpeg", "image/png"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Queued => "queued",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(ProcessingStatus::Queued),
            "processing" => Some(ProcessingStatus::Processing),
            "completed" => Some(ProcessingStatus::Completed),
            "failed" => Some(ProcessingStatus::Failed),
            _ => None,
        }
    }
}

/// Quality metrics captured at intake for image uploads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub blur: Option<f64>,
    pub glare: Option<f64>,
    pub contrast: Option<f64>,
    pub dqs: Option<f64>,
}

/// One accepted file, persisted by the intake gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: Uuid,
    pub yacht_id: Uuid,
    pub uploaded_by: Uuid,
    pub file_name: String,
    pub mime_type: String,
    pub file_size_bytes: u64,
    pub sha256: String,
    pub storage_path: String,
    pub upload_kind: UploadKind,
    pub processing_status: ProcessingStatus,
    pub quality: QualityMetadata,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    PackingList,
    Invoice,
    PurchaseOrder,
    WorkOrder,
    Unknown,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::PackingList => "packing_list",
            DocumentKind::Invoice => "invoice",
            DocumentKind::PurchaseOrder => "purchase_order",
            DocumentKind::WorkOrder => "work_order",
            DocumentKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentClassification {
    pub kind: DocumentKind,
    pub confidence: f64,
    pub matched_indicators: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineConfidence {
    High,
    Medium,
    Low,
}

impl LineConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineConfidence::High => "high",
            LineConfidence::Medium => "medium",
            LineConfidence::Low => "low",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "high" => LineConfidence::High,
            "low" => LineConfidence::Low,
            _ => LineConfidence::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Regex,
    Llm,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Regex => "regex",
            Provenance::Llm => "llm",
        }
    }
}

/// A structured line item before reconciliation attaches suggestions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedLine {
    pub line_number: u32,
    pub quantity: f64,
    pub unit: String,
    pub description: String,
    pub part_number: Option<String>,
    pub confidence: LineConfidence,
    pub provenance: Provenance,
    pub raw_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    ExactPartNumber,
    FuzzyPartNumber,
    FuzzyDescription,
    OnShoppingList,
    RecentOrder,
    UserOverride,
}

impl MatchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchReason::ExactPartNumber => "exact_part_number",
            MatchReason::FuzzyPartNumber => "fuzzy_part_number",
            MatchReason::FuzzyDescription => "fuzzy_description",
            MatchReason::OnShoppingList => "on_shopping_list",
            MatchReason::RecentOrder => "recent_order",
            MatchReason::UserOverride => "user_override",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlternativeMatch {
    pub part_id: Uuid,
    pub part_number: String,
    pub part_name: String,
    pub confidence: f64,
    pub match_reason: MatchReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShoppingStatus {
    Approved,
    Ordered,
}

impl ShoppingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShoppingStatus::Approved => "approved",
            ShoppingStatus::Ordered => "ordered",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "approved" => Some(ShoppingStatus::Approved),
            "ordered" => Some(ShoppingStatus::Ordered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShoppingListMatch {
    pub item_id: Uuid,
    pub quantity_requested: f64,
    pub quantity_approved: Option<f64>,
    pub status: ShoppingStatus,
    /// min(received / requested, 1.0), expressed in percent.
    pub fulfillment_percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentOrderMatch {
    pub order_id: Uuid,
    pub order_number: String,
    pub supplier: Option<String>,
    pub quantity_ordered: f64,
    pub days_since_order: i64,
}

/// The reconciliation verdict attached to a draft line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedMatch {
    pub part_id: Uuid,
    pub part_number: String,
    pub part_name: String,
    pub manufacturer: Option<String>,
    pub confidence: f64,
    pub match_reason: MatchReason,
    pub current_stock: f64,
    pub bin_location: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<AlternativeMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shopping_list: Option<ShoppingListMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_order: Option<RecentOrderMatch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancySeverity {
    High,
    Medium,
    Low,
}

impl DiscrepancySeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscrepancySeverity::High => "high",
            DiscrepancySeverity::Medium => "medium",
            DiscrepancySeverity::Low => "low",
        }
    }
}

/// Quantity mismatch between what was ordered and what arrived.
/// Negative shortage means overage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discrepancy {
    pub expected_quantity: f64,
    pub received_quantity: f64,
    pub shortage: f64,
    pub severity: DiscrepancySeverity,
}

/// A draft line awaiting verification inside a receiving session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftLine {
    pub id: Uuid,
    pub session_id: Uuid,
    pub yacht_id: Uuid,
    pub line_number: u32,
    pub quantity: f64,
    pub unit: String,
    pub description: String,
    pub extracted_part_number: Option<String>,
    pub unit_price: Option<f64>,
    pub confidence: LineConfidence,
    pub provenance: Provenance,
    pub raw_text: String,
    pub is_verified: bool,
    pub verified_by: Option<Uuid>,
    pub verified_at: Option<DateTime<Utc>>,
    pub source_upload_id: Option<Uuid>,
    pub suggested_part: Option<SuggestedMatch>,
    pub discrepancy: Option<Discrepancy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Draft,
    Committed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Draft => "draft",
            SessionStatus::Committed => "committed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(SessionStatus::Draft),
            "committed" => Some(SessionStatus::Committed),
            "cancelled" => Some(SessionStatus::Cancelled),
            _ => None,
        }
    }
}

/// Rollup of what processing did to a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingSummary {
    pub lines_extracted: u32,
    pub lines_verified: u32,
    pub llm_calls: u32,
    pub total_cost: f64,
    pub primary_method: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivingSession {
    pub id: Uuid,
    pub yacht_id: Uuid,
    pub session_number: String,
    pub status: SessionStatus,
    pub created_by: Uuid,
    pub summary: ProcessingSummary,
    pub event_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
    pub committed_by: Option<Uuid>,
}

/// Immutable record produced by committing a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivingEvent {
    pub id: Uuid,
    pub yacht_id: Uuid,
    pub session_id: Uuid,
    pub event_number: String,
    pub committed_by: Uuid,
    pub commitment_notes: String,
    pub lines_committed: u32,
    pub total_cost: Option<f64>,
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

/// Catalog part snapshot used by reconciliation and the commit engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    pub id: Uuid,
    pub yacht_id: Uuid,
    pub part_number: String,
    pub name: String,
    pub manufacturer: Option<String>,
    pub quantity_on_hand: f64,
    pub minimum_quantity: f64,
    pub bin_location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LowStockAlert {
    pub part_id: Uuid,
    pub part_number: String,
    pub current_quantity: f64,
    pub minimum_quantity: f64,
    pub shortage: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_kind_roundtrip() {
        for kind in [
            UploadKind::Receiving,
            UploadKind::ShippingLabel,
            UploadKind::Discrepancy,
            UploadKind::PartPhoto,
            UploadKind::Finance,
        ] {
            assert_eq!(UploadKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(UploadKind::from_str("bogus"), None);
    }

    #[test]
    fn test_mime_allow_lists() {
        assert!(UploadKind::Receiving.allowed_mime_types().contains(&"application/pdf"));
        assert!(!UploadKind::PartPhoto.allowed_mime_types().contains(&"application/pdf"));
        assert!(!UploadKind::Discrepancy.allowed_mime_types().contains(&"application/pdf"));
    }

    #[test]
    fn test_session_status_roundtrip() {
        assert_eq!(SessionStatus::from_str("draft"), Some(SessionStatus::Draft));
        assert_eq!(SessionStatus::from_str("committed"), Some(SessionStatus::Committed));
        assert_eq!(SessionStatus::from_str("void"), None);
    }
}
