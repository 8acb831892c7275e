//! Purchase-order matching: recent PO lines for a part, and order-number
//! resolution for numbers the entity extractor pulled off the slip.

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::db::{OrderRow, OrdersRepository};
use crate::error::PipelineError;
use crate::models::RecentOrderMatch;
use crate::reconciliation::parts::ratio;

pub const RECENT_ORDER_WINDOW_DAYS: i64 = 90;
const ORDER_NUMBER_FUZZY_THRESHOLD: f64 = 80.0;

/// Recent purchase orders containing this part, newest first.
pub fn find_recent_orders(
    orders: &dyn OrdersRepository,
    yacht_id: Uuid,
    part_id: Uuid,
) -> Result<Vec<RecentOrderMatch>, PipelineError> {
    let rows = orders.recent_po_lines_for_part(yacht_id, part_id, RECENT_ORDER_WINDOW_DAYS)?;
    let now = Utc::now();
    let matches = rows
        .into_iter()
        .map(|row| RecentOrderMatch {
            order_id: row.order_id,
            order_number: row.order_number,
            supplier: row.supplier,
            quantity_ordered: row.quantity,
            days_since_order: (now - row.order_date).num_days(),
        })
        .collect::<Vec<_>>();

    if !matches.is_empty() {
        info!(yacht_id = %yacht_id, part_id = %part_id, count = matches.len(), "Recent orders found");
    }
    Ok(matches)
}

/// Resolve an extracted order number: exact `(tenant, order_number)` first,
/// then a fuzzy scan at >= 0.80 similarity for OCR-damaged numbers.
pub fn find_order_by_number(
    orders: &dyn OrdersRepository,
    yacht_id: Uuid,
    order_number: &str,
) -> Result<Option<OrderRow>, PipelineError> {
    if let Some(order) = orders.find_order(yacht_id, order_number)? {
        return Ok(Some(order));
    }

    let needle = order_number.to_uppercase();
    let mut best: Option<(f64, OrderRow)> = None;
    for candidate in orders.list_order_numbers(yacht_id)? {
        let score = ratio(&needle, &candidate.order_number.to_uppercase());
        if score >= ORDER_NUMBER_FUZZY_THRESHOLD
            && best.as_ref().map(|(s, _)| score > *s).unwrap_or(true)
        {
            best = Some((score, candidate));
        }
    }

    if let Some((score, order)) = best {
        info!(
            yacht_id = %yacht_id,
            extracted = order_number,
            matched = %order.order_number,
            score,
            "Order number resolved by fuzzy match"
        );
        return Ok(Some(order));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::Part;
    use chrono::Duration;
    use tempfile::NamedTempFile;

    fn fixture() -> (Database, NamedTempFile, Uuid, Uuid) {
        let file = NamedTempFile::new().unwrap();
        let db = Database::new(file.path().to_str().unwrap()).unwrap();
        let yacht = Uuid::new_v4();
        let part = Part {
            id: Uuid::new_v4(),
            yacht_id: yacht,
            part_number: "MTU-OF-4568".into(),
            name: "MTU Oil Filter".into(),
            manufacturer: None,
            quantity_on_hand: 0.0,
            minimum_quantity: 0.0,
            bin_location: None,
        };
        db.seed_part(&part).unwrap();
        (db, file, yacht, part.id)
    }

    #[test]
    fn test_recent_orders_within_window() {
        let (db, _f, yacht, part_id) = fixture();
        db.seed_purchase_order(
            yacht,
            "ORD-2026-031",
            Some("MTU Parts Direct"),
            Utc::now() - Duration::days(5),
            &[(part_id, 12.0)],
        )
        .unwrap();
        db.seed_purchase_order(
            yacht,
            "ORD-2025-090",
            None,
            Utc::now() - Duration::days(200),
            &[(part_id, 4.0)],
        )
        .unwrap();

        let matches = find_recent_orders(&db, yacht, part_id).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].order_number, "ORD-2026-031");
        assert_eq!(matches[0].days_since_order, 5);
        assert_eq!(matches[0].quantity_ordered, 12.0);
    }

    #[test]
    fn test_exact_order_number_lookup() {
        let (db, _f, yacht, part_id) = fixture();
        db.seed_purchase_order(yacht, "ORD-2024-042", None, Utc::now(), &[(part_id, 1.0)])
            .unwrap();

        let found = find_order_by_number(&db, yacht, "ORD-2024-042").unwrap().unwrap();
        assert_eq!(found.order_number, "ORD-2024-042");
    }

    #[test]
    fn test_fuzzy_order_number_fallback() {
        let (db, _f, yacht, part_id) = fixture();
        db.seed_purchase_order(yacht, "ORD-2024-042", None, Utc::now(), &[(part_id, 1.0)])
            .unwrap();

        // One OCR-swapped character still resolves.
        let found = find_order_by_number(&db, yacht, "ORD-2024-O42").unwrap().unwrap();
        assert_eq!(found.order_number, "ORD-2024-042");

        // A completely different number does not.
        assert!(find_order_by_number(&db, yacht, "ZZZ-9999-999").unwrap().is_none());
    }
}
