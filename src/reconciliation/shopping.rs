//! Shopping-list fulfillment lookup.

use tracing::info;
use uuid::Uuid;

use crate::db::OrdersRepository;
use crate::error::PipelineError;
use crate::models::ShoppingListMatch;

/// Check whether a received part fulfills an open shopping-list request.
/// Only `approved` and `ordered` entries count; at most one (the latest) is
/// returned with its fulfillment percentage.
pub fn check_shopping_list_match(
    orders: &dyn OrdersRepository,
    yacht_id: Uuid,
    part_id: Uuid,
    received_quantity: f64,
) -> Result<Option<ShoppingListMatch>, PipelineError> {
    let Some(row) = orders.shopping_match(yacht_id, part_id)? else {
        return Ok(None);
    };

    let requested = row.quantity_approved.unwrap_or(row.quantity_requested);
    let fulfillment = if requested > 0.0 {
        (received_quantity / requested * 100.0).min(100.0)
    } else {
        0.0
    };

    info!(
        yacht_id = %yacht_id,
        part_id = %part_id,
        item_id = %row.item_id,
        fulfillment = format!("{fulfillment:.1}%"),
        "Shopping list match found"
    );

    Ok(Some(ShoppingListMatch {
        item_id: row.item_id,
        quantity_requested: row.quantity_requested,
        quantity_approved: row.quantity_approved,
        status: row.status,
        fulfillment_percentage: fulfillment,
    }))
}
