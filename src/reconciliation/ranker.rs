//! Suggestion ranking: shopping-list and recent-order signals boost the top
//! fuzzy candidate, alternatives come from the remaining ones.

use tracing::info;

use crate::models::{
    AlternativeMatch, MatchReason, RecentOrderMatch, ShoppingListMatch, SuggestedMatch,
};
use crate::reconciliation::parts::MatchCandidate;

const ALTERNATIVE_MIN_CONFIDENCE: f64 = 0.6;
const MAX_ALTERNATIVES: usize = 3;

fn shopping_boost(shopping: Option<&ShoppingListMatch>) -> f64 {
    match shopping {
        None => 0.0,
        Some(m) if m.fulfillment_percentage >= 100.0 => 0.15,
        Some(m) if m.fulfillment_percentage >= 50.0 => 0.10,
        Some(_) => 0.05,
    }
}

fn order_boost(recent_orders: &[RecentOrderMatch]) -> f64 {
    match recent_orders.first() {
        None => 0.0,
        Some(o) if o.days_since_order <= 7 => 0.10,
        Some(o) if o.days_since_order <= 30 => 0.05,
        Some(_) => 0.02,
    }
}

/// Build the primary suggestion from ranked candidates plus signals.
/// Exact part-number matches are authoritative and never boosted.
pub fn rank_suggestions(
    candidates: &[MatchCandidate],
    shopping: Option<ShoppingListMatch>,
    recent_orders: Vec<RecentOrderMatch>,
) -> Option<SuggestedMatch> {
    let best = candidates.first()?;

    let mut confidence = best.confidence;
    let mut reason = best.reason;

    if reason != MatchReason::ExactPartNumber {
        let s_boost = shopping_boost(shopping.as_ref());
        let o_boost = order_boost(&recent_orders);
        confidence = (confidence + s_boost + o_boost).min(1.0);
        if s_boost > 0.0 {
            reason = MatchReason::OnShoppingList;
        }
    }

    let alternatives = alternative_suggestions(candidates);

    info!(
        part_number = %best.part.part_number,
        base_confidence = best.confidence,
        boosted_confidence = confidence,
        reason = reason.as_str(),
        alternatives = alternatives.len(),
        "Suggestion ranked"
    );

    Some(SuggestedMatch {
        part_id: best.part.id,
        part_number: best.part.part_number.clone(),
        part_name: best.part.name.clone(),
        manufacturer: best.part.manufacturer.clone(),
        confidence,
        match_reason: reason,
        current_stock: best.part.quantity_on_hand,
        bin_location: best.part.bin_location.clone(),
        alternatives,
        shopping_list: shopping,
        recent_order: recent_orders.into_iter().next(),
    })
}

/// Non-primary candidates with confidence >= 0.6, capped at three.
fn alternative_suggestions(candidates: &[MatchCandidate]) -> Vec<AlternativeMatch> {
    candidates
        .iter()
        .skip(1)
        .filter(|c| c.confidence >= ALTERNATIVE_MIN_CONFIDENCE)
        .take(MAX_ALTERNATIVES)
        .map(|c| AlternativeMatch {
            part_id: c.part.id,
            part_number: c.part.part_number.clone(),
            part_name: c.part.name.clone(),
            confidence: c.confidence,
            match_reason: c.reason,
        })
        .collect()
}
