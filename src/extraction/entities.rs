//! Entity extraction for packing slips: order number, tracking number, and
//! quick line items.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

lazy_static! {
    static ref ORDER_NUMBER_PATTERNS: Vec<Regex> = vec![
        // ORD-YYYY-NNN with an explicit label
        Regex::new(r"(?i)order\s+number\s*:?\s*(ORD-\d{4}-\d{3})").unwrap(),
        Regex::new(r"(?i)order\s*(?:number|#)?:?\s*(ORD-\d{4}-\d{3})").unwrap(),
        // Generic AA(A)(A)-NNNNN(N)
        Regex::new(r"(?i)order\s+number\s*:?\s*([A-Z]{2,4}-\d{4,6})").unwrap(),
        Regex::new(r"(?i)order\s*(?:number|#)?:?\s*([A-Z]{2,4}-\d{4,6})").unwrap(),
        // Bare numeric, at least six digits
        Regex::new(r"(?i)order\s*(?:number|#)?:?\s*(\d{6,})").unwrap(),
    ];
    static ref TRACKING_PATTERNS: Vec<Regex> = vec![
        // UPS
        Regex::new(r"(?i)tracking\s*(?:number|#)?:?\s*(1Z[A-Z0-9]{16})").unwrap(),
        Regex::new(r"(?i)tracking\s*(?:number|#)?:?\s*(\d{12,22})").unwrap(),
        Regex::new(r"(?i)tracking\s*(?:number|#)?:?\s*([A-Z0-9]{10,})").unwrap(),
    ];
    static ref LINE_ITEM: Regex =
        Regex::new(r"(?i)^\s*(\d+)\s+(?:ea|each|pcs?|units?)\s+(.+?)\s*$").unwrap();
}

#[derive(Debug, Clone, Serialize)]
pub struct QuickLineItem {
    pub quantity: u32,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PackingSlipEntities {
    pub order_number: Option<String>,
    pub tracking_number: Option<String>,
    pub line_items: Vec<QuickLineItem>,
    pub extraction_confidence: f64,
}

/// Extract order/tracking identifiers and simple line items from packing
/// slip text. Confidence: 0.35 order + 0.35 tracking + 0.20 any items +
/// 0.10 bonus for more than one item, capped at 1.0.
pub fn extract_packing_slip_entities(text: &str) -> PackingSlipEntities {
    if text.is_empty() {
        return PackingSlipEntities::default();
    }

    let order_number = first_capture(&ORDER_NUMBER_PATTERNS, text);
    let tracking_number = first_capture(&TRACKING_PATTERNS, text);

    let mut line_items = Vec::new();
    for line in text.lines() {
        if let Some(caps) = LINE_ITEM.captures(line) {
            let quantity: u32 = caps[1].parse().unwrap_or(0);
            let description = caps[2].trim().to_string();
            if description.len() > 3 {
                line_items.push(QuickLineItem { quantity, description });
            }
        }
    }

    let mut confidence: f64 = 0.0;
    if order_number.is_some() {
        confidence += 0.35;
    }
    if tracking_number.is_some() {
        confidence += 0.35;
    }
    if !line_items.is_empty() {
        confidence += 0.20;
        if line_items.len() > 1 {
            confidence += 0.10;
        }
    }

    debug!(
        order = order_number.as_deref().unwrap_or("-"),
        tracking = tracking_number.as_deref().unwrap_or("-"),
        items = line_items.len(),
        confidence,
        "Packing slip entities extracted"
    );

    PackingSlipEntities {
        order_number,
        tracking_number,
        line_items,
        extraction_confidence: confidence.min(1.0),
    }
}

fn first_capture(patterns: &[Regex], text: &str) -> Option<String> {
    patterns
        .iter()
        .find_map(|p| p.captures(text).map(|c| c[1].trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_slip_extracts_everything() {
        let text = "PACKING SLIP\n\
                    Order Number: ORD-2024-042\n\
                    Tracking Number: 1Z999AA10123456784\n\
                    5 ea Coolant Hose Clamp\n\
                    2 pcs Impeller Kit\n";
        let entities = extract_packing_slip_entities(text);
        assert_eq!(entities.order_number.as_deref(), Some("ORD-2024-042"));
        assert_eq!(entities.tracking_number.as_deref(), Some("1Z999AA10123456784"));
        assert_eq!(entities.line_items.len(), 2);
        assert_eq!(entities.line_items[0].quantity, 5);
        assert!((entities.extraction_confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_generic_order_formats() {
        let generic = extract_packing_slip_entities("Order #: ABC-12345");
        assert_eq!(generic.order_number.as_deref(), Some("ABC-12345"));

        let numeric = extract_packing_slip_entities("order 8812345");
        assert_eq!(numeric.order_number.as_deref(), Some("8812345"));
    }

    #[test]
    fn test_numeric_tracking() {
        let entities = extract_packing_slip_entities("Tracking #: 940011189922334455");
        assert_eq!(entities.tracking_number.as_deref(), Some("940011189922334455"));
        assert!((entities.extraction_confidence - 0.35).abs() < f64::EPSILON);
    }

    #[test]
    fn test_single_item_no_bonus() {
        let entities = extract_packing_slip_entities("3 ea Fuel Filter Element");
        assert_eq!(entities.line_items.len(), 1);
        assert!((entities.extraction_confidence - 0.20).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_text() {
        let entities = extract_packing_slip_entities("");
        assert!(entities.order_number.is_none());
        assert_eq!(entities.extraction_confidence, 0.0);
    }
}
