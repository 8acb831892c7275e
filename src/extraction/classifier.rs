//! Document classification over indicator pattern sets.

use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use crate::models::{DocumentClassification, DocumentKind};

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().map(|p| Regex::new(p).expect("invalid classifier pattern")).collect()
}

lazy_static! {
    static ref PACKING_LIST: Vec<Regex> = compile(&[
        r"(?i)packing\s+slip",
        r"(?i)packing\s+list",
        r"(?i)shipment\s+#",
        r"(?i)tracking\s*(?:number|#)?:?\s*1Z[A-Z0-9]{16}",
        r"(?i)tracking\s*(?:number|#)?:?\s*\d{12,}",
        r"(?i)ship\s+to",
        r"(?i)shipped\s+(?:on|date)",
        r"(?i)carrier:",
        r"(?i)items\s+shipped",
    ]);
    static ref INVOICE: Vec<Regex> = compile(&[
        r"(?i)invoice(?:\s+#)?",
        r"(?i)invoice\s+number",
        r"(?i)amount\s+due",
        r"(?i)due\s+date",
        r"(?i)bill\s+to",
        r"(?i)payment\s+terms",
        r"(?i)total\s+amount",
        r"(?i)subtotal",
        r"(?i)tax\s+amount",
        r"\$\d+,?\d*\.\d{2}",
    ]);
    static ref PURCHASE_ORDER: Vec<Regex> = compile(&[
        r"(?i)purchase\s+order",
        r"(?i)P\.?O\.?\s*#",
        r"(?i)vendor\s+(?:name|#)",
        r"(?i)requested\s+by",
        r"(?i)ship\s+via",
        r"(?i)required\s+date",
        r"(?i)deliver\s+to",
    ]);
    static ref WORK_ORDER: Vec<Regex> = compile(&[
        r"(?i)work\s+order",
        r"(?i)W\.?O\.?\s*#",
        r"(?i)task\s+description",
        r"(?i)assigned\s+to",
        r"(?i)equipment\s+(?:id|#)",
        r"(?i)priority\s*:",
        r"(?i)status\s*:",
        r"(?i)completed\s+by",
    ]);
}

/// Classify text into one of the four document kinds. Confidence scales with
/// the number of matching indicators: >=3 is 0.9, 2 is 0.75, 1 is 0.5.
pub fn classify(text: &str) -> DocumentClassification {
    if text.trim().len() < 10 {
        return DocumentClassification {
            kind: DocumentKind::Unknown,
            confidence: 0.0,
            matched_indicators: Vec::new(),
        };
    }

    let sets: [(DocumentKind, &Vec<Regex>); 4] = [
        (DocumentKind::PackingList, &PACKING_LIST),
        (DocumentKind::Invoice, &INVOICE),
        (DocumentKind::PurchaseOrder, &PURCHASE_ORDER),
        (DocumentKind::WorkOrder, &WORK_ORDER),
    ];

    let mut best = (DocumentKind::Unknown, 0usize);
    for (kind, patterns) in &sets {
        let matches = patterns.iter().filter(|p| p.is_match(text)).count();
        if matches > best.1 {
            best = (*kind, matches);
        }
    }

    let (kind, count) = best;
    let confidence = match count {
        0 => 0.0,
        1 => 0.5,
        2 => 0.75,
        _ => 0.9,
    };

    let matched_indicators = if count > 0 {
        sets.iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, patterns)| {
                patterns
                    .iter()
                    .filter_map(|p| p.find(text).map(|m| m.as_str().to_string()))
                    .collect()
            })
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    debug!(kind = kind.as_str(), confidence, matches = count, "Document classified");

    DocumentClassification {
        kind: if count == 0 { DocumentKind::Unknown } else { kind },
        confidence,
        matched_indicators,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packing_slip_high_confidence() {
        let text = "PACKING SLIP\nShip To: MY Excellence\nCarrier: UPS\n\
                    Tracking Number: 1Z999AA10123456784\n12 ea MTU Oil Filter";
        let result = classify(text);
        assert_eq!(result.kind, DocumentKind::PackingList);
        assert!((result.confidence - 0.9).abs() < f64::EPSILON);
        assert!(result.matched_indicators.len() >= 3);
    }

    #[test]
    fn test_invoice_detected() {
        let text = "INVOICE #4411\nBill To: Fleet Ops\nAmount Due: $1,234.56\nDue Date: 2026-09-01";
        let result = classify(text);
        assert_eq!(result.kind, DocumentKind::Invoice);
        assert!((result.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_single_indicator_low_confidence() {
        let result = classify("Purchase Order mentioned once in passing text");
        assert_eq!(result.kind, DocumentKind::PurchaseOrder);
        assert!((result.confidence - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unclassifiable() {
        let result = classify("the quick brown fox jumps over a lazy dog");
        assert_eq!(result.kind, DocumentKind::Unknown);
        assert_eq!(result.confidence, 0.0);
        assert!(result.matched_indicators.is_empty());
    }

    #[test]
    fn test_short_text_unknown() {
        assert_eq!(classify("  hi  ").kind, DocumentKind::Unknown);
    }
}
