//! Quantity discrepancy detection between ordered and received.

use crate::models::{Discrepancy, DiscrepancySeverity};

/// Compare expected (ordered) and received quantities. Equal quantities are
/// no discrepancy; shortage is `expected - received`, negative for overage.
/// Severity follows the shortage ratio; an unexpected delivery
/// (expected = 0) is always high.
pub fn detect(expected: f64, received: f64) -> Option<Discrepancy> {
    if (expected - received).abs() < f64::EPSILON {
        return None;
    }

    let shortage = expected - received;
    let severity = if expected == 0.0 {
        DiscrepancySeverity::High
    } else {
        let ratio = (shortage / expected).abs();
        if ratio >= 0.5 {
            DiscrepancySeverity::High
        } else if ratio >= 0.2 {
            DiscrepancySeverity::Medium
        } else {
            DiscrepancySeverity::Low
        }
    };

    Some(Discrepancy {
        expected_quantity: expected,
        received_quantity: received,
        shortage,
        severity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_quantities_no_discrepancy() {
        assert!(detect(10.0, 10.0).is_none());
        assert!(detect(0.0, 0.0).is_none());
    }

    #[test]
    fn test_major_shortage_is_high() {
        let d = detect(10.0, 4.0).unwrap();
        assert_eq!(d.shortage, 6.0);
        assert_eq!(d.severity, DiscrepancySeverity::High);
    }

    #[test]
    fn test_minor_shortage_is_low() {
        let d = detect(10.0, 9.0).unwrap();
        assert_eq!(d.shortage, 1.0);
        assert_eq!(d.severity, DiscrepancySeverity::Low);
    }

    #[test]
    fn test_moderate_shortage_is_medium() {
        let d = detect(10.0, 7.0).unwrap();
        assert_eq!(d.severity, DiscrepancySeverity::Medium);
    }

    #[test]
    fn test_overage_negative_shortage() {
        let d = detect(10.0, 16.0).unwrap();
        assert_eq!(d.shortage, -6.0);
        assert_eq!(d.severity, DiscrepancySeverity::High);
    }

    #[test]
    fn test_unexpected_delivery_is_high() {
        let d = detect(0.0, 3.0).unwrap();
        assert_eq!(d.severity, DiscrepancySeverity::High);
        assert_eq!(d.shortage, -3.0);
    }

    #[test]
    fn test_boundary_ratios() {
        assert_eq!(detect(10.0, 5.0).unwrap().severity, DiscrepancySeverity::High);
        assert_eq!(detect(10.0, 8.0).unwrap().severity, DiscrepancySeverity::Medium);
        assert_eq!(detect(10.0, 8.5).unwrap().severity, DiscrepancySeverity::Low);
    }
}
