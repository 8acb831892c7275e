//! Catalog part matching: exact normalized part number first, then fuzzy
//! part-number and description similarity.

use strsim::normalized_levenshtein;
use tracing::info;
use uuid::Uuid;

use crate::db::CatalogRepository;
use crate::error::PipelineError;
use crate::models::{MatchReason, Part};

pub const FUZZY_THRESHOLD: f64 = 70.0;
const STRATEGY_KEEP: usize = 10;
pub const MAX_MATCHES: usize = 5;

/// One candidate from the matcher, before ranking boosts.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub part: Part,
    /// Similarity in [0, 1]; 1.0 only for exact part-number matches.
    pub confidence: f64,
    pub reason: MatchReason,
}

/// Strip everything non-alphanumeric and uppercase. Idempotent.
pub fn normalize_part_number(part_number: &str) -> String {
    part_number
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

fn normalize_description(description: &str) -> String {
    description.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Ratio-based similarity on a 0-100 scale.
pub fn ratio(a: &str, b: &str) -> f64 {
    normalized_levenshtein(a, b) * 100.0
}

/// Word-order-insensitive similarity: sort tokens, then ratio.
pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    let sort = |s: &str| {
        let mut tokens: Vec<&str> = s.split_whitespace().collect();
        tokens.sort_unstable();
        tokens.join(" ")
    };
    ratio(&sort(a), &sort(b))
}

pub struct PartMatcher<'a> {
    catalog: &'a dyn CatalogRepository,
}

impl<'a> PartMatcher<'a> {
    pub fn new(catalog: &'a dyn CatalogRepository) -> Self {
        Self { catalog }
    }

    /// Find catalog matches for one extracted line. An exact part-number hit
    /// short-circuits with confidence 1.0; otherwise fuzzy part-number and
    /// description candidates are merged, deduplicated, and capped.
    pub fn find_matches(
        &self,
        yacht_id: Uuid,
        description: &str,
        part_number: Option<&str>,
    ) -> Result<Vec<MatchCandidate>, PipelineError> {
        let parts = self.catalog.list_parts(yacht_id)?;
        if parts.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(part_number) = part_number {
            let normalized = normalize_part_number(part_number);
            if !normalized.is_empty() {
                if let Some(part) =
                    parts.iter().find(|p| normalize_part_number(&p.part_number) == normalized)
                {
                    return Ok(vec![MatchCandidate {
                        part: part.clone(),
                        confidence: 1.0,
                        reason: MatchReason::ExactPartNumber,
                    }]);
                }
            }
        }

        let mut candidates: Vec<MatchCandidate> = Vec::new();

        if let Some(part_number) = part_number {
            let normalized = normalize_part_number(part_number);
            let mut by_number: Vec<MatchCandidate> = parts
                .iter()
                .filter_map(|p| {
                    let score = ratio(&normalized, &normalize_part_number(&p.part_number));
                    (score >= FUZZY_THRESHOLD).then(|| MatchCandidate {
                        part: p.clone(),
                        confidence: score / 100.0,
                        reason: MatchReason::FuzzyPartNumber,
                    })
                })
                .collect();
            sort_desc(&mut by_number);
            by_number.truncate(STRATEGY_KEEP);
            candidates.extend(by_number);
        }

        let normalized_desc = normalize_description(description);
        let mut by_description: Vec<MatchCandidate> = parts
            .iter()
            .filter_map(|p| {
                let score = token_sort_ratio(&normalized_desc, &normalize_description(&p.name));
                (score >= FUZZY_THRESHOLD).then(|| MatchCandidate {
                    part: p.clone(),
                    confidence: score / 100.0,
                    reason: MatchReason::FuzzyDescription,
                })
            })
            .collect();
        sort_desc(&mut by_description);
        by_description.truncate(STRATEGY_KEEP);
        candidates.extend(by_description);

        // Dedup by part id, first (higher-priority strategy) entry wins,
        // then order the merged set by confidence.
        let mut seen = std::collections::HashSet::new();
        candidates.retain(|c| seen.insert(c.part.id));
        sort_desc(&mut candidates);
        candidates.truncate(MAX_MATCHES);

        info!(
            yacht_id = %yacht_id,
            description,
            matches = candidates.len(),
            "Part matching complete"
        );
        Ok(candidates)
    }
}

fn sort_desc(candidates: &mut [MatchCandidate]) {
    candidates.sort_by(|a, b| {
        b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use tempfile::NamedTempFile;

    fn part(yacht_id: Uuid, number: &str, name: &str) -> Part {
        Part {
            id: Uuid::new_v4(),
            yacht_id,
            part_number: number.into(),
            name: name.into(),
            manufacturer: Some("MTU".into()),
            quantity_on_hand: 12.0,
            minimum_quantity: 2.0,
            bin_location: Some("A-12".into()),
        }
    }

    fn seeded_catalog() -> (Database, NamedTempFile, Uuid) {
        let file = NamedTempFile::new().unwrap();
        let db = Database::new(file.path().to_str().unwrap()).unwrap();
        let yacht = Uuid::new_v4();
        for (number, name) in [
            ("MTU-OF-4568", "MTU Oil Filter Element"),
            ("MTU-AF-1122", "MTU Air Filter"),
            ("CAT-FI-220", "Caterpillar Fuel Injector"),
            ("ISK-4432", "Impeller Service Kit"),
        ] {
            db.seed_part(&part(yacht, number, name)).unwrap();
        }
        (db, file, yacht)
    }

    #[test]
    fn test_normalize_part_number_idempotent() {
        for input in ["MTU-OF-4568", "mtu of 4568", "MTU_OF_4568", "m-t-u/of.4568", ""] {
            let once = normalize_part_number(input);
            assert_eq!(normalize_part_number(&once), once);
        }
        assert_eq!(normalize_part_number("MTU-OF-4568"), "MTUOF4568");
        assert_eq!(normalize_part_number("mtu of 4568"), "MTUOF4568");
    }

    #[test]
    fn test_exact_match_short_circuits() {
        let (db, _f, yacht) = seeded_catalog();
        let matcher = PartMatcher::new(&db);
        let matches =
            matcher.find_matches(yacht, "MTU Oil Filter", Some("mtu-of-4568")).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].confidence, 1.0);
        assert_eq!(matches[0].reason, MatchReason::ExactPartNumber);
        assert_eq!(matches[0].part.part_number, "MTU-OF-4568");
    }

    #[test]
    fn test_fuzzy_part_number() {
        let (db, _f, yacht) = seeded_catalog();
        let matcher = PartMatcher::new(&db);
        // One OCR-mangled digit.
        let matches = matcher.find_matches(yacht, "oil filter", Some("MTU-OF-4560")).unwrap();
        assert!(!matches.is_empty());
        assert_eq!(matches[0].part.part_number, "MTU-OF-4568");
        assert!(matches[0].confidence >= 0.7 && matches[0].confidence < 1.0);
    }

    #[test]
    fn test_description_word_order_insensitive() {
        let (db, _f, yacht) = seeded_catalog();
        let matcher = PartMatcher::new(&db);
        let matches = matcher.find_matches(yacht, "Service Kit Impeller", None).unwrap();
        assert!(!matches.is_empty());
        assert_eq!(matches[0].part.part_number, "ISK-4432");
        assert_eq!(matches[0].reason, MatchReason::FuzzyDescription);
    }

    #[test]
    fn test_no_match_below_threshold() {
        let (db, _f, yacht) = seeded_catalog();
        let matcher = PartMatcher::new(&db);
        let matches = matcher.find_matches(yacht, "Galley Refrigerator Door Seal", None).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn test_tenant_isolation() {
        let (db, _f, _yacht) = seeded_catalog();
        let matcher = PartMatcher::new(&db);
        let other_tenant = Uuid::new_v4();
        let matches =
            matcher.find_matches(other_tenant, "MTU Oil Filter", Some("MTU-OF-4568")).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn test_token_sort_ratio_symmetry() {
        let a = token_sort_ratio("impeller service kit", "service kit impeller");
        assert!((a - 100.0).abs() < 1e-9);
    }
}
