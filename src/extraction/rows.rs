//! Deterministic row parsing: an ordered family of regex patterns turns OCR
//! text lines into structured line items at zero LLM cost.

use lazy_static::lazy_static;
use regex::Regex;
use tracing::info;

use crate::models::{ExtractedLine, LineConfidence, Provenance};

const UNIT_ALTERNATION: &str = "ea|box|case|pcs|lbs|kg|g|ft|m|gal|L|each";
const MIN_DESCRIPTION_LEN: usize = 5;
const MAX_DESCRIPTION_LEN: usize = 500;

struct RowPattern {
    name: &'static str,
    regex: Regex,
    // 1-based capture indices; 0 means "not captured by this pattern".
    quantity: usize,
    unit: usize,
    description: usize,
    part_number: usize,
}

lazy_static! {
    static ref PATTERNS: Vec<RowPattern> = vec![
        // "12 ea MTU Oil Filter MTU-OF-4568"
        RowPattern {
            name: "qty_unit_desc_part",
            regex: Regex::new(&format!(
                r"^(\d+\.?\d*)\s+(?i:({UNIT_ALTERNATION}))\s+([A-Za-z0-9\s,\./\-\(\)]+?)\s+([A-Z0-9\-]{{3,20}})\s*$"
            ))
            .unwrap(),
            quantity: 1,
            unit: 2,
            description: 3,
            part_number: 4,
        },
        // "MTU-OF-4568 - MTU Oil Filter (12 ea)"
        RowPattern {
            name: "part_desc_qty",
            regex: Regex::new(&format!(
                r"^([A-Z0-9\-]{{3,20}})\s*-\s*([A-Za-z0-9\s,\./\-\(\)]+?)\s*\((\d+\.?\d*)\s+(?i:({UNIT_ALTERNATION}))\)"
            ))
            .unwrap(),
            quantity: 3,
            unit: 4,
            description: 2,
            part_number: 1,
        },
        // "12 MTU Oil Filter MTU-OF-4568" (unit implied)
        RowPattern {
            name: "qty_desc_part",
            regex: Regex::new(
                r"^(\d+\.?\d*)\s+([A-Za-z0-9\s,\./\-\(\)]+?)\s+([A-Z0-9\-]{3,20})\s*$",
            )
            .unwrap(),
            quantity: 1,
            unit: 0,
            description: 2,
            part_number: 3,
        },
        // "MTU Oil Filter - 12 pieces"
        RowPattern {
            name: "desc_with_qty",
            regex: Regex::new(&format!(
                r"^([A-Za-z0-9\s,\./\-\(\)]+?)\s*[-:]\s*(\d+\.?\d*)\s+(?i:({UNIT_ALTERNATION}|pieces))"
            ))
            .unwrap(),
            quantity: 2,
            unit: 3,
            description: 1,
            part_number: 0,
        },
        // "12    ea    MTU Oil Filter    MTU-OF-4568"
        RowPattern {
            name: "tabular",
            regex: Regex::new(&format!(
                r"^(\d+\.?\d*)\s{{2,}}(?i:({UNIT_ALTERNATION}))\s{{2,}}([A-Za-z0-9\s,\./\-\(\)]+?)\s{{2,}}([A-Z0-9\-]{{3,}})"
            ))
            .unwrap(),
            quantity: 1,
            unit: 2,
            description: 3,
            part_number: 4,
        },
        // "12 MTU Oil Filter"
        RowPattern {
            name: "qty_desc_only",
            regex: Regex::new(r"^(\d+\.?\d*)\s+([A-Za-z0-9\s,\./\-\(\)]{10,})\s*$").unwrap(),
            quantity: 1,
            unit: 0,
            description: 2,
            part_number: 0,
        },
    ];
    static ref HEADER_KEYWORDS: Vec<&'static str> = vec![
        "packing slip", "packing list", "invoice", "order", "date", "item", "quantity",
        "description", "part number", "unit price", "ship to", "bill to", "customer",
        "po number", "page",
    ];
    static ref FOOTER_PATTERN: Regex = Regex::new(r"^\s*(page|total|subtotal)\s+\d+").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

#[derive(Debug, Clone)]
pub struct RowParseResult {
    pub lines: Vec<ExtractedLine>,
    /// lines parsed / non-empty input lines.
    pub coverage: f64,
    pub total_text_lines: usize,
}

/// Parse OCR text into line items. Header and footer lines are skipped and
/// never count against coverage as parsed, only as input.
pub fn parse_lines(ocr_text: &str) -> RowParseResult {
    let text_lines: Vec<&str> =
        ocr_text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    if text_lines.is_empty() {
        return RowParseResult { lines: Vec::new(), coverage: 0.0, total_text_lines: 0 };
    }

    let mut extracted = Vec::new();
    let mut line_number = 1u32;

    for text_line in &text_lines {
        if is_header_or_footer(text_line) {
            continue;
        }
        for pattern in PATTERNS.iter() {
            if let Some(mut line) = try_pattern(text_line, pattern) {
                line.line_number = line_number;
                extracted.push(line);
                line_number += 1;
                break;
            }
        }
    }

    let coverage = extracted.len() as f64 / text_lines.len() as f64;
    info!(
        lines_extracted = extracted.len(),
        total_lines = text_lines.len(),
        coverage,
        "Row parsing complete"
    );

    RowParseResult { lines: extracted, coverage, total_text_lines: text_lines.len() }
}

fn try_pattern(line: &str, pattern: &RowPattern) -> Option<ExtractedLine> {
    let caps = pattern.regex.captures(line)?;
    let get = |idx: usize| -> Option<String> {
        if idx == 0 {
            return None;
        }
        caps.get(idx).map(|m| m.as_str().trim().to_string())
    };

    let quantity: f64 = get(pattern.quantity)?.parse().ok()?;
    if quantity <= 0.0 {
        return None;
    }

    let description = clean_description(&get(pattern.description)?);
    if description.len() < MIN_DESCRIPTION_LEN || description.len() > MAX_DESCRIPTION_LEN {
        return None;
    }

    let unit = normalize_unit(get(pattern.unit).as_deref());
    let part_number = get(pattern.part_number).map(|p| p.to_uppercase());
    let confidence = score_confidence(quantity, &unit, &description, part_number.as_deref());

    tracing::trace!(pattern = pattern.name, "Row matched");
    Some(ExtractedLine {
        line_number: 0,
        quantity,
        unit,
        description,
        part_number,
        confidence,
        provenance: Provenance::Regex,
        raw_text: line.to_string(),
    })
}

/// Canonical unit vocabulary; unknown units pass through lowercased, a
/// missing unit defaults to "ea".
pub fn normalize_unit(unit: Option<&str>) -> String {
    let Some(unit) = unit else { return "ea".to_string() };
    let lower = unit.to_lowercase();
    match lower.as_str() {
        "each" => "ea".to_string(),
        "pieces" | "pc" => "pcs".to_string(),
        "l" => "L".to_string(),
        _ => lower,
    }
}

/// Collapse whitespace, strip trailing punctuation, title-case while
/// preserving all-caps acronyms.
pub fn clean_description(description: &str) -> String {
    let collapsed = WHITESPACE.replace_all(description, " ");
    let trimmed = collapsed.trim().trim_end_matches(['.', ',', ';', ':', '-']).trim_end();

    trimmed
        .split(' ')
        .filter(|w| !w.is_empty())
        .map(|word| {
            if word.len() > 1 && word.chars().all(|c| !c.is_lowercase()) {
                word.to_string()
            } else {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => {
                        first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                    }
                    None => String::new(),
                }
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// high = all of quantity, unit, description, part number; medium = any
/// three; low otherwise. Description counts when its length sits in the
/// comfortable 10-200 band.
fn score_confidence(
    quantity: f64,
    unit: &str,
    description: &str,
    part_number: Option<&str>,
) -> LineConfidence {
    let mut fields = 0;
    if quantity > 0.0 {
        fields += 1;
    }
    if !unit.is_empty() {
        fields += 1;
    }
    if (10..=200).contains(&description.len()) {
        fields += 1;
    }
    if part_number.is_some() {
        fields += 1;
    }
    match fields {
        4 => LineConfidence::High,
        3 => LineConfidence::Medium,
        _ => LineConfidence::Low,
    }
}

fn is_header_or_footer(line: &str) -> bool {
    let lower = line.to_lowercase();
    HEADER_KEYWORDS.iter().any(|kw| lower.contains(kw)) || FOOTER_PATTERN.is_match(&lower)
}
