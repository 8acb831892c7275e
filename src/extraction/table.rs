//! Table detection: bounding-box clustering when fragment geometry exists,
//! text heuristics as the fallback.

use serde::Serialize;
use tracing::debug;

use crate::ocr::{OcrFragment, OcrResult};

const ROW_TOLERANCE_PX: f64 = 20.0;
const COLUMN_TOLERANCE_PX: f64 = 50.0;
const MIN_FRAGMENTS: usize = 10;
const MIN_ROWS: usize = 3;
const MIN_COLUMNS: usize = 2;

#[derive(Debug, Clone, Serialize)]
pub struct TableColumn {
    pub index: usize,
    pub x_position: i64,
    pub sample_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableDetection {
    pub has_table: bool,
    pub confidence: f64,
    pub row_count: usize,
    pub column_count: usize,
    pub columns: Vec<TableColumn>,
    pub detection_method: &'static str,
}

impl TableDetection {
    fn none() -> Self {
        Self {
            has_table: false,
            confidence: 0.0,
            row_count: 0,
            column_count: 0,
            columns: Vec::new(),
            detection_method: "none",
        }
    }
}

/// Detect tabular structure in an OCR result. Geometry wins when present
/// and conclusive; otherwise text patterns decide.
pub fn detect_table(ocr: &OcrResult) -> TableDetection {
    if !ocr.fragments.is_empty() {
        let by_boxes = detect_from_bounding_boxes(&ocr.fragments);
        if by_boxes.has_table {
            return by_boxes;
        }
    }
    detect_from_text(&ocr.text)
}

fn detect_from_bounding_boxes(fragments: &[OcrFragment]) -> TableDetection {
    if fragments.len() < MIN_FRAGMENTS {
        return TableDetection::none();
    }

    let rows = group_into_rows(fragments);
    if rows.len() < MIN_ROWS {
        return TableDetection::none();
    }

    let columns = detect_columns(&rows);
    if columns.len() < MIN_COLUMNS {
        return TableDetection::none();
    }

    // Confidence: fraction of rows with at least one column-aligned fragment
    // plus a small bonus per detected column.
    let aligned_rows = rows
        .iter()
        .filter(|row| {
            row.iter().any(|frag| {
                columns
                    .iter()
                    .any(|col| (frag.left() - col.x_position as f64).abs() < COLUMN_TOLERANCE_PX)
            })
        })
        .count();
    let alignment_ratio = aligned_rows as f64 / rows.len() as f64;
    let column_bonus = (columns.len() as f64 * 0.1).min(0.3);
    let confidence = (alignment_ratio + column_bonus).min(1.0);

    debug!(
        rows = rows.len(),
        columns = columns.len(),
        confidence,
        "Table detection from bounding boxes"
    );

    TableDetection {
        has_table: confidence > 0.6,
        confidence,
        row_count: rows.len(),
        column_count: columns.len(),
        columns,
        detection_method: "bounding_boxes",
    }
}

/// Group fragments into visual rows by top-coordinate proximity.
fn group_into_rows(fragments: &[OcrFragment]) -> Vec<Vec<&OcrFragment>> {
    let mut sorted: Vec<&OcrFragment> = fragments.iter().collect();
    sorted.sort_by(|a, b| a.top().partial_cmp(&b.top()).unwrap_or(std::cmp::Ordering::Equal));

    let mut rows: Vec<Vec<&OcrFragment>> = Vec::new();
    let mut row_top = f64::NEG_INFINITY;
    for frag in sorted {
        if (frag.top() - row_top).abs() < ROW_TOLERANCE_PX {
            rows.last_mut().expect("row exists when row_top set").push(frag);
        } else {
            row_top = frag.top();
            rows.push(vec![frag]);
        }
    }
    rows
}

/// Cluster left coordinates; clusters with enough members become columns.
fn detect_columns(rows: &[Vec<&OcrFragment>]) -> Vec<TableColumn> {
    let mut xs: Vec<f64> = rows.iter().flatten().map(|f| f.left()).collect();
    if xs.is_empty() {
        return Vec::new();
    }
    xs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mut columns = Vec::new();
    let mut cluster: Vec<f64> = vec![xs[0]];
    for &x in &xs[1..] {
        if x - cluster.last().copied().unwrap_or(x) < COLUMN_TOLERANCE_PX {
            cluster.push(x);
        } else {
            push_column(&mut columns, &cluster);
            cluster = vec![x];
        }
    }
    push_column(&mut columns, &cluster);
    columns
}

fn push_column(columns: &mut Vec<TableColumn>, cluster: &[f64]) {
    if cluster.len() > 2 {
        let avg = cluster.iter().sum::<f64>() / cluster.len() as f64;
        columns.push(TableColumn {
            index: columns.len(),
            x_position: avg as i64,
            sample_count: cluster.len(),
        });
    }
}

/// Text-only fallback: explicit separators, else a blend of digit-start and
/// word-count-consistency signals.
fn detect_from_text(text: &str) -> TableDetection {
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    if lines.len() < MIN_ROWS {
        return TableDetection::none();
    }

    let separator_lines = lines.iter().filter(|l| l.contains('|') || l.contains('\t')).count();
    if separator_lines as f64 / lines.len() as f64 > 0.5 {
        return TableDetection {
            has_table: true,
            confidence: 0.8,
            row_count: lines.len(),
            column_count: 0,
            columns: Vec::new(),
            detection_method: "text_separators",
        };
    }

    let digit_start = lines
        .iter()
        .filter(|l| l.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .count();
    let digit_ratio = digit_start as f64 / lines.len() as f64;

    let word_counts: Vec<f64> = lines.iter().map(|l| l.split_whitespace().count() as f64).collect();
    let avg_words = word_counts.iter().sum::<f64>() / word_counts.len() as f64;
    let consistency = if avg_words > 0.0 {
        let variance =
            word_counts.iter().map(|c| (c - avg_words).abs()).sum::<f64>() / word_counts.len() as f64;
        1.0 - (variance / avg_words).min(1.0)
    } else {
        0.0
    };

    let confidence = (digit_ratio + consistency) / 2.0;
    TableDetection {
        has_table: confidence > 0.6,
        confidence,
        row_count: lines.len(),
        column_count: 0,
        columns: Vec::new(),
        detection_method: "text_patterns",
    }
}
