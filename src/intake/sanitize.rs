//! Filename sanitization for storage paths.
//!
//! Blocks path traversal, shell metacharacters, and unicode tricks before a
//! user-supplied name ever reaches the blob store.

use unicode_normalization::UnicodeNormalization;

const MAX_FILENAME_LEN: usize = 200;

/// Sanitize a user-supplied filename. Idempotent:
/// `sanitize_filename(sanitize_filename(x)) == sanitize_filename(x)`.
pub fn sanitize_filename(filename: &str) -> String {
    if filename.is_empty() {
        return "unnamed".to_string();
    }

    // Strip path components, both separators.
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename);

    // NFKD fold, then drop shell metacharacters and control characters and
    // map everything outside the safe set to underscores.
    let mut out = String::with_capacity(name.len());
    for c in name.nfkd() {
        if c.is_control() {
            continue;
        }
        match c {
            ';' | '&' | '|' | '`' | '$' | '(' | ')' | '<' | '>' | '\'' | '"' => {}
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') => out.push(c),
            _ => out.push('_'),
        }
    }

    if out.len() > MAX_FILENAME_LEN {
        out.truncate(MAX_FILENAME_LEN);
    }

    // Dot-led names would be hidden files on the storage host.
    if out.is_empty() || out.chars().all(|c| c == '.') || out.starts_with('.') {
        if out.starts_with('.') && out.len() > 1 && !out.chars().all(|c| c == '.') {
            return format!("_{}", &out[1..]);
        }
        return "unnamed".to_string();
    }

    out
}
