// src/util.rs — Shared utility functions

/// Truncate a string for display/logging (UTF-8 safe).
///
/// Returns a substring of at most `max_len` bytes, cut on a char boundary.
pub fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Single-line preview of model output for log fields.
pub fn preview(s: &str, max_len: usize) -> String {
    let first = s.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    let cut = truncate_str(first, max_len);
    if cut.len() < first.len() || s.lines().filter(|l| !l.trim().is_empty()).count() > 1 {
        format!("{cut}...")
    } else {
        cut.to_string()
    }
}

/// Rough token count used for cost projection (~4 chars per token).
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() as f32 / 4.0).ceil() as u32
}
