/// Truncate text to at most `max_bytes`, cutting on a char boundary.
pub fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Truncated diagnostic text with a marker when something was cut.
pub fn diagnostic(text: &str, max_bytes: usize) -> String {
    let cut = truncate_utf8(text, max_bytes);
    if cut.len() < text.len() {
        format!("{}\n... (truncated)", cut)
    } else {
        cut.to_string()
    }
}
