/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Absolute difference in character counts.
pub fn char_len_diff(a: &str, b: &str) -> usize {
    a.chars().count().abs_diff(b.chars().count())
}
