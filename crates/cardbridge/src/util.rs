/// Find the largest byte offset <= `max` that is a valid UTF-8 char boundary.
pub(crate) fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Cut `text` to at most `max_bytes` (UTF-8 safe), marking the cut with `…`.
///
/// The ellipsis is not counted against `max_bytes`.
pub(crate) fn truncate_with_ellipsis(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let cut = floor_char_boundary(text, max_bytes);
    format!("{}…", text[..cut].trim_end())
}

/// Collapse a possibly multi-line string onto one line.
pub(crate) fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_char_boundary_ascii() {
        assert_eq!(floor_char_boundary("hello", 3), 3);
    }

    #[test]
    fn floor_char_boundary_multibyte() {
        let s = "a🦀b"; // a=1, 🦀=4, b=1 → total 6 bytes
        assert_eq!(floor_char_boundary(s, 3), 1);
        assert_eq!(floor_char_boundary(s, 5), 5);
        assert_eq!(floor_char_boundary(s, 1), 1);
    }

    #[test]
    fn floor_char_boundary_beyond_len() {
        assert_eq!(floor_char_boundary("abc", 10), 3);
    }

    #[test]
    fn truncate_short_passes_through() {
        assert_eq!(truncate_with_ellipsis("ls -la", 120), "ls -la");
    }

    #[test]
    fn truncate_long_adds_ellipsis() {
        let text = "x".repeat(200);
        let out = truncate_with_ellipsis(&text, 10);
        assert_eq!(out, format!("{}…", "x".repeat(10)));
    }

    #[test]
    fn truncate_never_splits_a_char() {
        let text = "🦀".repeat(10);
        let out = truncate_with_ellipsis(&text, 6);
        assert_eq!(out, "🦀…");
    }

    #[test]
    fn single_line_collapses_whitespace() {
        assert_eq!(single_line("cargo build \\\n  --release\n"), "cargo build \\ --release");
    }
}
