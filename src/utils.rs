use std::fs;
use std::path::Path;
use std::time::Duration;

/// Create an OSC8 file:// hyperlink for terminal output
pub fn osc8_file_link(path: &Path, text: &str) -> String {
    let abs_path = fs::canonicalize(path)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| path.to_string_lossy().to_string());
    format!("\x1b]8;;file://{}\x1b\\{}\x1b]8;;\x1b\\", abs_path, text)
}

/// Delay before retry number `retry` (1-based): base, 2*base, 4*base, ...
pub fn backoff_delay(base: Duration, retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1).min(6);
    base.saturating_mul(1 << exponent)
}

/// Truncate to at most `max_len` bytes on a char boundary
pub fn truncate(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Collapse runs of whitespace (including non-breaking spaces) into single spaces
pub fn collapse_whitespace(text: &str) -> String {
    let mut cleaned = String::with_capacity(text.len());
    let mut prev_was_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !prev_was_space && !cleaned.is_empty() {
                cleaned.push(' ');
                prev_was_space = true;
            }
        } else {
            cleaned.push(c);
            prev_was_space = false;
        }
    }
    cleaned.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(400));
        // Capped at 64x
        assert_eq!(backoff_delay(base, 40), Duration::from_millis(6400));
        assert_eq!(backoff_delay(Duration::ZERO, 5), Duration::ZERO);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");
        // Each CJK char is 3 bytes
        assert_eq!(truncate("肖申克", 4), "肖");
    }

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(
            collapse_whitespace("  1994\u{a0}/\u{a0}美国 \n\n 犯罪  "),
            "1994 / 美国 犯罪"
        );
        assert_eq!(collapse_whitespace(" \n "), "");
    }
}
