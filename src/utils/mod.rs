//! Utility functions shared across modules

/// First `max_chars` characters of `s`, with `...` appended when anything was cut.
pub fn preview(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &s[..end]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_short_message_untouched() {
        assert_eq!(preview("hi", 100), "hi");
        assert_eq!(preview("", 100), "");
    }

    #[test]
    fn test_preview_counts_chars_not_bytes() {
        let text = "🤖".repeat(101);
        let out = preview(&text, 100);
        assert_eq!(out.chars().count(), 103);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn test_preview_exact_length() {
        let text = "a".repeat(100);
        assert_eq!(preview(&text, 100), text);
    }

    #[test]
    fn test_preview_cuts_on_char_boundary() {
        assert_eq!(preview("ok✅done", 3), "ok✅...");
    }
}
