//! Character-based token estimation
//!
//! Roughly four characters per token. Not a real tokenizer, but applied
//! uniformly so budget comparisons between messages and summaries stay
//! consistent.

/// Characters assumed per token
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token cost of a piece of text
///
/// Empty text costs nothing; any non-empty text costs at least one token.
#[must_use]
pub fn estimate_tokens(text: &str) -> i64 {
    if text.is_empty() {
        return 0;
    }
    let tokens = (text.chars().count() / CHARS_PER_TOKEN).max(1);
    i64::try_from(tokens).unwrap_or(i64::MAX)
}

/// Estimate the token cost of optional text
#[must_use]
pub fn estimate_tokens_opt(text: Option<&str>) -> i64 {
    text.map_or(0, estimate_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_free() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens_opt(None), 0);
    }

    #[test]
    fn short_text_costs_at_least_one() {
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abc"), 1);
    }

    #[test]
    fn four_chars_per_token() {
        assert_eq!(estimate_tokens("hello"), 1);
        assert_eq!(estimate_tokens("hello world"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn counts_characters_not_bytes() {
        // 8 multi-byte characters, 24 bytes
        assert_eq!(estimate_tokens("日本語日本語日本"), 2);
    }
}
