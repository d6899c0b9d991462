//! Error types for output extraction.

/// Why no JSON could be pulled out of a model response.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    /// The response was empty or whitespace-only after cleanup.
    #[error("empty LLM response")]
    EmptyResponse,

    /// No strategy located anything that parses as JSON.
    #[error("no JSON found in response: {text}")]
    NoJson {
        /// A truncated copy of the cleaned text (max 200 chars).
        text: String,
    },

    /// A markdown fence was required but none was present.
    #[error("no JSON code fence found in response")]
    NoFence,

    /// A candidate was located but is not valid JSON.
    #[error("invalid JSON: {reason}")]
    Invalid {
        reason: String,
        /// The candidate that failed, truncated.
        candidate: String,
    },
}

/// Truncate to at most `max_chars` characters, appending "..." if cut.
pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("短い文字列です", 3), "短い文...");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
