//! Token estimation without a vendor tokenizer.
//!
//! Used for diagnostics during real runs, for local servers that do not
//! report usage, and by the dry-run estimator.

/// Estimate the number of tokens `text` costs on `model_id`.
///
/// Any `Fn(&str, &str) -> u32` closure is also an estimator, which keeps
/// tests able to pin exact per-prompt figures.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str, model_id: &str) -> u32;
}

impl<F> TokenEstimator for F
where
    F: Fn(&str, &str) -> u32 + Send + Sync,
{
    fn estimate(&self, text: &str, model_id: &str) -> u32 {
        self(text, model_id)
    }
}

/// Character-count heuristic.
///
/// CJK ideographs, kana and hangul count as one token each (novel text is
/// frequently Chinese or Japanese); every other character counts a quarter
/// token, rounded up.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenEstimator;

impl TokenEstimator for HeuristicTokenEstimator {
    fn estimate(&self, text: &str, _model_id: &str) -> u32 {
        estimate_tokens(text)
    }
}

/// The heuristic as a free function.
pub fn estimate_tokens(text: &str) -> u32 {
    let mut wide = 0u32;
    let mut other = 0u32;
    for ch in text.chars() {
        if is_wide(ch) {
            wide += 1;
        } else {
            other += 1;
        }
    }
    wide + other.div_ceil(4)
}

fn is_wide(ch: char) -> bool {
    matches!(ch as u32,
        0x3040..=0x30FF     // hiragana, katakana
        | 0x3400..=0x4DBF   // CJK extension A
        | 0x4E00..=0x9FFF   // CJK unified ideographs
        | 0xAC00..=0xD7AF   // hangul syllables
        | 0xF900..=0xFAFF   // CJK compatibility ideographs
        | 0x20000..=0x2FA1F // supplementary ideographic planes
    )
}
