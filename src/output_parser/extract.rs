//! Locating structured content inside free-form model output.
//!
//! Every post-processing rule that looks for JSON goes through these
//! helpers: think-block stripping, markdown fence extraction and
//! nesting-aware bracket matching.

/// Strip `<think>`/`<thinking>` blocks and surrounding whitespace.
pub fn preprocess(text: &str) -> String {
    strip_think_tags(text).trim().to_string()
}

/// Remove every `<think>...</think>` and `<thinking>...</thinking>` block.
///
/// An unclosed block swallows the rest of the text.
///
/// ```
/// use novel_rulechain::output_parser::strip_think_tags;
///
/// assert_eq!(strip_think_tags("<think>plan</think>answer"), "answer");
/// assert_eq!(strip_think_tags("<thinking>never closed"), "");
/// ```
pub fn strip_think_tags(text: &str) -> String {
    let once = strip_block(text, "<think>", "</think>");
    strip_block(&once, "<thinking>", "</thinking>")
}

fn strip_block(text: &str, open: &str, close: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(open) {
        out.push_str(&rest[..start]);
        match rest[start..].find(close) {
            Some(end) => rest = &rest[start + end + close.len()..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

/// A fenced markdown block: its info string (if any) and trimmed body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fence<'a> {
    pub lang: Option<&'a str>,
    pub body: &'a str,
}

/// All closed ```` ``` ```` fences in order of appearance.
pub fn fences(text: &str) -> Vec<Fence<'_>> {
    let mut found = Vec::new();
    let mut cursor = 0;
    while let Some(offset) = text[cursor..].find("```") {
        let info_start = cursor + offset + 3;
        let Some(line_len) = text[info_start..].find('\n') else {
            break;
        };
        let info = text[info_start..info_start + line_len].trim();
        let body_start = info_start + line_len + 1;
        let Some(body_len) = text[body_start..].find("```") else {
            break;
        };
        found.push(Fence {
            lang: (!info.is_empty()).then_some(info),
            body: text[body_start..body_start + body_len].trim(),
        });
        cursor = body_start + body_len + 3;
    }
    found
}

/// Body of the first fence labelled `json`, or failing that the first
/// unlabelled fence whose body looks like a JSON object or array.
///
/// ```
/// use novel_rulechain::output_parser::extract::json_fence;
///
/// assert_eq!(json_fence("```json\n{\"a\":1}\n```"), Some("{\"a\":1}"));
/// assert_eq!(json_fence("```python\nprint(1)\n```"), None);
/// ```
pub fn json_fence(text: &str) -> Option<&str> {
    let all = fences(text);
    all.iter()
        .find(|f| f.lang.is_some_and(|l| l.eq_ignore_ascii_case("json")))
        .or_else(|| {
            all.iter().find(|f| {
                f.lang.is_none() && (f.body.starts_with('{') || f.body.starts_with('['))
            })
        })
        .map(|f| f.body)
}

/// The last top-level `open ... close` region, skipping delimiters that
/// appear inside JSON string literals.
///
/// ```
/// use novel_rulechain::output_parser::extract::find_bracketed;
///
/// let text = r#"first {"a": 1} then {"b": "}"}"#;
/// assert_eq!(find_bracketed(text, '{', '}'), Some(r#"{"b": "}"}"#));
/// ```
pub fn find_bracketed(text: &str, open: char, close: char) -> Option<&str> {
    let mut last = None;
    let mut from = 0;
    while let Some(offset) = text[from..].find(open) {
        let start = from + offset;
        let Some(end) = matching_close(&text[start..], open, close) else {
            break;
        };
        last = Some(&text[start..=start + end]);
        from = start + end + close.len_utf8();
    }
    last
}

fn matching_close(text: &str, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        if ch == '"' {
            in_string = true;
        } else if ch == open {
            depth += 1;
        } else if ch == close {
            depth = depth.checked_sub(1)?;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}
