//! # Output Parser
//!
//! Pulls JSON out of model responses without another LLM call. Handles
//! think blocks, markdown fences and JSON embedded in prose.
//!
//! | Function | Use Case |
//! |----------|----------|
//! | [`locate_json`] | JSON anywhere in the text: whole response, fence, or last balanced object/array |
//! | [`extract_fenced_json`] | JSON from a ```` ```json ```` fence, or a bare JSON response |
//! | [`strip_think_tags`] | Remove `<think>` blocks from text |

pub mod error;
pub mod extract;
pub mod json;

pub use error::ParseError;
pub use extract::{preprocess, strip_think_tags};
pub use json::{extract_fenced_json, locate_json};
