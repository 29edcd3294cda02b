//! Parser: a stateless transformer from a raw terminal buffer to a [`ParsedResponse`]
//! (§4.1). A parser never fails — unrecognized content becomes a single `text` section.

pub mod cli;
pub mod generic;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Text,
    Thinking,
    ToolUse,
    ToolResult,
    Prompt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub kind: SectionKind,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Section {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: SectionKind::Text,
            content: content.into(),
            metadata: Map::new(),
        }
    }
}

/// Immutable value produced by a parser (§3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedResponse {
    pub raw: String,
    pub sections: Vec<Section>,
    pub tokens: Option<u32>,
    pub is_ready: bool,
    pub is_complete: bool,
}

impl ParsedResponse {
    /// The fallback result for content no parser recognizes (§4.1).
    pub fn plain_text(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        Self {
            sections: vec![Section::text(raw.clone())],
            raw,
            tokens: None,
            is_ready: true,
            is_complete: true,
        }
    }
}

/// A stateless transformer from raw terminal buffer to [`ParsedResponse`].
///
/// Implementations must be pure functions of their input: calling `parse` twice on the
/// same buffer yields the same result (§8 property 6), and `parse` never panics or
/// returns an error — unrecognized content degrades to [`ParsedResponse::plain_text`].
pub trait Parser: Send + Sync {
    fn parse(&self, raw_buffer: &str) -> ParsedResponse;

    /// A short identifier used by `execute_input`'s `parser` override and recorded on
    /// the terminal node result (`parser` key, §4.4 table).
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_ready_and_complete() {
        let parsed = ParsedResponse::plain_text("whatever");
        assert!(parsed.is_ready);
        assert!(parsed.is_complete);
        assert_eq!(parsed.sections.len(), 1);
        assert_eq!(parsed.sections[0].kind, SectionKind::Text);
    }
}
