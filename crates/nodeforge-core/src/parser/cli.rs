//! A CLI-specific parser for terminal-agent panes (§4.1).
//!
//! Recognizes four things a coding-assistant CLI's pane tends to print:
//! - `<thinking>...</thinking>` blocks → [`SectionKind::Thinking`]
//! - `<tool_use name="...">...</tool_use>` blocks → [`SectionKind::ToolUse`]
//! - a trailing shell-style prompt (`PROMPT_MARKER`, default `"> "`) → ready, complete
//! - a spinner glyph on the last non-empty line → not ready (still producing output)
//!
//! Anything left over is wrapped in a single `text` section, exactly like the generic
//! parser, so a CLI update that changes its chrome degrades gracefully instead of
//! losing output.

use super::{Parser, ParsedResponse, Section, SectionKind};
use regex::Regex;
use std::sync::OnceLock;

const SPINNER_GLYPHS: &[char] = &['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];

fn thinking_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<thinking>(.*?)</thinking>").unwrap())
}

fn tool_use_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?s)<tool_use name="([^"]+)">(.*?)</tool_use>"#).unwrap())
}

pub struct CliParser {
    /// The prompt string the wrapped CLI prints when it's waiting for input.
    pub prompt_marker: String,
}

impl Default for CliParser {
    fn default() -> Self {
        Self {
            prompt_marker: "> ".to_string(),
        }
    }
}

impl CliParser {
    pub fn with_prompt_marker(marker: impl Into<String>) -> Self {
        Self {
            prompt_marker: marker.into(),
        }
    }

    fn last_nonblank_line(raw: &str) -> Option<&str> {
        raw.lines().rev().find(|l| !l.trim().is_empty())
    }

    fn is_spinner_visible(raw: &str) -> bool {
        Self::last_nonblank_line(raw)
            .map(|line| line.trim_start().chars().next().map(|c| SPINNER_GLYPHS.contains(&c)).unwrap_or(false))
            .unwrap_or(false)
    }

    fn is_at_prompt(&self, raw: &str) -> bool {
        Self::last_nonblank_line(raw)
            .map(|line| line.trim_end().ends_with(self.prompt_marker.trim_end()))
            .unwrap_or(false)
    }
}

impl Parser for CliParser {
    fn parse(&self, raw_buffer: &str) -> ParsedResponse {
        let mut sections = Vec::new();
        let mut consumed = raw_buffer.to_string();

        for cap in thinking_re().captures_iter(raw_buffer) {
            sections.push(Section {
                kind: SectionKind::Thinking,
                content: cap[1].trim().to_string(),
                metadata: Default::default(),
            });
        }
        consumed = thinking_re().replace_all(&consumed, "").into_owned();

        for cap in tool_use_re().captures_iter(raw_buffer) {
            let mut metadata = serde_json::Map::new();
            metadata.insert("name".to_string(), serde_json::Value::String(cap[1].to_string()));
            sections.push(Section {
                kind: SectionKind::ToolUse,
                content: cap[2].trim().to_string(),
                metadata,
            });
        }
        consumed = tool_use_re().replace_all(&consumed, "").into_owned();

        let remaining = consumed.trim();
        if !remaining.is_empty() {
            sections.push(Section::text(remaining.to_string()));
        }

        if sections.is_empty() {
            return ParsedResponse::plain_text(raw_buffer);
        }

        let is_ready = !Self::is_spinner_visible(raw_buffer);
        let is_complete = is_ready && self.is_at_prompt(raw_buffer);

        ParsedResponse {
            raw: raw_buffer.to_string(),
            sections,
            tokens: None,
            is_ready,
            is_complete,
        }
    }

    fn name(&self) -> &'static str {
        "cli"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_thinking_and_tool_use_blocks() {
        let raw = "<thinking>plan the fix</thinking>\n<tool_use name=\"grep\">needle</tool_use>\n> ";
        let parsed = CliParser::default().parse(raw);
        assert_eq!(parsed.sections[0].kind, SectionKind::Thinking);
        assert_eq!(parsed.sections[0].content, "plan the fix");
        assert_eq!(parsed.sections[1].kind, SectionKind::ToolUse);
        assert_eq!(parsed.sections[1].metadata["name"], "grep");
    }

    #[test]
    fn spinner_glyph_means_not_ready() {
        let raw = "working...\n⠋ thinking";
        let parsed = CliParser::default().parse(raw);
        assert!(!parsed.is_ready);
        assert!(!parsed.is_complete);
    }

    #[test]
    fn trailing_prompt_means_ready_and_complete() {
        let raw = "done with the task\n> ";
        let parsed = CliParser::default().parse(raw);
        assert!(parsed.is_ready);
        assert!(parsed.is_complete);
    }

    #[test]
    fn parse_is_idempotent_on_raw_field() {
        let parser = CliParser::default();
        let raw = "<thinking>x</thinking>\nplain output\n> ";
        let first = parser.parse(raw);
        let second = parser.parse(&first.raw);
        assert_eq!(first.raw, second.raw);
        assert_eq!(first.is_ready, second.is_ready);
        assert_eq!(first.is_complete, second.is_complete);
        assert_eq!(first.sections.len(), second.sections.len());
    }
}
