//! The generic pass-through parser (§4.1): every buffer becomes one ready, complete
//! text section. Used by default for bash/identity/function nodes and as the
//! fallback for terminal nodes with no CLI-specific parser configured.

use super::{Parser, ParsedResponse};

#[derive(Debug, Default, Clone, Copy)]
pub struct GenericParser;

impl Parser for GenericParser {
    fn parse(&self, raw_buffer: &str) -> ParsedResponse {
        ParsedResponse::plain_text(raw_buffer)
    }

    fn name(&self) -> &'static str {
        "generic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_parser_never_marks_not_ready() {
        let parsed = GenericParser.parse("still producing output...\n");
        assert!(parsed.is_ready);
        assert!(parsed.is_complete);
    }
}
