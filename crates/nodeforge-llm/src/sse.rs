//! Minimal Server-Sent-Events line framing, shared by the provider streaming clients
//! and the transform proxy's upstream relay.
//!
//! Mirrors the `data: `-prefixed line buffering MCP's Streamable HTTP transport uses
//! for SSE response bodies, generalized into an incremental decoder: chunks can split
//! a line or an event anywhere, so state has to survive across `feed` calls rather
//! than assuming one full body up front.

/// Accumulates raw SSE bytes across chunk boundaries, yielding each `data:` payload
/// once its terminating blank line arrives. Multi-line `data:` fields within one
/// event are joined with `\n`, per the SSE spec; everything else (`event:`, `id:`,
/// comments) is ignored since no caller here needs it.
#[derive(Default)]
pub(crate) struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut payloads = Vec::new();
        let mut data_buffer = String::new();
        let mut consumed = 0;
        for line in self.buffer.split_inclusive('\n') {
            if !line.ends_with('\n') {
                break; // incomplete line; wait for more bytes
            }
            consumed += line.len();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.strip_prefix(' ').unwrap_or(data);
                if !data_buffer.is_empty() {
                    data_buffer.push('\n');
                }
                data_buffer.push_str(data);
            } else if line.is_empty() && !data_buffer.is_empty() {
                payloads.push(std::mem::take(&mut data_buffer));
            }
        }
        self.buffer.drain(..consumed);
        payloads
    }
}
