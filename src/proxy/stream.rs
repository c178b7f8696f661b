//! SSE decoding for upstream streaming responses.
//!
//! Network chunks do not align with SSE line boundaries, so [`SseDecoder`]
//! buffers raw bytes across chunk boundaries and yields complete `data:`
//! payloads. Frame parsing on top of that turns payloads into typed chat
//! chunks or passthrough events; malformed payloads are skipped rather
//! than failing the stream.

use crate::proxy::types::{ChatChunk, StreamEvent};

/// Cap on the line reassembly buffer. A single SSE line larger than this
/// is discarded to bound memory against a misbehaving upstream.
const MAX_LINE_BUFFER: usize = 64 * 1024;

/// Line-buffered SSE decoder.
///
/// Feed raw bytes with [`push`](Self::push); complete `data:` payloads come
/// back in arrival order. Non-data fields (`event:`, `id:`, `retry:`,
/// comments) and blank separator lines are dropped. Call
/// [`flush`](Self::flush) at end of stream to recover a final line that
/// arrived without a trailing newline.
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Process a chunk of bytes, returning any completed data payloads.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut out = Vec::new();

        for &b in bytes {
            if b == b'\n' {
                if let Some(data) = Self::data_payload(&self.buffer) {
                    out.push(data);
                }
                self.buffer.clear();
            } else {
                self.buffer.push(b);
                if self.buffer.len() > MAX_LINE_BUFFER {
                    tracing::warn!(
                        limit = MAX_LINE_BUFFER,
                        "SSE line exceeded buffer cap, discarding"
                    );
                    self.buffer.clear();
                }
            }
        }

        out
    }

    /// Recover a trailing unterminated line at end of stream.
    pub fn flush(&mut self) -> Option<String> {
        let data = Self::data_payload(&self.buffer);
        self.buffer.clear();
        data
    }

    /// Extract the payload of a `data:` line, tolerating CRLF endings and
    /// a missing space after the colon.
    fn data_payload(line: &[u8]) -> Option<String> {
        let line = std::str::from_utf8(line).ok()?;
        let line = line.strip_suffix('\r').unwrap_or(line);
        let payload = line.strip_prefix("data:")?;
        let payload = payload.strip_prefix(' ').unwrap_or(payload);
        if payload.is_empty() {
            return None;
        }
        Some(payload.to_string())
    }
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// One decoded frame from a chat-format upstream stream.
#[derive(Debug, Clone)]
pub enum UpstreamFrame {
    Chunk(ChatChunk),
    Done,
}

/// Parse a chat-format data payload. Returns `None` for malformed JSON.
pub fn parse_chat_frame(data: &str) -> Option<UpstreamFrame> {
    if data == "[DONE]" {
        return Some(UpstreamFrame::Done);
    }
    match serde_json::from_str::<ChatChunk>(data) {
        Ok(chunk) => Some(UpstreamFrame::Chunk(chunk)),
        Err(e) => {
            tracing::debug!(error = %e, "skipping malformed stream chunk");
            None
        }
    }
}

/// Parse a messages-format data payload into a typed event.
/// Returns `None` for malformed or unrecognized payloads.
pub fn parse_messages_frame(data: &str) -> Option<StreamEvent> {
    match serde_json::from_str::<StreamEvent>(data) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::debug!(error = %e, "skipping malformed stream event");
            None
        }
    }
}
