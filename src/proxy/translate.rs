//! Protocol translation between the Messages format and Chat Completions.
//!
//! Buffered translation is a pair of pure functions; streaming translation
//! keeps its per-stream bookkeeping in a caller-owned [`StreamState`] so the
//! functions themselves stay free of shared state.

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::proxy::types::{
    BlockDelta, ChatChunk, ChatMessage, ChatRequest, ChatResponse, ContentBlock,
    MessageDeltaBody, MessagesRequest, MessagesResponse, MessagesUsage, StreamErrorBody,
    StreamEvent,
};

/// Map a Chat Completions finish_reason onto a Messages stop_reason.
pub fn map_stop_reason(finish_reason: &str) -> &'static str {
    match finish_reason {
        "length" => "max_tokens",
        "stop" => "end_turn",
        // Includes "content_filter", "tool_calls", and anything unknown
        _ => "end_turn",
    }
}

fn new_message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

/// Translate an inbound Messages request into a Chat Completions request
/// for the given upstream model.
///
/// The system prompt becomes a leading system message; content blocks are
/// flattened to text (thinking blocks in inbound history are dropped, since
/// the chat format cannot express them).
pub fn chat_request(req: &MessagesRequest, upstream_model: &str, stream: bool) -> ChatRequest {
    let mut messages = Vec::with_capacity(req.messages.len() + 1);

    if let Some(system) = &req.system {
        let text = system.flatten_text();
        if !text.is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: text,
            });
        }
    }

    for m in &req.messages {
        messages.push(ChatMessage {
            role: m.role.clone(),
            content: m.content.flatten_text(),
        });
    }

    ChatRequest {
        model: upstream_model.to_string(),
        messages,
        max_tokens: Some(req.max_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        stop: req.stop_sequences.clone(),
        stream: stream.then_some(true),
        stream_options: None,
    }
}

/// Rewrite an inbound request for a messages-format upstream: same wire
/// format, only the model name changes.
pub fn messages_passthrough_request(
    req: &MessagesRequest,
    upstream_model: &str,
    stream: bool,
) -> MessagesRequest {
    let mut out = req.clone();
    out.model = upstream_model.to_string();
    out.stream = stream.then_some(true);
    out
}

/// Translate a buffered Chat Completions response into a Messages response.
///
/// `requested_model` is echoed back so clients see the logical model they
/// asked for, not the upstream's concrete name.
pub fn messages_response(resp: &ChatResponse, requested_model: &str) -> Result<MessagesResponse> {
    let choice = resp
        .choices
        .first()
        .ok_or_else(|| Error::Internal("upstream response contained no choices".to_string()))?;

    let mut content = Vec::new();
    if let Some(thinking) = &choice.message.reasoning_content {
        if !thinking.is_empty() {
            content.push(ContentBlock::Thinking {
                thinking: thinking.clone(),
            });
        }
    }
    if let Some(text) = &choice.message.content {
        if !text.is_empty() {
            content.push(ContentBlock::Text { text: text.clone() });
        }
    }

    let usage = resp
        .usage
        .map(|u| MessagesUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();

    Ok(MessagesResponse {
        id: new_message_id(),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: requested_model.to_string(),
        content,
        stop_reason: choice.finish_reason.as_deref().map(|r| map_stop_reason(r).to_string()),
        stop_sequence: None,
        usage,
    })
}

/// Rewrite the model field of a passthrough response back to the logical
/// name the client requested.
pub fn rewrite_response_model(resp: &mut MessagesResponse, requested_model: &str) {
    resp.model = requested_model.to_string();
}

// ── Streaming translation ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
}

/// Per-stream translation state.
///
/// Chat Completions chunks are a flat delta stream; the Messages format
/// frames output into typed content blocks with explicit lifecycle events.
/// This tracks the currently open block, synthesizes `message_start` /
/// `content_block_*` events lazily, and guarantees that terminal events
/// are emitted exactly once.
pub struct StreamState {
    message_id: String,
    model: String,
    started: bool,
    block: Option<BlockKind>,
    next_index: u32,
    usage: MessagesUsage,
    stop_reason: Option<String>,
    finished: bool,
    /// Set once any non-empty content delta has been produced. The relay
    /// uses this as the fallback commit point.
    content_emitted: bool,
}

impl StreamState {
    pub fn new(requested_model: &str) -> Self {
        Self {
            message_id: new_message_id(),
            model: requested_model.to_string(),
            started: false,
            block: None,
            next_index: 0,
            usage: MessagesUsage::default(),
            stop_reason: None,
            finished: false,
            content_emitted: false,
        }
    }

    /// Whether any content has been emitted toward the client.
    pub fn content_emitted(&self) -> bool {
        self.content_emitted
    }

    pub fn usage(&self) -> MessagesUsage {
        self.usage
    }

    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }

    fn start_message(&self) -> StreamEvent {
        StreamEvent::MessageStart {
            message: MessagesResponse {
                id: self.message_id.clone(),
                kind: "message".to_string(),
                role: "assistant".to_string(),
                model: self.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: self.usage,
            },
        }
    }

    fn ensure_started(&mut self, out: &mut Vec<StreamEvent>) {
        if !self.started {
            self.started = true;
            out.push(self.start_message());
        }
    }

    fn open_block(&mut self, kind: BlockKind, out: &mut Vec<StreamEvent>) -> u32 {
        if self.block == Some(kind) {
            return self.next_index - 1;
        }
        self.close_block(out);
        let index = self.next_index;
        self.next_index += 1;
        self.block = Some(kind);
        out.push(StreamEvent::ContentBlockStart {
            index,
            content_block: match kind {
                BlockKind::Text => ContentBlock::Text {
                    text: String::new(),
                },
                BlockKind::Thinking => ContentBlock::Thinking {
                    thinking: String::new(),
                },
            },
        });
        index
    }

    fn close_block(&mut self, out: &mut Vec<StreamEvent>) {
        if self.block.take().is_some() {
            out.push(StreamEvent::ContentBlockStop {
                index: self.next_index - 1,
            });
        }
    }

    /// Translate one upstream chunk into zero or more outbound events.
    ///
    /// Delta text passes through verbatim: the concatenation of all
    /// text deltas equals the upstream's content stream.
    pub fn on_chunk(&mut self, chunk: &ChatChunk) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }

        if let Some(usage) = chunk.usage {
            self.usage = MessagesUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            };
        }

        if let Some(choice) = chunk.choices.first() {
            if let Some(thinking) = &choice.delta.reasoning_content {
                if !thinking.is_empty() {
                    self.ensure_started(&mut out);
                    let index = self.open_block(BlockKind::Thinking, &mut out);
                    out.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: BlockDelta::ThinkingDelta {
                            thinking: thinking.clone(),
                        },
                    });
                    self.content_emitted = true;
                }
            }
            if let Some(text) = &choice.delta.content {
                if !text.is_empty() {
                    self.ensure_started(&mut out);
                    let index = self.open_block(BlockKind::Text, &mut out);
                    out.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: BlockDelta::TextDelta { text: text.clone() },
                    });
                    self.content_emitted = true;
                }
            }
            if let Some(reason) = &choice.finish_reason {
                self.stop_reason = Some(map_stop_reason(reason).to_string());
            }
        }

        out
    }

    /// Forward one event from a messages-format (passthrough) upstream,
    /// tracking commit state and rewriting identity fields.
    ///
    /// Terminal events from the upstream are absorbed into this state and
    /// re-emitted by [`finish`](Self::finish), so a duplicated upstream
    /// terminator cannot produce duplicate client events.
    pub fn on_passthrough_event(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        match event {
            StreamEvent::MessageStart { mut message } => {
                self.started = true;
                message.model = self.model.clone();
                message.id = self.message_id.clone();
                self.usage = message.usage;
                vec![StreamEvent::MessageStart { message }]
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let non_empty = match &delta {
                    BlockDelta::TextDelta { text } => !text.is_empty(),
                    BlockDelta::ThinkingDelta { thinking } => !thinking.is_empty(),
                };
                if non_empty {
                    self.content_emitted = true;
                }
                vec![StreamEvent::ContentBlockDelta { index, delta }]
            }
            StreamEvent::MessageDelta { delta, usage } => {
                self.usage = usage;
                self.stop_reason = delta.stop_reason.clone();
                vec![StreamEvent::MessageDelta { delta, usage }]
            }
            StreamEvent::MessageStop => {
                self.finished = true;
                vec![StreamEvent::MessageStop]
            }
            StreamEvent::Ping => vec![StreamEvent::Ping],
            // Upstream errors are handled by the relay, not forwarded blindly
            StreamEvent::Error { .. } => Vec::new(),
            other @ (StreamEvent::ContentBlockStart { .. }
            | StreamEvent::ContentBlockStop { .. }) => vec![other],
        }
    }

    /// Emit the terminal event sequence for a normally completed stream.
    ///
    /// Idempotent: a second call (e.g. upstream signaled termination twice)
    /// produces nothing.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut out = Vec::new();
        // A stream that produced no content still gets a valid envelope
        self.ensure_started(&mut out);
        self.close_block(&mut out);
        out.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(
                    self.stop_reason
                        .clone()
                        .unwrap_or_else(|| "end_turn".to_string()),
                ),
                stop_sequence: None,
            },
            usage: self.usage,
        });
        out.push(StreamEvent::MessageStop);
        out
    }

    /// Emit a terminal error event for a stream that failed after content
    /// was already delivered. Idempotent, like [`finish`](Self::finish).
    pub fn interrupt(&mut self, message: &str) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut out = Vec::new();
        self.close_block(&mut out);
        out.push(StreamEvent::Error {
            error: StreamErrorBody {
                kind: "stream_interrupted".to_string(),
                message: message.to_string(),
            },
        });
        out
    }
}
