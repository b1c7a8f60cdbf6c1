//! Wire events and the server-sent event line parser

use crate::error::{Error, Result};
use crate::types::SourceEntry;
use async_stream::stream;
use serde::Deserialize;
use std::pin::Pin;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_stream::Stream;

/// The only SSE field this parser accepts
const DATA_TAG: &str = "data";

/// Token counts reported by the provider when a turn finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Events carried by the `data:` lines of a response stream
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    /// Visible text delta
    TextDelta { delta: String },
    /// Reasoning block opened
    ReasoningStart { id: String },
    /// Reasoning text delta
    ReasoningDelta { id: String, delta: String },
    /// Reasoning block closed
    ReasoningEnd { id: String },
    /// Tool call announced, arguments not yet available
    #[serde(rename_all = "camelCase")]
    ToolInputStart {
        tool_call_id: String,
        tool_name: String,
    },
    /// Tool call arguments complete
    #[serde(rename_all = "camelCase")]
    ToolInputAvailable {
        tool_call_id: String,
        #[serde(default)]
        tool_name: Option<String>,
        input: serde_json::Value,
    },
    /// Tool call finished with a result
    #[serde(rename_all = "camelCase")]
    ToolOutputAvailable {
        tool_call_id: String,
        output: serde_json::Value,
    },
    /// Cited sources for the answer
    Sources { sources: Vec<SourceEntry> },
    /// Turn completed, optionally with token counts
    Finish {
        #[serde(default)]
        usage: Option<TokenUsage>,
    },
    /// Provider-side failure
    #[serde(rename_all = "camelCase")]
    Error { error_text: String },
    /// Any JSON payload whose type is not recognized. Forwarded untouched.
    #[serde(skip)]
    Unknown {
        event_type: String,
        payload: serde_json::Value,
    },
}

impl StreamEvent {
    /// Classify an already-decoded `data:` payload
    pub fn from_value(value: serde_json::Value) -> Self {
        match serde_json::from_value::<StreamEvent>(value.clone()) {
            Ok(event) => event,
            Err(_) => StreamEvent::Unknown {
                event_type: value
                    .get("type")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                payload: value,
            },
        }
    }

    /// Check if this is a terminal event (Finish or Error)
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Finish { .. } | StreamEvent::Error { .. })
    }

    /// Get the event type tag as it appeared on the wire
    pub fn event_type(&self) -> &str {
        match self {
            StreamEvent::TextDelta { .. } => "text-delta",
            StreamEvent::ReasoningStart { .. } => "reasoning-start",
            StreamEvent::ReasoningDelta { .. } => "reasoning-delta",
            StreamEvent::ReasoningEnd { .. } => "reasoning-end",
            StreamEvent::ToolInputStart { .. } => "tool-input-start",
            StreamEvent::ToolInputAvailable { .. } => "tool-input-available",
            StreamEvent::ToolOutputAvailable { .. } => "tool-output-available",
            StreamEvent::Sources { .. } => "sources",
            StreamEvent::Finish { .. } => "finish",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Unknown { event_type, .. } => event_type,
        }
    }
}

/// Parse one line of a server-sent event stream.
///
/// Returns `None` for anything that is not `data:<json>`: blank lines,
/// comments, heartbeats, `event:` lines and malformed JSON are all
/// skipped silently.
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let (tag, payload) = line.split_once(':')?;
    if tag != DATA_TAG {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    Some(StreamEvent::from_value(value))
}

/// A stream of parsed events
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Read newline-delimited SSE from `reader`, yielding every parseable event.
///
/// A read failure is yielded once as `Err` and ends the stream.
pub fn event_stream<R>(reader: R) -> EventStream
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(stream! {
        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    match parse_line(&line) {
                        Some(event) => yield Ok(event),
                        None => {
                            if !line.is_empty() {
                                tracing::trace!("Skipping unparsed stream line: {}", line);
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Event stream read failed: {}", e);
                    yield Err(Error::Io(e));
                    break;
                }
            }
        }
    })
}
