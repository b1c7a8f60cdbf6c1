//! Incremental assembly of message parts from stream events

use crate::stream::StreamEvent;
use crate::types::{MessagePart, SourceEntry, ToolState};
use std::collections::HashMap;
use std::time::Instant;

/// Prefix applied to provider reasoning ids in the stored part
const REASONING_ID_PREFIX: &str = "reasoning-";

/// Builds the ordered part list of one assistant turn while it streams.
///
/// At most one text part and one reasoning block are open at a time, and
/// opening one kind closes the other, so parts always appear in the order
/// the provider emitted them. Tool parts are indexed by call id so results
/// can be attached in place.
///
/// The accumulator is owned by a single turn and is not shared; readers
/// take copies through [`PartAccumulator::parts`].
#[derive(Debug, Default)]
pub struct PartAccumulator {
    parts: Vec<MessagePart>,
    text_cursor: Option<usize>,
    reasoning: Option<OpenReasoning>,
    tool_index: HashMap<String, usize>,
    pending_tool_names: HashMap<String, String>,
    revision: u64,
}

#[derive(Debug)]
struct OpenReasoning {
    id: String,
    text: String,
    started_at: Instant,
}

impl OpenReasoning {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            text: String::new(),
            started_at: Instant::now(),
        }
    }

    fn elapsed_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs_f64().round() as u64
    }
}

impl PartAccumulator {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Append visible text, closing any open reasoning block first
    pub fn add_text_delta(&mut self, delta: &str) {
        if self.reasoning.is_some() {
            self.close_reasoning(None);
        }

        match self.text_cursor {
            Some(index) => {
                if let Some(MessagePart::Text { text }) = self.parts.get_mut(index) {
                    text.push_str(delta);
                }
            }
            None => {
                if delta.is_empty() {
                    return;
                }
                self.parts.push(MessagePart::text(delta));
                self.text_cursor = Some(self.parts.len() - 1);
            }
        }
        self.revision += 1;
    }

    /// Open a reasoning block. The next text delta starts a new text part.
    pub fn start_reasoning(&mut self, id: &str) {
        self.text_cursor = None;
        if let Some(open) = &self.reasoning {
            if open.id == id {
                return;
            }
            self.close_reasoning(None);
        }
        self.reasoning = Some(OpenReasoning::new(id));
        self.revision += 1;
    }

    /// Buffer reasoning text, opening a block if the provider skipped the start event
    pub fn add_reasoning_delta(&mut self, id: &str, delta: &str) {
        if self.reasoning.is_none() {
            self.text_cursor = None;
            self.reasoning = Some(OpenReasoning::new(id));
        }
        if let Some(open) = self.reasoning.as_mut() {
            open.text.push_str(delta);
        }
        self.revision += 1;
    }

    /// Close the open reasoning block.
    ///
    /// The duration is `duration_override` when given, otherwise the rounded
    /// seconds since the block opened. A part is only written when the block
    /// collected some text.
    pub fn end_reasoning(&mut self, _id: &str, duration_override: Option<u64>) {
        self.close_reasoning(duration_override);
    }

    /// Record a tool call in the `call` state
    pub fn add_tool_call(&mut self, id: &str, name: &str, args: serde_json::Value) {
        self.close_open_blocks();

        if let Some(&index) = self.tool_index.get(id) {
            if let Some(MessagePart::ToolInvocation {
                name: existing_name,
                args: existing_args,
                ..
            }) = self.parts.get_mut(index)
            {
                *existing_name = name.to_string();
                *existing_args = args;
            }
        } else {
            self.parts.push(MessagePart::tool_call(id, name, args));
            self.tool_index.insert(id.to_string(), self.parts.len() - 1);
        }
        self.revision += 1;
    }

    /// Attach a result to a previously recorded tool call.
    ///
    /// Returns `false` when no call with `id` exists.
    pub fn add_tool_result(&mut self, id: &str, result: serde_json::Value) -> bool {
        let Some(&index) = self.tool_index.get(id) else {
            tracing::debug!("Tool result for unknown call id {}", id);
            return false;
        };
        if let Some(MessagePart::ToolInvocation {
            state,
            result: slot,
            ..
        }) = self.parts.get_mut(index)
        {
            *state = ToolState::Result;
            *slot = Some(result);
            self.revision += 1;
            return true;
        }
        false
    }

    /// Write a complete sources part
    pub fn add_sources(&mut self, sources: Vec<SourceEntry>) {
        if sources.is_empty() {
            return;
        }
        self.close_open_blocks();
        self.parts.push(MessagePart::Sources { sources });
        self.revision += 1;
    }

    /// Close everything and return the final parts.
    ///
    /// Pending reasoning is kept but gets no duration, since it was cut off.
    /// Safe to call more than once.
    pub fn finalize_all(&mut self) -> Vec<MessagePart> {
        if let Some(open) = self.reasoning.take() {
            if !open.text.is_empty() {
                self.push_reasoning(open, None);
            }
            self.revision += 1;
        }
        self.text_cursor = None;
        self.parts.clone()
    }

    /// Get a copy of the current parts
    pub fn parts(&self) -> Vec<MessagePart> {
        self.parts.clone()
    }

    /// Monotonic counter bumped on every mutation
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Check whether any part has been written
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Route a wire event to the matching operation.
    ///
    /// Returns `true` if the event touched accumulator state.
    pub fn apply(&mut self, event: &StreamEvent) -> bool {
        match event {
            StreamEvent::TextDelta { delta } => self.add_text_delta(delta),
            StreamEvent::ReasoningStart { id } => self.start_reasoning(id),
            StreamEvent::ReasoningDelta { id, delta } => self.add_reasoning_delta(id, delta),
            StreamEvent::ReasoningEnd { id } => self.end_reasoning(id, None),
            StreamEvent::ToolInputStart {
                tool_call_id,
                tool_name,
            } => {
                self.pending_tool_names
                    .insert(tool_call_id.clone(), tool_name.clone());
                return false;
            }
            StreamEvent::ToolInputAvailable {
                tool_call_id,
                tool_name,
                input,
            } => {
                let announced = self.pending_tool_names.remove(tool_call_id);
                let name = tool_name
                    .clone()
                    .or(announced)
                    .unwrap_or_else(|| "unknown".to_string());
                self.add_tool_call(tool_call_id, &name, input.clone());
            }
            StreamEvent::ToolOutputAvailable {
                tool_call_id,
                output,
            } => return self.add_tool_result(tool_call_id, output.clone()),
            StreamEvent::Sources { sources } => self.add_sources(sources.clone()),
            StreamEvent::Finish { .. } | StreamEvent::Error { .. } | StreamEvent::Unknown { .. } => {
                return false;
            }
        }
        true
    }

    fn close_open_blocks(&mut self) {
        self.text_cursor = None;
        if self.reasoning.is_some() {
            self.close_reasoning(None);
        }
    }

    fn close_reasoning(&mut self, duration_override: Option<u64>) {
        let Some(open) = self.reasoning.take() else {
            return;
        };
        let duration = duration_override.unwrap_or_else(|| open.elapsed_secs());
        if !open.text.is_empty() {
            self.push_reasoning(open, Some(duration));
        }
        self.revision += 1;
    }

    fn push_reasoning(&mut self, open: OpenReasoning, duration: Option<u64>) {
        self.parts.push(MessagePart::Reasoning {
            id: format!("{}{}", REASONING_ID_PREFIX, open.id),
            text: open.text,
            duration: duration.filter(|secs| *secs > 0),
        });
    }
}
