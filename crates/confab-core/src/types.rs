//! Core types for assembled chat messages

use serde::{Deserialize, Serialize};

/// Message roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Get the role as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// Lifecycle of a tool invocation part. Only ever moves `Call` -> `Result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolState {
    Call,
    Result,
}

/// A single cited source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

impl SourceEntry {
    /// Create a source without a snippet
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            snippet: None,
        }
    }

    /// Attach a snippet
    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = Some(snippet.into());
        self
    }
}

/// One typed segment of an assistant message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    /// Visible answer text
    Text { text: String },
    /// Model reasoning. `duration` is whole seconds and is omitted when
    /// unknown or zero.
    Reasoning {
        id: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
    },
    /// Tool call, later patched in place with its result
    ToolInvocation {
        id: String,
        name: String,
        args: serde_json::Value,
        state: ToolState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
    /// Cited sources, always written as one unit
    Sources { sources: Vec<SourceEntry> },
}

impl MessagePart {
    /// Create text content
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create a reasoning part
    pub fn reasoning(id: impl Into<String>, text: impl Into<String>, duration: Option<u64>) -> Self {
        Self::Reasoning {
            id: id.into(),
            text: text.into(),
            duration,
        }
    }

    /// Create a tool call in the `call` state
    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        args: serde_json::Value,
    ) -> Self {
        Self::ToolInvocation {
            id: id.into(),
            name: name.into(),
            args,
            state: ToolState::Call,
            result: None,
        }
    }

    /// Get the part kind as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Reasoning { .. } => "reasoning",
            Self::ToolInvocation { .. } => "tool-invocation",
            Self::Sources { .. } => "sources",
        }
    }

    /// Get text if this is a text part
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Check if this is a tool invocation
    pub fn is_tool_invocation(&self) -> bool {
        matches!(self, Self::ToolInvocation { .. })
    }
}

/// Get combined text of all text parts
pub fn joined_text(parts: &[MessagePart]) -> String {
    parts
        .iter()
        .filter_map(|p| p.as_text())
        .collect::<Vec<_>>()
        .join("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reasoning_serializes_without_zero_duration() {
        let part = MessagePart::reasoning("reasoning-1", "hmm", None);
        assert_eq!(
            serde_json::to_value(&part).unwrap(),
            json!({ "type": "reasoning", "id": "reasoning-1", "text": "hmm" })
        );
    }

    #[test]
    fn test_tool_invocation_wire_shape() {
        let part = MessagePart::tool_call("call_1", "web_search", json!({ "query": "rust" }));
        assert_eq!(
            serde_json::to_value(&part).unwrap(),
            json!({
                "type": "tool-invocation",
                "id": "call_1",
                "name": "web_search",
                "args": { "query": "rust" },
                "state": "call"
            })
        );
    }

    #[test]
    fn test_sources_snippet_is_optional() {
        let part: MessagePart = serde_json::from_value(json!({
            "type": "sources",
            "sources": [
                { "title": "Rust", "url": "https://rust-lang.org" },
                { "title": "Docs", "url": "https://docs.rs", "snippet": "crates" }
            ]
        }))
        .unwrap();
        let MessagePart::Sources { sources } = part else {
            panic!("expected sources");
        };
        assert_eq!(sources[0].snippet, None);
        assert_eq!(sources[1].snippet.as_deref(), Some("crates"));
    }

    #[test]
    fn test_joined_text_skips_other_parts() {
        let parts = vec![
            MessagePart::text("Hello "),
            MessagePart::reasoning("reasoning-0", "thinking", Some(2)),
            MessagePart::text("world"),
        ];
        assert_eq!(joined_text(&parts), "Hello world");
    }

    #[test]
    fn test_role_as_str() {
        assert_eq!(Role::User.as_str(), "user");
        assert_eq!(serde_json::to_value(Role::Assistant).unwrap(), json!("assistant"));
    }
}
