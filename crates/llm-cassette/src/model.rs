// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::Result;

/// Message role within a chat-completion conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single function invocation requested by the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunction,
}

impl ToolCall {
    /// Build a `function`-typed tool call.
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: "function".to_string(),
            function: ToolFunction {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// The function half of a tool call. `arguments` stays the raw JSON string it
/// arrives as; normalization treats it as opaque text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    pub arguments: String,
}

/// One message of a conversation, in the chat-completion wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    /// Assistant message carrying tool calls alongside optional text.
    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    /// Tool-result message answering the call with the given id.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// One complete multi-turn message history, the longest observed variant of a
/// growing exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub messages: Vec<ChatMessage>,
}

/// Persisted replay fixture: distinct model ids plus normalized conversations.
///
/// Cassettes are written once at the end of a capture session and treated as
/// read-only for the lifetime of a replay server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cassette {
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub conversations: Vec<Conversation>,
}

impl Cassette {
    /// Load a cassette from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file is missing or fails to parse; a replay
    /// server treats either as fatal at startup.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let cassette: Cassette = serde_yaml::from_str(&contents)?;
        Ok(cassette)
    }

    /// Serialize to the diff-friendly YAML fixture format.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Write the cassette YAML to disk.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }
}

/// The request half of a proxied exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub start_time: DateTime<Utc>,
}

/// The response half of a proxied exchange, filled in when the upstream reply
/// completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub end_time: DateTime<Utc>,
}

/// One captured request/response pair with timing. Lives only for the duration
/// of a capture session; the normalizer turns qualifying exchanges into
/// [`Conversation`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedExchange {
    pub request: CapturedRequest,
    pub response: Option<CapturedResponse>,
    pub duration_ms: Option<i64>,
}

impl CapturedExchange {
    /// Record the response half and derive the exchange duration.
    pub fn complete(&mut self, response: CapturedResponse) {
        self.duration_ms = Some((response.end_time - self.request.start_time).num_milliseconds());
        self.response = Some(response);
    }
}
