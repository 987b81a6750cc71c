// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Normalization pipeline: turns the raw exchanges of one capture session into
//! a portable, diff-friendly [`Cassette`].
//!
//! Volatile fields (system prompts, tool-call ids, execution-surface tool
//! names, host paths, timestamps embedded in user messages) are rewritten
//! into stable placeholders so that two recordings of the same conversation
//! produce byte-identical fixtures.

use regex::Regex;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;
use tracing::warn;

use crate::model::{Cassette, CapturedExchange, ChatMessage, Conversation, Role, ToolCall};
use crate::placeholder::{scrub_workspace_path, ToolSurface, SYSTEM_PLACEHOLDER};
use crate::{CassetteError, Result};

/// Path suffix identifying chat-completion traffic. Exchanges against any
/// other endpoint are recorded by the proxy but never become conversations.
pub const CHAT_COMPLETIONS_SUFFIX: &str = "/chat/completions";

static DATETIME_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^<current_datetime>[^<]*</current_datetime>\s*")
        .unwrap_or_else(|e| panic!("invalid datetime tag pattern: {e}"))
});

/// True when the URL's path (query ignored) targets the chat-completion
/// endpoint.
pub fn is_chat_completion_url(url: &str) -> bool {
    let path = url.split('?').next().unwrap_or(url);
    path.trim_end_matches('/').ends_with(CHAT_COMPLETIONS_SUFFIX)
}

/// Strip the fixed leading `<current_datetime>…</current_datetime>` tag (and
/// any trailing separator) from user-message content. Only the exact leading
/// tag is removed; the remainder is kept verbatim.
pub fn strip_datetime_tag(content: &str) -> String {
    DATETIME_TAG.replace(content, "").into_owned()
}

/// Rewrite function applied to the content of a tool-result message.
pub type ToolResultFn = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Registry of per-tool content rewrite functions, keyed by the concrete tool
/// name the call was issued with.
///
/// Lets individual tests scrub tool output that is otherwise
/// non-deterministic, e.g. timestamps inside a tool's own output.
#[derive(Default)]
pub struct ToolResultNormalizers {
    by_tool: HashMap<String, ToolResultFn>,
}

impl ToolResultNormalizers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rewrite function for one tool name, replacing any previous
    /// registration.
    pub fn register<F>(&mut self, tool_name: impl Into<String>, rewrite: F)
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.by_tool.insert(tool_name.into(), Box::new(rewrite));
    }

    /// Apply the registered rewrite for `tool_name`, if any.
    pub fn apply(&self, tool_name: &str, content: &str) -> Option<String> {
        self.by_tool.get(tool_name).map(|rewrite| rewrite(content))
    }
}

impl fmt::Debug for ToolResultNormalizers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolResultNormalizers")
            .field("tools", &self.by_tool.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Assigns stable `toolcall_<N>` ids in first-seen order.
///
/// One allocator spans an entire normalization pass, never a single
/// conversation, so ids stay strictly increasing across every conversation of
/// a capture session and fixtures diff cleanly.
///
/// Ids already in canonical form pass through unchanged. A replay server
/// emits canonical ids in its replies; when the client echoes them back in
/// the next turn, re-normalizing the request must reproduce the persisted
/// history exactly even when the conversation's first tool call is not
/// `toolcall_0`.
#[derive(Debug, Default)]
pub struct ToolIdAllocator {
    next: u64,
    assigned: HashMap<String, String>,
}

impl ToolIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the canonical id for `id`, allocating the next counter value on
    /// first sight of a non-canonical id.
    pub fn canonicalize(&mut self, id: &str) -> String {
        if let Some(existing) = self.assigned.get(id) {
            return existing.clone();
        }
        let canonical = if is_canonical_tool_id(id) {
            id.to_string()
        } else {
            let assigned = format!("toolcall_{}", self.next);
            self.next += 1;
            assigned
        };
        self.assigned.insert(id.to_string(), canonical.clone());
        canonical
    }
}

fn is_canonical_tool_id(id: &str) -> bool {
    id.strip_prefix("toolcall_")
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

/// Builds a [`Cassette`] from the ordered exchanges of one capture session.
///
/// All mutable normalization state (the tool-id allocator and the map from
/// canonical id to the tool name that issued it) lives on the builder, so a
/// pass is fully described by its constructor inputs.
pub struct CassetteBuilder {
    workspace_dir: String,
    tools: ToolSurface,
    result_normalizers: ToolResultNormalizers,
    ids: ToolIdAllocator,
    call_tool_names: HashMap<String, String>,
}

impl CassetteBuilder {
    pub fn new(workspace_dir: impl AsRef<Path>, tools: ToolSurface) -> Self {
        Self {
            workspace_dir: workspace_dir.as_ref().to_string_lossy().into_owned(),
            tools,
            result_normalizers: ToolResultNormalizers::default(),
            ids: ToolIdAllocator::new(),
            call_tool_names: HashMap::new(),
        }
    }

    /// Attach per-tool result rewrite functions.
    #[must_use]
    pub fn with_result_normalizers(mut self, normalizers: ToolResultNormalizers) -> Self {
        self.result_normalizers = normalizers;
        self
    }

    /// Normalize one capture session into a cassette.
    ///
    /// Returns `Ok(None)` when no chat-completion exchange occurred, so that
    /// callers never write an empty, misleading fixture. Exchanges with
    /// malformed JSON bodies are skipped with a warning; the remaining valid
    /// exchanges still produce a cassette.
    pub fn build(mut self, exchanges: &[CapturedExchange]) -> Result<Option<Cassette>> {
        let mut steps: Vec<Vec<ChatMessage>> = Vec::new();
        let mut models: Vec<String> = Vec::new();

        for exchange in exchanges {
            if !is_chat_completion_url(&exchange.request.url) {
                continue;
            }
            let Some(response) = &exchange.response else {
                warn!(url = %exchange.request.url, "skipping exchange with no response");
                continue;
            };
            match self.extract_step(&exchange.request.body, &response.body) {
                Ok((model, messages)) => {
                    if !models.contains(&model) {
                        models.push(model);
                    }
                    steps.push(messages);
                }
                Err(error) => {
                    warn!(url = %exchange.request.url, %error, "skipping malformed captured exchange");
                }
            }
        }

        if steps.is_empty() {
            return Ok(None);
        }

        Ok(Some(Cassette {
            models,
            conversations: collapse_prefixes(steps),
        }))
    }

    /// Parse one exchange into its full normalized message list: the request's
    /// `messages` array followed by the response's first choice message.
    fn extract_step(&mut self, request_body: &str, response_body: &str) -> Result<(String, Vec<ChatMessage>)> {
        let request: JsonValue = serde_json::from_str(request_body)?;
        let model = request
            .get("model")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| CassetteError::MalformedExchange("request has no model field".to_string()))?
            .to_string();
        let raw_messages = request
            .get("messages")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| CassetteError::MalformedExchange("request has no messages array".to_string()))?;

        let mut messages: Vec<ChatMessage> = Vec::with_capacity(raw_messages.len() + 1);
        for raw in raw_messages {
            messages.push(serde_json::from_value(raw.clone())?);
        }

        let response: JsonValue = serde_json::from_str(response_body)?;
        let reply = response
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .ok_or_else(|| {
                CassetteError::MalformedExchange("response has no choices[0].message".to_string())
            })?;
        messages.push(serde_json::from_value(reply.clone())?);

        self.normalize_messages(&mut messages);
        Ok((model, messages))
    }

    /// Apply the per-message normalization rules in place. The replay server
    /// runs this same pipeline over incoming requests before matching.
    pub fn normalize_messages(&mut self, messages: &mut [ChatMessage]) {
        for message in messages {
            self.normalize_message(message);
        }
    }

    fn normalize_message(&mut self, message: &mut ChatMessage) {
        match message.role {
            Role::System => {
                message.content = Some(SYSTEM_PLACEHOLDER.to_string());
            }
            Role::User => {
                if let Some(content) = &message.content {
                    message.content = Some(strip_datetime_tag(content));
                }
            }
            Role::Assistant => {
                if let Some(calls) = &mut message.tool_calls {
                    for call in calls {
                        Self::normalize_tool_call(
                            call,
                            &self.tools,
                            &self.workspace_dir,
                            &mut self.ids,
                            &mut self.call_tool_names,
                        );
                    }
                }
            }
            Role::Tool => self.normalize_tool_result(message),
        }
    }

    fn normalize_tool_call(
        call: &mut ToolCall,
        tools: &ToolSurface,
        workspace_dir: &str,
        ids: &mut ToolIdAllocator,
        call_tool_names: &mut HashMap<String, String>,
    ) {
        let canonical = ids.canonicalize(&call.id);
        // Result normalizers key on the concrete name the call was issued with.
        call_tool_names.entry(canonical.clone()).or_insert_with(|| call.function.name.clone());
        call.id = canonical;

        if let Some(placeholder) = tools.placeholder_for(&call.function.name) {
            call.function.name = placeholder.to_string();
        }
        call.function.arguments = scrub_workspace_path(&call.function.arguments, workspace_dir);
    }

    fn normalize_tool_result(&mut self, message: &mut ChatMessage) {
        let Some(call_id) = &message.tool_call_id else {
            return;
        };
        let canonical = self.ids.canonicalize(call_id);

        if let Some(tool_name) = self.call_tool_names.get(&canonical) {
            if let Some(content) = &message.content {
                if let Some(rewritten) = self.result_normalizers.apply(tool_name, content) {
                    message.content = Some(rewritten);
                }
            }
        }

        message.tool_call_id = Some(canonical);
    }
}

impl fmt::Debug for CassetteBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CassetteBuilder")
            .field("workspace_dir", &self.workspace_dir)
            .field("tools", &self.tools)
            .field("ids", &self.ids)
            .finish()
    }
}

/// Collapse successive turns of one growing conversation, keeping only the
/// longest message list of each chain.
///
/// Chains are detected by structural equality of the shared prefix, not by
/// any identifier: when a step begins with the previous chain's full message
/// list, it replaces it.
fn collapse_prefixes(steps: Vec<Vec<ChatMessage>>) -> Vec<Conversation> {
    let mut chains: Vec<Vec<ChatMessage>> = Vec::new();
    for step in steps {
        match chains.last_mut() {
            Some(previous) if step.starts_with(previous) => *previous = step,
            _ => chains.push(step),
        }
    }
    chains.into_iter().map(|messages| Conversation { messages }).collect()
}
