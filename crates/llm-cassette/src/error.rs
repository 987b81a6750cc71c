// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use thiserror::Error;

/// Convenient result alias for cassette operations.
pub type Result<T> = std::result::Result<T, CassetteError>;

/// Errors that can occur while normalizing captures or matching conversations.
#[derive(Debug, Error)]
pub enum CassetteError {
    /// Underlying IO error while accessing cassette files.
    #[error("Cassette IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing or serialization error.
    #[error("Cassette parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing error inside a captured request or response body.
    #[error("Exchange body parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// A captured exchange was missing required chat-completion structure.
    #[error("Malformed captured exchange: {0}")]
    MalformedExchange(String),

    /// No recorded conversation begins with the request's message history.
    #[error(
        "No recorded conversation matches the {request_len}-message request prefix \
         ({conversations} conversations consulted)"
    )]
    NoConversationMatch {
        request_len: usize,
        conversations: usize,
    },

    /// A conversation matched the full request but holds no reply beyond it.
    #[error(
        "A recorded conversation matches all {matched_len} request messages but contains \
         no further reply; the cassette is incomplete"
    )]
    IncompleteConversation { matched_len: usize },
}
