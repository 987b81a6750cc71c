// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use crate::model::{Cassette, ChatMessage};
use crate::{CassetteError, Result};

/// Finds the recorded reply for a normalized request history by prefix match.
///
/// Matching is stateless and purely a function of the request's full message
/// history, mirroring how chat-completion APIs are stateless per call. The
/// scan is linear over conversations in load order; the first conversation
/// that matches and still holds a reply wins. A trie keyed on message
/// sequences would only pay off for very large cassettes.
#[derive(Debug)]
pub struct ConversationMatcher<'a> {
    cassette: &'a Cassette,
}

impl<'a> ConversationMatcher<'a> {
    pub fn new(cassette: &'a Cassette) -> Self {
        Self { cassette }
    }

    /// Return the message at index `n` of the first conversation whose first
    /// `n` messages equal the `n`-message request exactly.
    ///
    /// # Errors
    ///
    /// `NoConversationMatch` when no conversation begins with the request
    /// history. `IncompleteConversation` when a conversation matches the full
    /// request but ends there, which means a malformed or truncated cassette,
    /// never an empty reply. Lookup failures are always loud; there is no fallback to
    /// a live upstream.
    pub fn find_reply(&self, request: &[ChatMessage]) -> Result<&'a ChatMessage> {
        let mut exhausted_match = false;

        for conversation in &self.cassette.conversations {
            if !conversation.messages.starts_with(request) {
                continue;
            }
            match conversation.messages.get(request.len()) {
                Some(reply) => return Ok(reply),
                None => exhausted_match = true,
            }
        }

        if exhausted_match {
            Err(CassetteError::IncompleteConversation {
                matched_len: request.len(),
            })
        } else {
            Err(CassetteError::NoConversationMatch {
                request_len: request.len(),
                conversations: self.cassette.conversations.len(),
            })
        }
    }
}
