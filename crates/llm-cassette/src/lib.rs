// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Cassette format, normalization pipeline, and conversation matching for
//! deterministic record/replay of chat-completion traffic.
//!
//! A capture session produces raw [`CapturedExchange`]s; the
//! [`CassetteBuilder`] rewrites everything non-reproducible (system prompts,
//! tool-call ids, execution-surface tool names, host paths) into stable
//! placeholders and collapses growing conversation prefixes, yielding a
//! [`Cassette`] fixture. At replay time the [`ConversationMatcher`] finds the
//! recorded reply whose conversation begins with the incoming (re-normalized)
//! message history.

mod error;
mod matching;
mod model;
mod normalize;
mod placeholder;

pub use error::{CassetteError, Result};
pub use matching::ConversationMatcher;
pub use model::{
    CapturedExchange, CapturedRequest, CapturedResponse, Cassette, ChatMessage, Conversation,
    Role, ToolCall, ToolFunction,
};
pub use normalize::{
    is_chat_completion_url, strip_datetime_tag, CassetteBuilder, ToolIdAllocator,
    ToolResultNormalizers, CHAT_COMPLETIONS_SUFFIX,
};
pub use placeholder::{
    expand_workspace_path, scrub_workspace_path, ToolSurface, READ_SHELL_PLACEHOLDER,
    SHELL_PLACEHOLDER, SYSTEM_PLACEHOLDER, WORKSPACE_PLACEHOLDER, WRITE_SHELL_PLACEHOLDER,
};
