// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Capturing proxy and deterministic replay server for chat-completion
//! backends.
//!
//! Record mode relays live traffic to a real upstream while capturing every
//! exchange; on shutdown the session is normalized into a portable cassette.
//! Replay mode loads that cassette and serves recorded replies to any request
//! whose message history prefix-matches a stored conversation, including
//! synthesized streaming output.

pub mod capture;
pub mod config;
pub mod error;
pub mod replay;

pub use capture::{CaptureProxy, RunningCapture};
pub use config::{HarnessConfig, HarnessMode};
pub use error::{Error, Result};
pub use replay::{ReplayServer, RunningReplay};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
