// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration management for the record/replay harness

use llm_cassette::ToolSurface;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Error;

/// Operating mode of the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessMode {
    /// Forward to a live upstream and capture every exchange.
    Record,
    /// Serve recorded conversations from a cassette.
    Replay,
}

/// Main configuration structure for the record/replay harness
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Upstream configuration (capture mode only)
    pub upstream: UpstreamConfig,

    /// Cassette file configuration
    pub cassette: CassetteConfig,

    /// Execution-surface tool names active for the agent under test
    pub tools: ToolSurface,

    /// Working directory scrubbed from tool arguments at capture time and
    /// restored at replay time
    pub workspace_dir: PathBuf,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            cassette: CassetteConfig::default(),
            tools: ToolSurface::default(),
            workspace_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host
    pub host: String,

    /// Server port; 0 asks the OS for a free port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18080,
        }
    }
}

/// Upstream configuration for capture mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL the capturing proxy forwards to
    pub base_url: String,

    /// Timeout in seconds for upstream requests
    pub timeout_seconds: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_seconds: 300,
        }
    }
}

/// Cassette file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CassetteConfig {
    /// Cassette file written at the end of a capture session and loaded at
    /// replay startup
    pub path: PathBuf,
}

impl Default for CassetteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("session.cassette.yaml"),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &std::path::Path) -> std::result::Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: HarnessConfig =
            serde_yaml::from_str(&contents).map_err(|e| Error::Config {
                message: format!("failed to parse {}: {e}", path.display()),
            })?;
        Ok(config)
    }

    /// Validate the configuration for the given mode
    pub fn validate(&self, mode: HarnessMode) -> std::result::Result<(), Error> {
        if self.server.host.is_empty() {
            return Err(Error::Config {
                message: "Server host cannot be empty".to_string(),
            });
        }

        if mode == HarnessMode::Record && self.upstream.base_url.is_empty() {
            return Err(Error::Config {
                message: "Record mode requires an upstream base URL".to_string(),
            });
        }

        if self.cassette.path.as_os_str().is_empty() {
            return Err(Error::Config {
                message: "Cassette path cannot be empty".to_string(),
            });
        }

        if self.tools.shell.is_empty()
            || self.tools.read_shell.is_empty()
            || self.tools.write_shell.is_empty()
        {
            return Err(Error::Config {
                message: "Execution-surface tool names cannot be empty".to_string(),
            });
        }

        Ok(())
    }
}
