// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Placeholder tokens for values expected to vary across runs and hosts, and
//! the two-way substitutions that map between them and concrete values.

use serde::{Deserialize, Serialize};

/// Stands in for any system-message content. System prompts vary across SDK
/// versions and must never cause cassette mismatches.
pub const SYSTEM_PLACEHOLDER: &str = "${system}";

/// Stands in for the platform's shell execution tool name.
pub const SHELL_PLACEHOLDER: &str = "${shell}";

/// Stands in for the platform's read-shell tool name.
pub const READ_SHELL_PLACEHOLDER: &str = "${read_shell}";

/// Stands in for the platform's write-shell tool name.
pub const WRITE_SHELL_PLACEHOLDER: &str = "${write_shell}";

/// Stands in for the host-specific absolute working directory.
pub const WORKSPACE_PLACEHOLDER: &str = "${workspace}";

/// Concrete execution-surface tool names active for one agent configuration.
///
/// Substituting these with the shell placeholders makes a cassette recorded on
/// one execution surface valid on another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSurface {
    pub shell: String,
    pub read_shell: String,
    pub write_shell: String,
}

impl Default for ToolSurface {
    fn default() -> Self {
        if cfg!(windows) {
            Self {
                shell: "powershell".to_string(),
                read_shell: "read_powershell".to_string(),
                write_shell: "write_powershell".to_string(),
            }
        } else {
            Self {
                shell: "bash".to_string(),
                read_shell: "read_bash".to_string(),
                write_shell: "write_bash".to_string(),
            }
        }
    }
}

impl ToolSurface {
    /// Map a concrete tool name to its placeholder. Names outside the
    /// execution surface pass through untouched by the caller.
    pub fn placeholder_for(&self, tool_name: &str) -> Option<&'static str> {
        if tool_name == self.shell {
            Some(SHELL_PLACEHOLDER)
        } else if tool_name == self.read_shell {
            Some(READ_SHELL_PLACEHOLDER)
        } else if tool_name == self.write_shell {
            Some(WRITE_SHELL_PLACEHOLDER)
        } else {
            None
        }
    }

    /// Map a placeholder back to this surface's concrete tool name.
    pub fn concrete_for(&self, placeholder: &str) -> Option<&str> {
        match placeholder {
            SHELL_PLACEHOLDER => Some(&self.shell),
            READ_SHELL_PLACEHOLDER => Some(&self.read_shell),
            WRITE_SHELL_PLACEHOLDER => Some(&self.write_shell),
            _ => None,
        }
    }
}

/// Replace every occurrence of the working directory with the workspace
/// placeholder.
///
/// Runs as a raw string replacement so it is robust to unknown argument
/// shapes. All three spellings the path can take inside a JSON argument
/// string are covered: forward slashes, backslashes, and JSON-escaped
/// backslashes.
pub fn scrub_workspace_path(text: &str, workspace_dir: &str) -> String {
    let forward = workspace_dir.replace('\\', "/");
    let backward = workspace_dir.replace('/', "\\");
    let escaped = backward.replace('\\', "\\\\");

    let mut scrubbed = text.replace(&escaped, WORKSPACE_PLACEHOLDER);
    if backward != forward {
        scrubbed = scrubbed.replace(&backward, WORKSPACE_PLACEHOLDER);
    }
    scrubbed.replace(&forward, WORKSPACE_PLACEHOLDER)
}

/// Restore the workspace placeholder to the caller's real working directory,
/// with forward-slash separators.
pub fn expand_workspace_path(text: &str, workspace_dir: &str) -> String {
    text.replace(WORKSPACE_PLACEHOLDER, &workspace_dir.replace('\\', "/"))
}
