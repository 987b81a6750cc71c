// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Record/replay harness CLI

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use llm_replay_proxy::{CaptureProxy, HarnessConfig, ReplayServer};

#[derive(Parser)]
#[command(name = "llm-replay-proxy")]
#[command(about = "Deterministic record/replay harness for chat-completion backends")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture live traffic through the proxy and write a cassette on shutdown
    Record {
        /// Host to bind
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind (0 picks a free port)
        #[arg(long, default_value_t = 18080)]
        port: u16,

        /// Upstream base URL to forward to
        #[arg(long)]
        upstream: String,

        /// Cassette file to write
        #[arg(long)]
        cassette: PathBuf,

        #[command(flatten)]
        common: CommonArgs,
    },
    /// Serve recorded conversations from a cassette
    Replay {
        /// Host to bind
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind (0 picks a free port)
        #[arg(long, default_value_t = 18081)]
        port: u16,

        /// Cassette file to load
        #[arg(long)]
        cassette: PathBuf,

        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(clap::Args)]
struct CommonArgs {
    /// Optional YAML configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Working directory scrubbed from (record) or restored into (replay)
    /// tool arguments
    #[arg(long)]
    workspace_dir: Option<PathBuf>,

    /// Shell execution tool name of the agent under test
    #[arg(long)]
    shell_tool: Option<String>,

    /// Read-shell tool name of the agent under test
    #[arg(long)]
    read_shell_tool: Option<String>,

    /// Write-shell tool name of the agent under test
    #[arg(long)]
    write_shell_tool: Option<String>,
}

impl CommonArgs {
    fn apply(self, config: &mut HarnessConfig) -> anyhow::Result<()> {
        if let Some(path) = &self.config {
            *config = HarnessConfig::from_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?;
        }
        if let Some(dir) = self.workspace_dir {
            config.workspace_dir = dir;
        }
        if let Some(name) = self.shell_tool {
            config.tools.shell = name;
        }
        if let Some(name) = self.read_shell_tool {
            config.tools.read_shell = name;
        }
        if let Some(name) = self.write_shell_tool {
            config.tools.write_shell = name;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Record {
            host,
            port,
            upstream,
            cassette,
            common,
        } => {
            let mut config = HarnessConfig::default();
            common.apply(&mut config)?;
            config.server.host = host;
            config.server.port = port;
            config.upstream.base_url = upstream;
            config.cassette.path = cassette;

            let running = CaptureProxy::new(config)?.start().await?;
            info!(addr = %running.addr(), "recording; stop with Ctrl-C to write the cassette");

            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            match running.stop().await? {
                Some(path) => info!(path = %path.display(), "cassette written"),
                None => info!("no chat-completion traffic captured; nothing written"),
            }
        }
        Commands::Replay {
            host,
            port,
            cassette,
            common,
        } => {
            let mut config = HarnessConfig::default();
            common.apply(&mut config)?;
            config.server.host = host;
            config.server.port = port;
            config.cassette.path = cassette;

            let running = ReplayServer::new(config)?.start().await?;
            info!(addr = %running.addr(), "replaying; stop with Ctrl-C");

            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            running.stop().await?;
        }
    }

    Ok(())
}
