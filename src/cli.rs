// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "astrid",
    version,
    about = "Autonomous economic agent runtime and communication network"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start one agent from a project directory.
    ///
    /// The directory holds the agent's key files (`agent.key`, `node.key`);
    /// missing keys are generated on first run. The agent name comes from
    /// AEA_AGENT_NAME or the directory name.
    Run(RunArgs),

    /// Run several agent projects concurrently.
    ///
    /// Each directory is started like `run`; the launcher stops all agents
    /// on Ctrl-C and exits with the worst exit code among them.
    Launch {
        /// Agent project directories.
        #[arg(required = true)]
        dirs: Vec<PathBuf>,

        #[command(flatten)]
        network: NetworkArgs,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Agent project directory (defaults to the current directory).
    pub dir: Option<PathBuf>,

    #[command(flatten)]
    pub network: NetworkArgs,
}

#[derive(Args, Debug, Clone, Default)]
pub struct NetworkArgs {
    /// Listen multiaddress for the ACN peer.
    #[arg(long, default_value = "/ip4/0.0.0.0/tcp/0")]
    pub listen_addr: String,

    /// Publicly reachable multiaddress, when behind a known NAT mapping.
    #[arg(long)]
    pub public_addr: Option<String>,

    /// Bootstrap peer multiaddresses (must include a /p2p/ component).
    #[arg(long = "bootstrap")]
    pub bootstrap: Vec<String>,

    /// Run as a relay client of this peer instead of announcing directly.
    #[arg(long)]
    pub relay: Option<String>,

    /// Bind address for the delegate TCP service.
    #[arg(long)]
    pub delegate_addr: Option<SocketAddr>,
}
