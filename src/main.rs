// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;
mod echo;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use libp2p::{Multiaddr, PeerId};
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use astrid_acn::{AcnConfig, AcnConnection};
use astrid_crypto::{Crypto, Keypair, LedgerId};
use astrid_envelope::ProtocolRegistry;
use astrid_runtime::{
    AgentContext, AgentRuntime, DefaultErrorHandler, Dispatcher, ExceptionPolicy, Inbox,
    Multiplexer, Outbox, Queue, RoutingTable, RuntimeConfig, RuntimeHandle,
};

use cli::{Cli, Commands, NetworkArgs, RunArgs};

const EXIT_CLEAN: u8 = 0;
const EXIT_CONFIG: u8 = 1;
const EXIT_RUNTIME: u8 = 2;
const EXIT_SIGNAL: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Launch { dirs, network } => launch_command(dirs, network).await,
    };
    ExitCode::from(code)
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn run_command(args: RunArgs) -> u8 {
    let dir = args.dir.clone().unwrap_or_else(|| PathBuf::from("."));
    let agent = match build_agent(&dir, &args.network) {
        Ok(agent) => agent,
        Err(e) => {
            error!("configuration error: {e:#}");
            return EXIT_CONFIG;
        }
    };
    run_until_signal(vec![agent]).await
}

async fn launch_command(dirs: Vec<PathBuf>, network: NetworkArgs) -> u8 {
    let mut agents = Vec::new();
    for dir in &dirs {
        match build_agent(dir, &network) {
            Ok(agent) => agents.push(agent),
            Err(e) => {
                error!(dir = %dir.display(), "configuration error: {e:#}");
                return EXIT_CONFIG;
            }
        }
    }
    run_until_signal(agents).await
}

// ── Agent assembly ────────────────────────────────────────────────────────────

struct BuiltAgent {
    name: String,
    runtime: AgentRuntime,
}

/// Wire one agent: identity keys, the ACN connection, the queue pair, the
/// dispatcher with the default error handler, and the echo skill.
fn build_agent(dir: &Path, network: &NetworkArgs) -> anyhow::Result<BuiltAgent> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating project directory {}", dir.display()))?;

    let name = agent_name(dir);
    let crypto = load_or_generate_crypto(dir)?;
    let node_key = load_or_generate_node_key(dir)?;
    let peer_id = PeerId::from(node_key.public());

    let listen_addr: Multiaddr = network
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {:?}", network.listen_addr))?;
    let mut acn_config = AcnConfig::new(node_key, crypto.clone())
        .with_listen_addr(listen_addr)
        .with_store_path(dir.join(format!("agent_records_store_{peer_id}")));
    if let Some(public) = &network.public_addr {
        acn_config = acn_config.with_public_addr(
            public
                .parse()
                .with_context(|| format!("invalid public address {public:?}"))?,
        );
    }
    if !network.bootstrap.is_empty() {
        let bootstrap = network
            .bootstrap
            .iter()
            .map(|s| {
                s.parse::<Multiaddr>()
                    .with_context(|| format!("invalid bootstrap address {s:?}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        acn_config = acn_config.with_bootstrap(bootstrap);
    }
    if let Some(relay) = &network.relay {
        acn_config = acn_config.with_relay(
            relay
                .parse()
                .with_context(|| format!("invalid relay address {relay:?}"))?,
        );
    }
    if let Some(delegate) = network.delegate_addr {
        acn_config = acn_config.with_delegate_addr(delegate);
    }

    let registry = Arc::new(ProtocolRegistry::with_defaults());
    let routing = Arc::new(RoutingTable::new());
    let inbox: Inbox = Queue::new(1024);
    let outbox = Outbox::new(
        1024,
        crypto.address().clone(),
        Arc::clone(&registry),
        Arc::clone(&routing),
    );
    let context = AgentContext::new(
        name.clone(),
        crypto.address().clone(),
        crypto.public_key(),
        outbox.clone(),
    );

    let mut multiplexer = Multiplexer::new(inbox.clone(), outbox, routing);
    multiplexer
        .add_connection(
            Arc::new(AcnConnection::spawn(acn_config)),
            ExceptionPolicy::JustLog,
        )
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let dispatcher = Dispatcher::new(
        registry,
        Box::new(DefaultErrorHandler::new(context.clone())),
        ExceptionPolicy::JustLog,
    );

    let mut runtime = AgentRuntime::new(
        context,
        inbox,
        multiplexer,
        dispatcher,
        RuntimeConfig::default(),
    );
    runtime.add_skill(echo::echo_skill());

    info!(agent = %name, address = %crypto.address(), %peer_id, "agent assembled");
    Ok(BuiltAgent { name, runtime })
}

fn agent_name(dir: &Path) -> String {
    std::env::var("AEA_AGENT_NAME").ok().unwrap_or_else(|| {
        dir.canonicalize()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "agent".to_string())
    })
}

/// The agent identity key: `AEA_PRIVATE_KEY_PATH_ED25519` wins; otherwise
/// `<dir>/agent.key`, generated on first run.
fn load_or_generate_crypto(dir: &Path) -> anyhow::Result<Crypto> {
    if let Some(crypto) = Crypto::load_from_env(LedgerId::Ed25519)? {
        return Ok(crypto);
    }
    let path = dir.join("agent.key");
    if path.exists() {
        return Ok(Crypto::load(&path, LedgerId::Ed25519)?);
    }
    let crypto = Crypto::generate(LedgerId::Ed25519);
    crypto.save(&path)?;
    info!(path = %path.display(), address = %crypto.address(), "generated agent key");
    Ok(crypto)
}

/// The node identity key at `<dir>/node.key`, generated on first run.
fn load_or_generate_node_key(dir: &Path) -> anyhow::Result<Keypair> {
    let path = dir.join("node.key");
    if path.exists() {
        let raw = std::fs::read(&path)?;
        return Keypair::from_protobuf_encoding(&raw).with_context(|| {
            format!(
                "node key '{}' could not be decoded; delete it to generate \
                 a new node identity",
                path.display()
            )
        });
    }
    let key = Keypair::generate_ed25519();
    std::fs::write(&path, key.to_protobuf_encoding()?)?;
    info!(path = %path.display(), peer_id = %PeerId::from(key.public()), "generated node key");
    Ok(key)
}

// ── Supervision ───────────────────────────────────────────────────────────────

/// Run all agents until they finish or a signal arrives. Exit code: 130 on
/// signal, 2 if any agent failed, 0 otherwise.
async fn run_until_signal(agents: Vec<BuiltAgent>) -> u8 {
    let mut handles: Vec<RuntimeHandle> = Vec::new();
    let mut set = tokio::task::JoinSet::new();
    for agent in agents {
        handles.push(agent.runtime.handle());
        set.spawn(async move { (agent.name, agent.runtime.run().await) });
    }

    let mut signalled = false;
    let mut worst = EXIT_CLEAN;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !signalled => {
                info!("signal received; stopping agents");
                signalled = true;
                for handle in &handles {
                    handle.stop();
                }
            }
            joined = set.join_next() => match joined {
                Some(Ok((name, Ok(())))) => info!(agent = %name, "agent finished"),
                Some(Ok((name, Err(e)))) => {
                    error!(agent = %name, "agent failed: {e}");
                    worst = worst.max(EXIT_RUNTIME);
                }
                Some(Err(e)) => {
                    error!("agent task panicked: {e}");
                    worst = worst.max(EXIT_RUNTIME);
                }
                None => break,
            }
        }
    }

    if signalled {
        EXIT_SIGNAL
    } else {
        worst
    }
}

// ── Logging ───────────────────────────────────────────────────────────────────

/// `RUST_LOG` wins; otherwise `AEA_LOG_LEVEL`, then the `-v` flags.
fn init_logging(verbosity: u8) {
    let fallback = std::env::var("AEA_LOG_LEVEL").ok().unwrap_or_else(|| {
        match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
        .to_string()
    });
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
