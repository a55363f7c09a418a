//! Hivemind CLI
//!
//! Run a signaling relay, join the compute swarm, or dispatch demo tasks.

mod config;

use clap::{Parser, Subcommand};
use hivemind_node::link::TcpTransport;
use hivemind_node::{
    DenseLayerRequest, DenseLayerResponse, DenseLayerWorker, DispatchError, Node, NodeEvent,
};
use hivemind_protocol::TaskResult;
use hivemind_relay::RelayServer;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use config::Config;

/// Hivemind - peer-to-peer compute swarm
#[derive(Parser)]
#[command(name = "hivemind")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to ~/.config/hivemind/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay
    Relay {
        /// Listen port (overrides the configured address's port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Join the swarm and serve compute tasks until Ctrl+C
    Node {
        /// Relay WebSocket URL
        #[arg(short, long)]
        relay: Option<String>,

        /// Direct-link listen address
        #[arg(short, long)]
        link_addr: Option<String>,
    },

    /// Join the swarm and dispatch demo dense-layer tasks
    Dispatch {
        /// Relay WebSocket URL
        #[arg(short, long)]
        relay: Option<String>,

        /// Number of tasks to dispatch
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,

        /// Seconds to wait for a connected peer
        #[arg(short, long, default_value_t = 15)]
        wait: u64,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Relay { port } => run_relay(port, &config).await?,
        Commands::Node { relay, link_addr } => run_node(relay, link_addr, config).await?,
        Commands::Dispatch { relay, count, wait } => {
            run_dispatch(relay, count, Duration::from_secs(wait), config).await?;
        }
        Commands::Config => print!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}

/// Run the relay until Ctrl+C
async fn run_relay(port: Option<u16>, config: &Config) -> anyhow::Result<()> {
    let mut addr = config.relay_listen_addr()?;
    if let Some(port) = port {
        addr.set_port(port);
    }

    let server = Arc::new(RelayServer::bind_with_config(addr, config.relay_server_config()).await?);
    println!("Hivemind relay");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Listen: ws://{}", server.local_addr());
    println!("Press Ctrl+C to stop");

    let runner = Arc::clone(&server);
    let task = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    server.shutdown().await;
    let _ = task.await;

    Ok(())
}

/// Start a node with the TCP link transport
async fn start_node(
    relay: Option<String>,
    link_addr: Option<String>,
    mut config: Config,
) -> anyhow::Result<(Node, mpsc::UnboundedReceiver<NodeEvent>)> {
    if let Some(relay) = relay {
        config.node.relay_url = relay;
    }
    if let Some(link_addr) = link_addr {
        config.link.listen_addr = link_addr;
    }
    config.validate()?;

    let settings = config.node_config()?;
    let transport = TcpTransport::bind(&settings.link).await?;
    tracing::info!("Direct links on {}", transport.local_addr());

    let node = Node::new(settings, Arc::new(transport), Arc::new(DenseLayerWorker));
    let events = node
        .events()
        .ok_or_else(|| anyhow::anyhow!("node event stream unavailable"))?;
    node.start().await?;

    Ok((node, events))
}

/// Serve compute tasks until Ctrl+C
async fn run_node(
    relay: Option<String>,
    link_addr: Option<String>,
    config: Config,
) -> anyhow::Result<()> {
    let (node, mut events) = start_node(relay, link_addr, config).await?;

    println!("Hivemind node {}", node.peer_id());
    println!("Relay: {}", node.config().signaling.relay_url);
    println!("Press Ctrl+C to stop");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }

    println!("\nShutting down...");
    node.stop().await?;
    Ok(())
}

fn print_event(event: &NodeEvent) {
    match event {
        NodeEvent::PeerConnected(peer) => println!("+ {peer} connected"),
        NodeEvent::PeerDisconnected { peer_id, reason } => {
            println!("- {peer_id} disconnected ({reason})");
        }
        NodeEvent::NegotiationFailed { peer_id, reason } => {
            println!("! negotiation with {peer_id} failed ({reason})");
        }
        NodeEvent::TaskServed {
            peer_id,
            task_id,
            success,
        } => {
            let outcome = if *success { "ok" } else { "failed" };
            println!("  served {task_id} for {peer_id}: {outcome}");
        }
        NodeEvent::ResultReceived { peer_id, task_id } => {
            println!("  result {task_id} from {peer_id}");
        }
        NodeEvent::RelayDisconnected => println!("! relay connection lost"),
    }
}

/// Random single-layer problem: 4 inputs, 3 outputs
fn demo_request() -> DenseLayerRequest {
    let mut rng = rand::thread_rng();
    let (inputs, outputs) = (4, 3);

    DenseLayerRequest {
        input: (0..inputs).map(|_| rng.gen_range(0.0..1.0)).collect(),
        weights: (0..inputs * outputs)
            .map(|_| rng.gen_range(-1.0..1.0))
            .collect(),
        bias: (0..outputs).map(|_| rng.gen_range(-0.5..0.5)).collect(),
    }
}

/// Dispatch demo tasks, computing locally when no peer is connected
async fn run_dispatch(
    relay: Option<String>,
    count: usize,
    wait: Duration,
    config: Config,
) -> anyhow::Result<()> {
    let (node, mut events) = start_node(relay, None, config).await?;
    println!("Hivemind node {}", node.peer_id());

    let connected = tokio::time::timeout(wait, async {
        while let Some(event) = events.recv().await {
            if let NodeEvent::PeerConnected(peer) = event {
                return Some(peer);
            }
        }
        None
    })
    .await;
    match connected {
        Ok(Some(peer)) => println!("Connected to {peer}"),
        _ => println!("No peer connected after {wait:?}; computing locally"),
    }

    for i in 1..=count {
        let request = demo_request();
        let payload = serde_json::to_vec(&request)?;

        match node.dispatch(payload).await {
            Ok(report) => match report.result {
                TaskResult::Success(bytes) => {
                    let response: DenseLayerResponse = serde_json::from_slice(&bytes)?;
                    println!(
                        "[{i}/{count}] {} -> prediction {} {:?} ({:?})",
                        report.peer_id, response.prediction, response.output, report.elapsed
                    );
                }
                TaskResult::Failure(error) => {
                    println!("[{i}/{count}] {} failed: {error}", report.peer_id);
                }
            },
            Err(DispatchError::NoPeers) => {
                let response = DenseLayerWorker::evaluate(&request)?;
                println!(
                    "[{i}/{count}] local -> prediction {} {:?}",
                    response.prediction, response.output
                );
            }
            Err(e) => println!("[{i}/{count}] dispatch failed: {e}"),
        }
    }

    node.stop().await?;
    Ok(())
}
