//! x-Keeper broker
//!
//! Maintains SSH tunnels to the managed VPN nodes and issues per-user
//! access keys through the 3x-ui panel on each node.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use xk_broker::Broker;
use xk_core::config::{self, BrokerConfig, PanelScheme};
use xk_core::traits::NodeStore;
use xk_core::types::{NodeId, UserId};
use xk_core::TomlNodeStore;
use xk_tunnel::SshTunnelOpener;

#[derive(Parser)]
#[command(name = "xk-broker")]
#[command(about = "x-Keeper tunnel broker and key issuer")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// SSH private key used for every node (overrides config)
    #[arg(long, env = "XK_SSH_KEY")]
    ssh_key: Option<PathBuf>,

    /// Node store file (overrides config)
    #[arg(long, env = "XK_NODES")]
    nodes: Option<PathBuf>,

    /// Panel scheme: auto, https or http (overrides config)
    #[arg(long, env = "XK_PANEL_SCHEME")]
    panel_scheme: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect every node and keep the tunnels healthy until stopped
    Serve,

    /// List nodes in the store
    Nodes,

    /// Create the node's primary inbound if it has none
    Provision {
        #[arg(long)]
        node: i64,
    },

    /// Print the access link for a user on a node
    IssueKey {
        #[arg(long)]
        node: i64,
        #[arg(long)]
        user: i64,
    },

    /// List clients currently online on a node
    Online {
        #[arg(long)]
        node: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;

    let store = TomlNodeStore::open(&config.nodes_path)
        .await
        .with_context(|| format!("Failed to open node store {:?}", config.nodes_path))?;
    let store: Arc<dyn NodeStore> = Arc::new(store);

    if let Command::Nodes = args.command {
        return list_nodes(store.as_ref()).await;
    }

    let opener = SshTunnelOpener::new(&config).context("Failed to prepare SSH client")?;
    let broker = Broker::new(&config, store, Arc::new(opener));

    let result = run(&broker, args.command).await;
    broker.close_all().await;
    result
}

fn load_config(args: &Args) -> Result<BrokerConfig> {
    let mut config: BrokerConfig = match &args.config {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => {
            let path = config::default_config_path();
            config::load_config_or_default(&path)
                .with_context(|| format!("Failed to load config from {:?}", path))?
        }
    };

    if let Some(key) = &args.ssh_key {
        config.ssh_key_path = key.clone();
    }
    if let Some(nodes) = &args.nodes {
        config.nodes_path = nodes.clone();
    }
    if let Some(scheme) = &args.panel_scheme {
        config.panel.scheme = scheme
            .parse::<PanelScheme>()
            .map_err(anyhow::Error::msg)
            .context("Invalid --panel-scheme")?;
    }

    Ok(config)
}

async fn run(broker: &Broker, command: Command) -> Result<()> {
    match command {
        Command::Serve => serve(broker).await,
        Command::Nodes => Ok(()),
        Command::Provision { node } => {
            let (inbound_id, created) = broker.provision(NodeId(node)).await?;
            if created {
                println!("Created inbound {} on node {}", inbound_id, node);
            } else {
                println!("Node {} already uses inbound {}", node, inbound_id);
            }
            Ok(())
        }
        Command::IssueKey { node, user } => {
            let link = broker.issue_key(NodeId(node), UserId(user)).await?;
            println!("{}", link);
            Ok(())
        }
        Command::Online { node } => {
            let online = broker.online_clients(NodeId(node)).await?;
            if online.is_empty() {
                println!("No clients online on node {}", node);
            }
            for email in online {
                println!("{}", email);
            }
            Ok(())
        }
    }
}

async fn list_nodes(store: &dyn NodeStore) -> Result<()> {
    let nodes = store.list_nodes().await?;
    if nodes.is_empty() {
        println!("No nodes configured");
        return Ok(());
    }
    for node in nodes {
        let inbound = node
            .inbound_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>4}  {:<20} {:<40} inbound {}",
            node.id,
            node.name,
            node.ssh_addr(),
            inbound
        );
    }
    Ok(())
}

async fn serve(broker: &Broker) -> Result<()> {
    tracing::info!("x-Keeper broker starting...");

    let connected = broker.connect_all().await?;
    tracing::info!("{} node(s) up; waiting for shutdown signal", connected);

    let cancel = CancellationToken::new();

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    cancel.cancelled().await;
    tracing::info!("Broker shutdown complete");
    Ok(())
}
