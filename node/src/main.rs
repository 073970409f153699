//! # AutoRoute Node
//!
//! Entry point for the `autoroute-node` binary. Parses CLI arguments,
//! initializes logging and metrics, starts the routing engine, links to
//! the configured peers and serves the HTTP status, metrics and local
//! packet sockets.
//!
//! The binary supports three subcommands:
//!
//! - `run`     start the router
//! - `keygen`  print a fresh private key and its node address
//! - `version` print build version information

mod api;
mod cli;
mod local;
mod logging;
mod metrics;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;

use autoroute::{MemoryMoney, NeighborFinder, Node, PrivateKey};

use cli::{AutoRouteCli, Commands};
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = AutoRouteCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Keygen => {
            keygen();
            Ok(())
        }
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the router, its peer listener and the three local surfaces, then
/// waits for a shutdown signal.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(logging::DEFAULT_FILTER, args.log_format);

    let key = match &args.key {
        Some(hex) => PrivateKey::from_hex(hex.trim()).context("invalid --key")?,
        None => {
            tracing::warn!("no --key given, generating an ephemeral identity");
            PrivateKey::generate()
        }
    };

    // Single-host payment backend; every node sharing it must share a process.
    let money = Arc::new(MemoryMoney::new());
    let config = args.node_config();
    tracing::info!(
        id = %key.address(),
        listen = %args.listen,
        algorithm = ?config.algorithm,
        status_port = args.status_port,
        metrics_port = args.metrics_port,
        local_port = args.local_port,
        "starting autoroute-node"
    );

    let node = Node::new(key, money, config).context("failed to start the router")?;

    // --- Peer links ---
    let finder = NeighborFinder::new(Arc::clone(&node));
    finder
        .listen(args.listen)
        .await
        .with_context(|| format!("failed to bind peer listener on {}", args.listen))?;

    for peer in args.peers.iter().copied() {
        let finder = Arc::clone(&finder);
        tokio::spawn(async move {
            if let Err(e) = finder.connect(peer).await {
                tracing::warn!(addr = %peer, error = %e, "failed to dial peer");
            }
        });
    }

    // --- Local packet socket ---
    let delivered = node
        .packets()
        .context("delivered-packet stream already taken")?;
    let hub = local::spawn_delivery_hub(&node, delivered);
    let local_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, args.local_port));
    local::serve(local_addr, Arc::clone(&node), hub)
        .await
        .with_context(|| format!("failed to bind local packet socket on {local_addr}"))?;

    // --- Status and metrics ---
    let state = api::AppState {
        version: format!(
            "{} (protocol {})",
            env!("CARGO_PKG_VERSION"),
            autoroute::config::PROTOCOL_VERSION,
        ),
        node: Arc::clone(&node),
        metrics: Arc::new(NodeMetrics::new().context("failed to create metrics registry")?),
    };

    let status_addr = SocketAddr::from(([0, 0, 0, 0], args.status_port));
    let status_listener = tokio::net::TcpListener::bind(status_addr)
        .await
        .with_context(|| format!("failed to bind status listener on {status_addr}"))?;
    tracing::info!(addr = %status_addr, "status server listening");

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], args.metrics_port));
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {metrics_addr}"))?;
    tracing::info!(addr = %metrics_addr, "metrics server listening");

    // --- Serve ---
    tokio::select! {
        res = axum::serve(status_listener, api::create_router(state.clone())) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "status server error");
            }
        }
        res = axum::serve(metrics_listener, api::metrics_router(state)) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "metrics server error");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    node.close();
    tracing::info!("autoroute-node stopped");
    Ok(())
}

/// Prints a fresh private key and the address it maps to.
fn keygen() {
    let key = PrivateKey::generate();
    println!("key     {}", key.to_hex());
    println!("address {}", key.address());
}

/// Prints version information to stdout.
fn print_version() {
    println!("autoroute-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol       {}", autoroute::config::PROTOCOL_VERSION);
    println!("wire           {}", autoroute::config::WIRE_PROTOCOL_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
