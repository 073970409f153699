//! # CLI Interface
//!
//! Command-line arguments for `autoroute-node`, built with `clap` derive.
//! Three subcommands: `run`, `keygen` and `version`.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use autoroute::config::{
    DEFAULT_LOCAL_PORT, DEFAULT_METRICS_PORT, DEFAULT_PEER_PORT, DEFAULT_STATUS_PORT,
};
use autoroute::{AlgorithmKind, NodeConfig};

use crate::logging::LogFormat;

/// AutoRoute mesh router node.
///
/// Joins a pay-per-packet mesh: links to peers over TCP, forwards packets
/// along gossiped reachability maps, and pays for confirmed deliveries.
#[derive(Parser, Debug)]
#[command(
    name = "autoroute-node",
    about = "AutoRoute mesh router node",
    version,
    propagate_version = true
)]
pub struct AutoRouteCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the router.
    Run(RunArgs),
    /// Print a fresh P-521 private key and the address it maps to.
    Keygen,
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Address to accept peer links on.
    #[arg(long, env = "AUTOROUTE_LISTEN", default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PEER_PORT)))]
    pub listen: SocketAddr,

    /// Peer to dial at start-up. Repeat for several peers.
    #[arg(long = "peer", value_name = "ADDR")]
    pub peers: Vec<SocketAddr>,

    /// Port for the HTTP status surface (`/status`, `/health`).
    #[arg(long, env = "AUTOROUTE_STATUS_PORT", default_value_t = DEFAULT_STATUS_PORT)]
    pub status_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "AUTOROUTE_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Port for the local packet socket, bound on loopback only.
    #[arg(long, env = "AUTOROUTE_LOCAL_PORT", default_value_t = DEFAULT_LOCAL_PORT)]
    pub local_port: u16,

    /// Hex-encoded P-521 private key. A fresh key is generated when absent.
    #[arg(long, env = "AUTOROUTE_KEY", hide_env_values = true)]
    pub key: Option<String>,

    /// Next-hop algorithm: `basic` or `bandwidth`.
    #[arg(long, env = "AUTOROUTE_ALGORITHM", default_value = "bandwidth")]
    pub algorithm: AlgorithmKind,

    /// Milliseconds between delivery receipts.
    #[arg(long, default_value_t = 1_000)]
    pub receipt_interval_ms: u64,

    /// Milliseconds between payment rounds.
    #[arg(long, default_value_t = 10_000)]
    pub payment_interval_ms: u64,

    /// Seed for the weighted next-hop choice. Random when absent.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Log output format.
    #[arg(long, env = "AUTOROUTE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl RunArgs {
    /// Runtime configuration for the engine. Knobs without a flag keep
    /// their defaults.
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            receipt_interval: Duration::from_millis(self.receipt_interval_ms),
            payment_interval: Duration::from_millis(self.payment_interval_ms),
            algorithm: self.algorithm,
            rng_seed: self.seed,
            ..NodeConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        AutoRouteCli::command().debug_assert();
    }

    #[test]
    fn run_flags_map_onto_node_config() {
        let cli = AutoRouteCli::try_parse_from([
            "autoroute-node",
            "run",
            "--peer",
            "10.0.0.2:9650",
            "--peer",
            "10.0.0.3:9650",
            "--algorithm",
            "basic",
            "--receipt-interval-ms",
            "250",
            "--seed",
            "9",
            "--log-format",
            "json",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.peers.len(), 2);
        assert_eq!(args.status_port, DEFAULT_STATUS_PORT);
        assert_eq!(args.log_format, LogFormat::Json);

        let config = args.node_config();
        assert_eq!(config.algorithm, AlgorithmKind::Basic);
        assert_eq!(config.receipt_interval, Duration::from_millis(250));
        assert_eq!(config.rng_seed, Some(9));
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let result =
            AutoRouteCli::try_parse_from(["autoroute-node", "run", "--algorithm", "fastest"]);
        assert!(result.is_err());
    }
}
