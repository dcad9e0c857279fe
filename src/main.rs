//! Bitmessage node CLI
//!
//! A command-line interface for running a node and managing identities.

use clap::{Parser, Subcommand};
use mini_bitmessage::cli;
use mini_bitmessage::core::NETWORK_NONCE_TRIALS_PER_BYTE;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "bitmessage")]
#[command(author = "Darshan")]
#[command(version)]
#[command(about = "A store-and-forward Bitmessage node in Rust", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// P2P node operations
    Node {
        #[command(subcommand)]
        action: NodeCommands,
    },

    /// Identity operations
    Identity {
        #[command(subcommand)]
        action: IdentityCommands,
    },

    /// Benchmark the proof-of-work engines
    Pow {
        /// Size of the random object body
        #[arg(short, long, default_value = "1000")]
        bytes: usize,

        /// Worker threads of the parallel engine (default: one per CPU)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Nonce trials per byte
        #[arg(short, long, default_value_t = NETWORK_NONCE_TRIALS_PER_BYTE)]
        trials: u64,
    },
}

#[derive(Subcommand)]
enum NodeCommands {
    /// Run a node until Ctrl+C
    Start {
        /// JSON network configuration; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on [default: 8444]
        #[arg(short, long)]
        port: Option<u16>,

        /// Streams to serve [default: 1]
        #[arg(short, long, value_delimiter = ',')]
        stream: Option<Vec<u64>>,

        /// Comma separated host:port peers to connect to
        #[arg(long)]
        peers: Option<String>,

        /// Target number of active connections [default: 8]
        #[arg(short, long)]
        connections: Option<usize>,

        /// Bootstrap file with `[stream N]` sections of host:port lines
        #[arg(long)]
        bootstrap: Option<PathBuf>,
    },

    /// Fetch all objects of a trusted node, then exit
    Sync {
        /// JSON network configuration
        #[arg(long)]
        config: Option<PathBuf>,

        /// host:port of the trusted node
        #[arg(long)]
        peer: String,

        /// Give up after this many seconds
        #[arg(short, long, default_value = "120")]
        timeout: u64,
    },
}

#[derive(Subcommand)]
enum IdentityCommands {
    /// Generate a new identity
    New {
        #[arg(short, long, default_value = "1")]
        stream: u64,

        /// Search for an address one byte shorter (takes longer)
        #[arg(long)]
        shorter: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Identity { action } => match action {
            IdentityCommands::New { stream, shorter } => cli::cmd_identity_new(stream, shorter)
                .map_err(|e| -> Box<dyn std::error::Error> { e }),
        },
        Commands::Node { action } => {
            run_node_command(action).map_err(|e| -> Box<dyn std::error::Error> { e })
        }
        Commands::Pow {
            bytes,
            workers,
            trials,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::cmd_pow(bytes, workers, trials))
                .map_err(|e| -> Box<dyn std::error::Error> { e })
        }
    }
}

fn run_node_command(action: NodeCommands) -> cli::CliResult<()> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        match action {
            NodeCommands::Start {
                config,
                port,
                stream,
                peers,
                connections,
                bootstrap,
            } => {
                let peers: Vec<String> = peers
                    .map(|p| p.split(',').map(|s| s.trim().to_string()).collect())
                    .unwrap_or_default();

                let mut config = cli::load_config(config.as_deref())?;
                if let Some(port) = port {
                    config.port = port;
                }
                if let Some(streams) = stream {
                    config.streams = streams;
                }
                if let Some(connections) = connections {
                    config.connection_limit = connections;
                }

                println!("🌐 Starting node on port {}...", config.port);
                cli::cmd_node_start(config, &peers, bootstrap.as_deref()).await
            }

            NodeCommands::Sync {
                config,
                peer,
                timeout,
            } => {
                let config = cli::load_config(config.as_deref())?;
                cli::cmd_node_sync(config, &peer, Duration::from_secs(timeout)).await
            }
        }
    })
}
