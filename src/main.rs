//! # Causeway
//!
//! Peer-to-peer group chat with causal delivery.
//!
//! The simulation commands run several engines on one in-memory network and
//! print what every node ended up with. `node` runs a single engine over TCP
//! and chats on stdin/stdout.

mod node;
mod simulation;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "causeway")]
#[command(about = "Decentralized group chat with causal delivery")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log engine internals
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Two peers send concurrently; both converge on the same messages
    Demo,
    /// A peer receives a burst of messages out of order and holds them back
    Reorder {
        /// Messages in the burst
        #[arg(short, long, default_value = "20")]
        messages: usize,
    },
    /// Split a cluster, keep chatting on both sides, heal and backfill
    Partition {
        /// Messages each side sends while split
        #[arg(short, long, default_value = "5")]
        messages: usize,
    },
    /// Random sends over a lossy, duplicating, reordering network
    Chaos {
        #[arg(short, long, default_value = "4")]
        peers: usize,
        #[arg(short, long, default_value = "25")]
        messages: usize,
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },
    /// Run a chat node over TCP, configured from CAUSEWAY_* variables
    Node,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // simulations print their own summaries
    let default_filter = if cli.verbose || matches!(cli.command, Commands::Node) {
        "info,cbc_engine=debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Demo => simulation::demo().await?,
        Commands::Reorder { messages } => simulation::reorder(messages).await?,
        Commands::Partition { messages } => simulation::partition(messages).await?,
        Commands::Chaos {
            peers,
            messages,
            seed,
        } => simulation::chaos(peers, messages, seed).await?.print(),
        Commands::Node => node::run().await?,
    }
    Ok(())
}
