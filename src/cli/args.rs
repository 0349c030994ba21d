//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Trellis - key-gated publish/subscribe broker.
#[derive(Parser)]
#[command(name = "trellis")]
#[command(version)]
#[command(about = "Trellis pub/sub broker and operator tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the broker
    Start(StartArgs),

    /// Issue a topic-access key and print the system-topic hash table
    Keygen(KeygenArgs),
}

#[derive(Args)]
pub struct StartArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/trellis.toml")]
    pub config: PathBuf,
}

#[derive(Args)]
pub struct KeygenArgs {
    /// Path to configuration file (master key and salt)
    #[arg(short, long, default_value = "config/trellis.toml")]
    pub config: PathBuf,

    /// Dotted topic the key should cover, e.g. "teams.alpha..."
    #[arg(long)]
    pub topic: String,

    /// Access characters: r(ead), w(rite), p(resent), e(xtend)
    #[arg(long, default_value = "rw")]
    pub access: String,

    /// Contract id to bind; a fresh one is minted when omitted
    #[arg(long)]
    pub contract: Option<u32>,
}
