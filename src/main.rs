#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

//! Trellis - unified CLI entrypoint.
//!
//! Usage:
//!   trellis start --config config/trellis.toml
//!   trellis keygen --config config/trellis.toml --topic teams.alpha... --access rw

use anyhow::Result;
use clap::Parser;
use trellis::cli::commands::{run_keygen, run_start};
use trellis::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Keygen(args) => run_keygen(args),
    }
}
