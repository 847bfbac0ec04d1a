//! topicsync CLI: keeps curriculum topic trees and their search index in sync.
//!
//! Parses numbered outlines or flat topic lists into staging, promotes them
//! into identity-stable production topics, and rebuilds the embedding index.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
