//! codevec CLI — batch code-vectorization orchestrator.
//!
//! Drives a corpus of source files through the extraction → normalization →
//! inference pipeline with bounded concurrency, shared vocabulary tables,
//! and idempotent resumption.

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
