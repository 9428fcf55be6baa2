//! Deeper DARTS - Main Entry Point
//!
//! Runs architecture searches and converts genotypes from the command line.

use clap::Parser;
use deeper_darts::cli::{cmd_config, cmd_genotype, cmd_search, Cli, Commands};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deeper_darts=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Search { config, samples, image_size, epochs, unrolled, output } => {
            cmd_search(config.as_deref(), samples, image_size, epochs, unrolled, output.as_deref())?;
        }
        Commands::Config { output } => {
            cmd_config(output.as_deref())?;
        }
        Commands::Genotype { text } => {
            cmd_genotype(&text)?;
        }
    }

    Ok(())
}
