//! Deeper DARTS CLI Module
//!
//! Command-line interface for running searches and inspecting genotypes.

use clap::{Parser, Subcommand};
use colored::*;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::nas::{Genotype, INPUT_CHANNELS};
use crate::search::{Dataset, SearchConfig, Searcher};

// ─── Styling helpers ───────────────────────────────────────────────────────────

fn dim(s: &str) -> ColoredString    { s.truecolor(100, 100, 100) }
fn accent(s: &str) -> ColoredString { s.truecolor(120, 170, 255) }
fn muted(s: &str) -> ColoredString  { s.truecolor(140, 140, 140) }
fn ok(s: &str) -> ColoredString     { s.truecolor(100, 210, 120) }

fn step_ok(msg: &str) {
    println!("  {} {}", ok("✓"), msg);
}

fn step_run(msg: &str) {
    print!("  {} {}... ", accent("›"), msg);
}

fn step_done(detail: &str) {
    println!("{} {}", ok("done"), dim(detail));
}

fn section(title: &str) {
    println!();
    println!("  {}", title.white().bold());
    println!("  {}", dim(&"─".repeat(56)));
}

fn kv(key: &str, val: &str) {
    println!("  {:<18} {}", muted(key), val.white());
}

// ─── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "deeper-darts")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Differentiable architecture search with a topology regularizer")]
#[command(long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an architecture search on synthetic image data
    Search {
        /// JSON search configuration; defaults are used when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of synthetic samples, split between weights and architecture
        #[arg(long, default_value = "64")]
        samples: usize,

        /// Side length of the synthetic images
        #[arg(long, default_value = "32")]
        image_size: usize,

        /// Override the number of epochs
        #[arg(long)]
        epochs: Option<usize>,

        /// Use second-order architecture gradients
        #[arg(long)]
        unrolled: bool,

        /// Write the final genotype as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the default search configuration as JSON
    Config {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Convert a logged `Genotype(...)` line to JSON
    Genotype {
        /// The genotype text
        text: String,
    },
}

// ─── Commands ──────────────────────────────────────────────────────────────────

pub fn cmd_search(
    config_path: Option<&Path>,
    samples: usize,
    image_size: usize,
    epochs: Option<usize>,
    unrolled: bool,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    section("Search");

    let mut config = match config_path {
        Some(path) => {
            step_run(&format!("Loading {}", path.display()));
            let config = SearchConfig::from_json_file(path)?;
            step_done("");
            config
        }
        None => SearchConfig::default(),
    };
    if let Some(epochs) = epochs {
        config.epochs = epochs;
    }
    config.unrolled |= unrolled;

    step_run("Generating synthetic data");
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(config.seed);
    let data = Dataset::synthetic(
        samples,
        config.network.num_classes,
        INPUT_CHANNELS,
        image_size,
        0.5,
        &mut rng,
    )?;
    step_done(&format!("{} images of {}×{}", data.len(), image_size, image_size));

    let mut searcher = Searcher::new(config)?;
    kv("Parameters", &searcher.model().parameters().numel().to_string());
    kv("Cells", &searcher.model().cells().len().to_string());
    kv("Order", if searcher.config().unrolled { "second" } else { "first" });
    kv("Epochs", &searcher.config().epochs.to_string());

    let start = Instant::now();
    let genotype = searcher.run(&data)?;
    step_ok(&format!("Search finished in {:?}", start.elapsed()));

    if let Some(last) = searcher.history().last() {
        println!();
        kv("Train accuracy", &format!("{:.4}", last.train_accuracy));
        kv("Valid accuracy", &format!("{:.4}", last.valid_accuracy));
        kv("Regularizer", &format!("{:.4}", last.regularizer));
    }
    println!();
    println!("  {}", genotype.to_string().cyan());

    if let Some(path) = output {
        std::fs::write(path, genotype.to_json()?)?;
        step_ok(&format!("Genotype written to {}", path.display()));
    }
    println!();
    Ok(())
}

pub fn cmd_config(output: Option<&Path>) -> anyhow::Result<()> {
    let json = SearchConfig::default().to_json()?;
    match output {
        Some(path) => {
            std::fs::write(path, &json)?;
            step_ok(&format!("Default configuration written to {}", path.display()));
        }
        None => println!("{}", json),
    }
    Ok(())
}

pub fn cmd_genotype(text: &str) -> anyhow::Result<()> {
    let genotype: Genotype = text.parse()?;
    println!("{}", genotype.to_json()?);
    Ok(())
}
