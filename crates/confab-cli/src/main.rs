//! confab - replay chat event streams and inspect credit billing

mod commands;
mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use confab_billing::{CreditCalculator, CreditConfig};
use std::path::PathBuf;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

/// confab - chat streaming and credit billing toolkit
#[derive(Parser, Debug)]
#[command(name = "confab")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a captured `data:` event stream through a full turn
    Replay {
        /// File with one event per line
        file: PathBuf,

        /// Model to bill the turn against
        #[arg(short, long)]
        model: Option<String>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Price a single request
    Credits {
        model: String,
        input_tokens: u64,
        output_tokens: u64,
    },

    /// List the pricing table
    Pricing,

    /// Deduct credits from a set of packs, oldest first
    Ledger {
        /// Pack sizes, oldest first
        #[arg(long, value_delimiter = ',', required = true)]
        purchases: Vec<u64>,

        /// Credits to deduct
        #[arg(long)]
        deduct: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing
    let filter = if args.verbose {
        EnvFilter::new("confab=debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let Some(command) = args.command else {
        eprintln!("No command given. Run `confab --help` for usage.");
        std::process::exit(2);
    };

    let cfg = config::Config::load();
    let credit_config = CreditConfig::from_env();

    match command {
        Command::Replay { file, model, json } => {
            let handle = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("Failed to open {}", file.display()))?;
            let model = cfg.model(model);
            let outcome = commands::replay(
                BufReader::new(handle),
                &model,
                &credit_config,
                cfg.snapshot_interval(),
            )
            .await?;
            print!("{}", commands::render_replay(&outcome, json)?);
        }
        Command::Credits {
            model,
            input_tokens,
            output_tokens,
        } => {
            let calculator = CreditCalculator::from_config(&credit_config);
            println!(
                "{}",
                commands::quote(&calculator, &model, input_tokens, output_tokens)
            );
        }
        Command::Pricing => {
            let calculator = CreditCalculator::from_config(&credit_config);
            print!("{}", commands::pricing(&calculator));
        }
        Command::Ledger { purchases, deduct } => {
            let report = commands::simulate_ledger(&credit_config, &purchases, deduct).await?;
            print!("{}", report);
        }
    }

    Ok(())
}
