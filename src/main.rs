//! # ch-ingest CLI
//!
//! Resumable bulk ingestion of Companies House open data into Postgres
//! staging tables.
//!
//! ## Usage
//!
//! ```bash
//! ch-ingest --config ./config/ch-ingest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ch-ingest init` | Create the staging tables and the batch log |
//! | `ch-ingest discover` | List downloadable bulk files as JSON |
//! | `ch-ingest ingest <files.json>` | Run a new batch over a file list |
//! | `ch-ingest resume` | Continue the most recent paused batch |
//! | `ch-ingest status` | Table counts and recent batches |
//! | `ch-ingest parse <path>` | Print the records a local file would stage |
//! | `ch-ingest collate <root>` | Per-company fact summaries from a documents tree |
//!
//! ## Examples
//!
//! ```bash
//! ch-ingest discover --product psc --product accounts \
//!     --start 2024-01-01 --end 2024-06-30 --out files.json
//! ch-ingest ingest files.json
//! # Ctrl-C pauses the batch; pick it up again later:
//! ch-ingest resume
//! ```

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use ch_ingest::models::{parse_file_list, Product};
use ch_ingest::{collate, config, discovery, ingest, migrate, parse_cmd, status};

/// Companies House bulk ingestion.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ch-ingest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ch-ingest",
    about = "Resumable bulk ingestion of Companies House open data",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/ch-ingest.toml`. Commands that never touch the
    /// database fall back to built-in defaults when the file is missing.
    #[arg(long, global = true, default_value = "./config/ch-ingest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the staging schema. Safe to run repeatedly.
    Init,

    /// List bulk files published for the given products and date range.
    Discover {
        /// company, psc or accounts. Repeatable; defaults to all three.
        #[arg(long = "product")]
        products: Vec<Product>,

        /// First file date to include (YYYY-MM-DD).
        #[arg(long)]
        start: NaiveDate,

        /// Last file date to include (YYYY-MM-DD).
        #[arg(long)]
        end: NaiveDate,

        /// Write the list here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Start a new batch over a JSON file list (as printed by `discover`).
    Ingest {
        files: PathBuf,

        /// Load into an in-memory store instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },

    /// Resume the most recent paused batch.
    Resume {
        /// Also pick up a batch left `running` by a crashed process.
        #[arg(long)]
        interrupted: bool,
    },

    /// Show staging table counts and recent batches.
    Status,

    /// Parse a local file and print its staging records as JSON lines.
    Parse {
        path: PathBuf,

        #[arg(long)]
        product: Product,

        /// Stop after this many records.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Write one JSON fact summary per company directory under `root`.
    Collate {
        root: PathBuf,

        #[arg(long, default_value = "./data/collated")]
        out: PathBuf,

        /// Company bulk file (ZIP or CSV) used for company names.
        #[arg(long)]
        companies: Option<PathBuf>,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    // Commands that don't require a database
    match &cli.command {
        Commands::Parse {
            path,
            product,
            limit,
        } => {
            let cfg = config::load_config(&cli.config).unwrap_or_else(|_| config::Config::minimal());
            return parse_cmd::run_parse(&cfg, path, *product, *limit);
        }
        Commands::Collate {
            root,
            out,
            companies,
        } => {
            let cfg = config::load_config(&cli.config).unwrap_or_else(|_| config::Config::minimal());
            return collate::run_collate(&cfg, root, out, companies.as_deref());
        }
        Commands::Discover {
            products,
            start,
            end,
            out,
        } => {
            let cfg = config::load_config(&cli.config).unwrap_or_else(|_| config::Config::minimal());
            let products = if products.is_empty() {
                Product::ALL.to_vec()
            } else {
                products.clone()
            };
            return discovery::run_discover(&cfg, &products, *start, *end, out.as_deref()).await;
        }
        Commands::Ingest {
            files,
            dry_run: true,
        } => {
            let cfg = config::load_config(&cli.config).unwrap_or_else(|_| config::Config::minimal());
            let list = parse_file_list(&std::fs::read_to_string(files)?)?;
            return ingest::run_ingest(&cfg, list, true).await;
        }
        _ => {}
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Staging schema initialized successfully.");
        }
        Commands::Ingest { files, dry_run } => {
            let list = parse_file_list(&std::fs::read_to_string(&files)?)?;
            ingest::run_ingest(&cfg, list, dry_run).await?;
        }
        Commands::Resume { interrupted } => {
            ingest::run_resume(&cfg, interrupted).await?;
        }
        Commands::Status => {
            status::run_status(&cfg).await?;
        }
        Commands::Parse { .. } | Commands::Collate { .. } | Commands::Discover { .. } => {}
    }

    Ok(())
}
