//! # Semantic KB CLI (`kb`)
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./config/kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb init` | Create the configured index |
//! | `kb ingest <path>` | Ingest a json, csv, jsonl, or text file |
//! | `kb search <query...>` | Semantic search |
//! | `kb delete <id>` | Remove one entry |
//! | `kb export` | Dump the index as JSON Lines |
//! | `kb stats` | Show index statistics |
//! | `kb serve` | Start the HTTP store/find server |
//!
//! ## Exit codes
//!
//! `0` on success (including a search with no matches), `2` when the index
//! does not exist yet, `1` for every other failure.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use semantic_kb_core::KbError;
use semantic_kb::ingest::IngestArgs;
use semantic_kb::progress::ProgressMode;
use semantic_kb::{config, export, ingest, manage, search, server, stats};

/// Semantic KB: ingest records, embed them, and search by meaning.
#[derive(Parser)]
#[command(name = "kb", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/kb.toml`. A missing file means built-in
    /// defaults.
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v info, -vv debug). `RUST_LOG` wins when set.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the index for the configured embedder and metric.
    ///
    /// Idempotent. `ingest` also creates the index on first use.
    Init,

    /// Ingest records from a file.
    ///
    /// The format is taken from `--format` or the file extension:
    /// `.json`, `.csv`, `.jsonl`/`.ndjson`, `.txt`/`.text`/`.md`.
    Ingest {
        /// Input file.
        path: PathBuf,

        /// Input format: json, csv, jsonl, or text.
        #[arg(long)]
        format: Option<String>,

        /// Field holding each record's primary text.
        #[arg(long)]
        text_field: Option<String>,

        /// Field holding each record's stable id.
        #[arg(long)]
        id_field: Option<String>,

        /// Documents per embed-and-write batch.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Read and normalize only; nothing is embedded or written.
        #[arg(long)]
        dry_run: bool,

        /// Progress output on stderr: off, human, or json. Defaults to
        /// human on a terminal, off otherwise.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Search the knowledge base.
    Search {
        /// Query text. Multiple words are joined with spaces.
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Delete an entry by id.
    Delete {
        id: String,
    },

    /// Export every entry as JSON Lines.
    Export {
        /// Output file (defaults to stdout).
        #[arg(long)]
        out: Option<PathBuf>,

        /// Include embedding vectors.
        #[arg(long)]
        vectors: bool,
    },

    /// Show index statistics.
    Stats,

    /// Start the HTTP store/find server on `[server].bind`.
    Serve,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => manage::run_init(&cfg).await?,
        Commands::Ingest {
            path,
            format,
            text_field,
            id_field,
            batch_size,
            dry_run,
            progress,
        } => {
            let mode = ProgressMode::from_flag(progress.as_deref())?;
            let args = IngestArgs {
                format,
                text_field,
                id_field,
                batch_size,
                dry_run,
            };
            ingest::run_ingest(&cfg, &path, args, mode).await?;
        }
        Commands::Search { query, limit, json } => {
            search::run_search(&cfg, &query.join(" "), limit, json).await?;
        }
        Commands::Delete { id } => manage::run_delete(&cfg, &id).await?,
        Commands::Export { out, vectors } => {
            export::run_export(&cfg, out.as_deref(), vectors).await?;
        }
        Commands::Stats => stats::run_stats(&cfg).await?,
        Commands::Serve => server::run_server(&cfg).await?,
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let missing_index = err.chain().any(|cause| {
                matches!(
                    cause.downcast_ref::<KbError>(),
                    Some(KbError::IndexNotFound(_))
                )
            });
            if missing_index {
                eprintln!("No index found. Run `kb ingest <file>` (or `kb init`) first.");
                eprintln!("  ({:#})", err);
                ExitCode::from(2)
            } else {
                eprintln!("Error: {:#}", err);
                ExitCode::from(1)
            }
        }
    }
}
