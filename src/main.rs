//! # AEM RAG CLI (`aemrag`)
//!
//! The `aemrag` binary drives the whole pipeline: crawl the content
//! repository, embed the corpus into a resumable vector index, query it, and
//! serve answers over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! aemrag --config ./config/aemrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `aemrag crawl` | Walk the repository and write the flattened corpus |
//! | `aemrag flatten <file>` | Flatten a saved JSON export to JSON Lines |
//! | `aemrag index build` | Embed the corpus, resuming from the last checkpoint |
//! | `aemrag index status` | Show checkpoint, vector, and lock state |
//! | `aemrag search "<query>"` | Print merged dense + keyword hits |
//! | `aemrag ask ["<question>"]` | Answer one question, or start a prompt loop |
//! | `aemrag serve` | Start the HTTP answer server |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `info`).

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use aem_rag::config::{self, Config};
use aem_rag::progress::ProgressMode;
use aem_rag::server::AnswerFormat;
use aem_rag::{crawl, index_store, indexer, retrieve, server};

/// Retrieval-augmented question answering over an AEM content repository.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/aemrag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "aemrag",
    about = "Crawl, index, and answer questions over an AEM content repository",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/aemrag.toml")]
    config: PathBuf,

    /// Progress output for long-running commands.
    ///
    /// Defaults to `human` on a terminal and `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl the repository and write the flattened corpus.
    ///
    /// Roots come from `--root`, then `[source].roots`, then discovery
    /// under `[source].discovery_root`.
    Crawl {
        /// Root path to crawl. Repeatable.
        #[arg(long = "root")]
        roots: Vec<String>,

        /// Corpus output file. Defaults to `[storage].corpus_path`.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Merge into an existing corpus instead of replacing it.
        #[arg(long)]
        merge: bool,
    },

    /// Flatten a saved JSON content export and print JSON Lines.
    ///
    /// Works without a config file; flattening defaults apply.
    Flatten {
        /// JSON file holding one content node.
        file: PathBuf,

        /// Repository path of the node in the file.
        #[arg(long)]
        path: Option<String>,
    },

    /// Build or inspect the vector index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Print retrieval results for a query without generating an answer.
    Search {
        query: String,
    },

    /// Answer a question from the index.
    ///
    /// Without a question, reads questions from stdin until `exit`.
    Ask {
        question: Option<String>,

        #[arg(long, value_enum, default_value = "markdown")]
        format: AnswerFormat,
    },

    /// Start the HTTP answer server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Embed the corpus, resuming from the last checkpoint.
    Build {
        /// Discard the existing index and start from record zero.
        #[arg(long)]
        restart: bool,

        /// Remove a lock left behind by a crashed run.
        #[arg(long)]
        break_lock: bool,
    },

    /// Show checkpoint, vector count, and lock state.
    Status,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mode = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    if let Commands::Flatten { file, path } = &cli.command {
        let cfg = if cli.config.exists() {
            config::load_config(&cli.config)?
        } else {
            Config::default()
        };
        return crawl::run_flatten(&cfg, file, path.clone());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Crawl {
            roots,
            output,
            merge,
        } => {
            let reporter = mode.reporter();
            crawl::run_crawl(&cfg, roots, output, merge, reporter.as_ref()).await?;
        }
        Commands::Flatten { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
        Commands::Index { action } => match action {
            IndexAction::Build {
                restart,
                break_lock,
            } => {
                let reporter = mode.reporter();
                indexer::run_index_build(&cfg, restart, break_lock, reporter.as_ref()).await?;
            }
            IndexAction::Status => {
                index_store::run_index_status(&cfg)?;
            }
        },
        Commands::Search { query } => {
            retrieve::run_search(&cfg, &query).await?;
        }
        Commands::Ask { question, format } => {
            server::run_ask(&cfg, question, format).await?;
        }
        Commands::Serve => {
            server::run_serve(&cfg).await?;
        }
    }

    Ok(())
}
