//! groundrag CLI: index a document folder and ask grounded questions.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Grounded question answering over your own documents
#[derive(Parser, Debug)]
#[command(name = "groundrag", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (holds groundrag.toml and the default index location)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Chunk, embed and index every .txt, .md and .json file under a directory
    Index {
        /// Directory of source documents
        dir: PathBuf,
    },
    /// Ask a question against the index
    Ask {
        question: String,

        /// Number of candidates to retrieve (defaults to retrieval.k_retrieve)
        #[arg(short, long)]
        k: Option<usize>,

        /// Print the raw result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the state of the index
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Evaluate answers against a JSON test set
    Eval {
        /// Test set: [{"q_id", "question", "reference_answer"}]
        test_set: PathBuf,

        /// Disable reranking and accept every answer
        #[arg(long)]
        baseline: bool,

        /// Write per-question results and the summary to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn,groundrag=info,groundrag_core=info",
        1 => "debug",
        _ => "trace",
    };

    // Human-readable layer for stderr, RUST_LOG wins over -v
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "groundrag", "groundrag")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "groundrag.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let config = groundrag_core::load_config(Some(&workspace), cli.config.as_deref(), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    commands::handle_command(cli.command, &workspace, config).await
}
