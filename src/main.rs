//! # FinRAG CLI (`finrag`)
//!
//! ## Usage
//!
//! ```bash
//! finrag --config ./config/finrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `finrag init` | Create the SQLite audit database and tables |
//! | `finrag serve` | Start the HTTP API server |
//! | `finrag query <company> "<question>"` | Ask a running server a question |
//! | `finrag ingest <file.json>` | Send one document or an array of documents |
//! | `finrag metrics` | Print the server's metrics snapshot |
//!
//! ## Examples
//!
//! ```bash
//! finrag init --config ./config/finrag.toml
//! finrag serve --config ./config/finrag.toml
//!
//! finrag ingest reports/apple-10k.json --api-key demo-key-1234
//! finrag query Apple "What was total net sales last year?" --api-key demo-key-1234
//! finrag metrics
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use finrag::client::{load_documents, ApiClient};
use finrag::{audit, config, server, telemetry};

/// FinRAG: retrieval-augmented answers over financial reports.
#[derive(Parser)]
#[command(
    name = "finrag",
    about = "FinRAG: retrieval-augmented question answering over financial reports",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Used by `init` and `serve`.
    #[arg(long, global = true, default_value = "./config/finrag.toml")]
    config: PathBuf,

    /// Base URL of a running server. Used by the client commands.
    #[arg(long, global = true, default_value = "http://127.0.0.1:8000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the audit database schema. Idempotent.
    Init,

    /// Start the HTTP API server.
    Serve,

    /// Ask a question about one company.
    Query {
        company: String,
        question: String,
        #[arg(long)]
        api_key: String,
    },

    /// Ingest documents from a JSON file (one object or an array).
    Ingest {
        file: PathBuf,
        #[arg(long)]
        api_key: String,
    },

    /// Print the server's metrics snapshot.
    Metrics,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let cfg = config::load_config(&cli.config)?;
            let path = cfg
                .audit
                .db_path
                .ok_or_else(|| anyhow::anyhow!("audit.db_path is not set in {}", cli.config.display()))?;
            audit::SqliteAuditLog::open(&path).await?;
            println!("Audit database initialized at {}.", path.display());
        }
        Commands::Serve => {
            let cfg = config::load_config(&cli.config)?;
            server::run_server(&cfg).await?;
        }
        Commands::Query {
            company,
            question,
            api_key,
        } => {
            let client = ApiClient::new(&cli.server)?;
            let result = client.query(&company, &question, &api_key).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Ingest { file, api_key } => {
            let client = ApiClient::new(&cli.server)?;
            let docs = load_documents(&file)?;
            let result = if docs.len() == 1 {
                client.ingest(&docs[0], &api_key).await?
            } else {
                client.ingest_batch(&docs, &api_key).await?
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Metrics => {
            let client = ApiClient::new(&cli.server)?;
            let snapshot = client.metrics().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }

    Ok(())
}
