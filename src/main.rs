//! # chatdocs CLI
//!
//! The `chatdocs` binary runs the HTTP/WebSocket server and offers a few
//! operator commands against the same database and cache.
//!
//! ## Usage
//!
//! ```bash
//! chatdocs --config ./config/chatdocs.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chatdocs init` | Create the SQLite database and run schema migrations |
//! | `chatdocs serve` | Start the HTTP and WebSocket server |
//! | `chatdocs ingest <files>…` | Create a collection and wait for its build |
//! | `chatdocs list` | List collections |
//! | `chatdocs show <id>` | Show one collection |
//! | `chatdocs query <id> "<question>"` | Ask a question against a built collection |
//! | `chatdocs evict <id>` | Drop a collection's local cache entry |

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chatdocs::app::Services;
use chatdocs::config;
use chatdocs::ingest::{ingest, Upload};
use chatdocs_core::models::CollectionView;

/// chatdocs: document collections in, answers out.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/chatdocs.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "chatdocs", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/chatdocs.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the HTTP and WebSocket server on `[server].bind`.
    Serve,

    /// Create a collection from local files and wait for its index build.
    ///
    /// A single `.zip` argument is expanded the same way an uploaded
    /// archive is.
    Ingest {
        #[arg(long)]
        title: String,

        #[arg(long, default_value = "")]
        description: String,

        /// Vector backend: `duckdb` (embedded), `chromadb`, or `milvus`.
        #[arg(long, default_value = "duckdb")]
        backend: String,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// List all collections.
    List,

    /// Show one collection.
    Show { id: i64 },

    /// Ask a question against a built collection.
    Query {
        id: i64,
        question: String,

        /// Use enhanced (tree summarization) mode.
        #[arg(long)]
        enhanced: bool,

        /// Retrieval breadth for enhanced mode.
        #[arg(long)]
        top_k: Option<usize>,

        /// Chat model override.
        #[arg(long)]
        model: Option<String>,
    },

    /// Remove a collection's local manifest cache entry.
    Evict { id: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    // Init only needs the database, not the inference engine or backends.
    if let Commands::Init = cli.command {
        let pool = chatdocs::db::connect(&cfg).await?;
        chatdocs::migrate::run_migrations(&pool).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let services = Services::start(&cfg).await?;

    match cli.command {
        // Handled above, before the services start.
        Commands::Init => {}
        Commands::Serve => {
            chatdocs::server::run_server(services).await?;
            return Ok(());
        }
        Commands::Ingest {
            title,
            description,
            backend,
            files,
        } => {
            let mut uploads = Vec::with_capacity(files.len());
            for path in &files {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                uploads.push(Upload::new(name, bytes));
            }

            let outcome = ingest(
                services.repo.as_ref(),
                &services.jobs,
                &title,
                &description,
                &backend,
                uploads,
            )
            .await?;
            let id = outcome.collection.id;
            println!(
                "Collection {} created with {} document(s); building index...",
                id,
                outcome.collection.document_names.len()
            );
            let ok = outcome.job.wait().await;
            print_collection(&services, id).await?;
            if !ok {
                anyhow::bail!("index build for collection {} did not complete", id);
            }
        }
        Commands::List => {
            let collections = services.repo.list_collections().await?;
            if collections.is_empty() {
                println!("No collections.");
            }
            for c in collections {
                println!(
                    "{:>4}  {:<9} {:<9} {}",
                    c.id, c.status, c.backend, c.title
                );
            }
        }
        Commands::Show { id } => print_collection(&services, id).await?,
        Commands::Query {
            id,
            question,
            enhanced,
            top_k,
            model,
        } => {
            let handle = services.cache.load(id).await?;
            let model = model.as_deref();
            let answer = if enhanced {
                let top_k = top_k.unwrap_or(handle.retrieval().default_top_k);
                handle.enhanced(top_k, model).run(&question).await?
            } else {
                handle.query(&question, model).await?
            };
            println!("{}", answer.to_markdown());
        }
        Commands::Evict { id } => {
            if services.cache.evict(id).await? {
                println!("Evicted cache entry for collection {}.", id);
            } else {
                println!("No cache entry for collection {}.", id);
            }
        }
    }

    services.jobs.shutdown().await;
    Ok(())
}

async fn print_collection(services: &Services, id: i64) -> anyhow::Result<()> {
    let collection = services
        .repo
        .get_collection(id)
        .await?
        .ok_or(chatdocs::Error::NotFound(id))?;
    let names = services.repo.document_names(id).await?;
    let view = CollectionView::new(&collection, names);
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}
