//! # Kenny CLI
//!
//! Thin shell over the engine. Every invocation emits exactly one JSON
//! object with `status`, `correlation_id`, and a command-specific
//! payload; exit code is 0 on success and 1 on error. Mutating flows are
//! two-phase: `plan` is the dry-run that prints the operation hash, and
//! `execute --operation-hash H` confirms and runs it.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use kenny::audit::new_correlation_id;
use kenny::config;
use kenny::engine::Engine;
use kenny::error::Error;
use kenny::extractor::IngestMode;
use kenny::models::DocumentKind;
use kenny::search::SearchOptions;

#[derive(Parser)]
#[command(
    name = "kenny",
    about = "Kenny — a local-first personal data platform with hybrid retrieval and a plan-confirm-execute engine",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/kenny.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or open the store and run migrations
    Init,

    /// Run the ingest coordinator over configured sources
    Ingest {
        /// Full sync: re-pull everything and sweep rows gone from the source
        #[arg(long)]
        full: bool,

        /// Comma-separated source names (default: all discovered)
        #[arg(long, value_delimiter = ',')]
        sources: Option<Vec<String>>,
    },

    /// Keyword search over indexed documents
    Search {
        query: String,

        /// Maximum number of results
        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Restrict to document kinds (comma-separated)
        #[arg(long, value_delimiter = ',')]
        types: Option<Vec<String>>,
    },

    /// Fused keyword + vector search
    #[command(name = "hybrid_search", alias = "hybrid-search")]
    HybridSearch {
        query: String,

        #[arg(long)]
        bm25_weight: Option<f64>,

        #[arg(long)]
        embedding_weight: Option<f64>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Generate embeddings for chunks missing them
    #[command(name = "ingest_embeddings", alias = "ingest-embeddings")]
    IngestEmbeddings {
        /// Drop every stored vector first
        #[arg(long)]
        force: bool,

        /// Override the configured embedding model
        #[arg(long)]
        model: Option<String>,
    },

    /// Per-table counts and health overview
    Stats,

    /// Create a plan for a query (dry-run; emits the operation hash)
    Plan { query: String },

    /// Confirm and execute a previously created plan
    Execute {
        plan_id: String,

        /// Operation hash from the dry-run; required for mutating plans
        #[arg(long)]
        operation_hash: Option<String>,
    },

    /// Fetch one document with its side record
    Get { id: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let correlation_id = new_correlation_id();

    match run(cli, &correlation_id).await {
        Ok(payload) => {
            let mut envelope = serde_json::json!({
                "status": "ok",
                "correlation_id": correlation_id,
            });
            merge(&mut envelope, payload);
            println!("{envelope}");
        }
        Err(e) => {
            let envelope = serde_json::json!({
                "status": "error",
                "correlation_id": correlation_id,
                "error": { "kind": error_kind(&e), "message": e.to_string() },
            });
            println!("{envelope}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli, _correlation_id: &str) -> anyhow::Result<serde_json::Value> {
    let mut config = config::load_config(&cli.config)?;
    if let Commands::IngestEmbeddings {
        model: Some(model), ..
    } = &cli.command
    {
        config.embedding.model = Some(model.clone());
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.environment.default_log_level())),
        )
        .try_init()
        .ok();

    let engine = Engine::open(config).await?;
    let cancel = CancellationToken::new();

    let payload = match cli.command {
        Commands::Init => {
            let version = kenny::migrate::current_version(engine.store().pool()).await?;
            serde_json::json!({ "schema_version": version })
        }

        Commands::Ingest { full, sources } => {
            let mode = if full { IngestMode::Full } else { IngestMode::Incremental };
            let (ingest_correlation, stats) =
                engine.ingest(mode, sources.as_deref(), &cancel).await?;
            serde_json::json!({
                "mode": mode.as_str(),
                "ingest_correlation_id": ingest_correlation,
                "sources": stats,
            })
        }

        Commands::Search { query, limit, types } => {
            let kinds = parse_kinds(types)?;
            let hits = engine.keyword_search(&query, limit, &kinds).await?;
            serde_json::json!({ "count": hits.len(), "results": hits })
        }

        Commands::HybridSearch {
            query,
            bm25_weight,
            embedding_weight,
            limit,
        } => {
            let mut opts: SearchOptions = engine.default_search_options();
            if let Some(w) = bm25_weight {
                opts.bm25_weight = w;
            }
            if let Some(w) = embedding_weight {
                opts.embedding_weight = w;
            }
            if let Some(n) = limit {
                opts.limit = n;
            }
            let response = engine.search(&query, &opts).await?;
            serde_json::json!({
                "count": response.hits.len(),
                "partial": response.partial,
                "warning": response.warning,
                "results": response.hits,
            })
        }

        Commands::IngestEmbeddings { force, .. } => {
            let written = engine.rebuild_embeddings(force).await?;
            serde_json::json!({ "embeddings_written": written, "forced": force })
        }

        Commands::Stats => {
            let report = kenny::stats::gather(engine.store()).await?;
            serde_json::to_value(report)?
        }

        Commands::Plan { query } => {
            let plan = engine.plan(&query).await?;
            let requires_hash = plan.operation_hash.is_some();
            serde_json::json!({ "plan": plan, "requires_hash": requires_hash })
        }

        Commands::Execute {
            plan_id,
            operation_hash,
        } => {
            let plan = engine
                .confirm_and_execute(&plan_id, operation_hash.as_deref(), &cancel)
                .await?;
            serde_json::json!({ "plan": plan })
        }

        Commands::Get { id } => {
            let (document, side) = engine.get_document_with_side(&id).await?;
            serde_json::json!({ "document": document, "side": side })
        }
    };

    engine.shutdown().await;
    Ok(payload)
}

fn parse_kinds(types: Option<Vec<String>>) -> anyhow::Result<Vec<DocumentKind>> {
    let Some(types) = types else {
        return Ok(Vec::new());
    };
    types
        .iter()
        .map(|t| DocumentKind::parse(t).map_err(Into::into))
        .collect()
}

fn merge(envelope: &mut serde_json::Value, payload: serde_json::Value) {
    if let (Some(envelope), serde_json::Value::Object(payload)) =
        (envelope.as_object_mut(), payload)
    {
        for (key, value) in payload {
            envelope.insert(key, value);
        }
    }
}

fn error_kind(error: &anyhow::Error) -> String {
    error
        .downcast_ref::<Error>()
        .map(|e| e.kind().to_string())
        .unwrap_or_else(|| "internal".to_string())
}
