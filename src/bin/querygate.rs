//! `querygate` command line
//!
//! Runs queries through the gateway against a SPARQL endpoint and manages the
//! result cache. Every command prints JSON on stdout; logs go to stderr or the
//! configured log file.
//!
//! ```bash
//! querygate query "SELECT ?s WHERE { ?s ?p ?o } LIMIT 10"
//! querygate query --timeout 5 --param 42 "SELECT ?s WHERE { ?s ?p {{1}} }"
//! querygate get 3f2a...
//! querygate check-size
//! querygate clear --older-than-secs 86400
//! ```

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use querygate::config::LoggingConfig;
use querygate::{Config, FsBlobStore, Query, QueryService, Scalar, SparqlHttpEngine, SystemClock};

static TRACE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

#[derive(Debug, Parser)]
#[command(
    name = "querygate",
    about = "Query-execution gateway for SPARQL endpoints."
)]
struct Cli {
    /// Configuration file (defaults to config.toml + config.local.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute a query and print the full result or its summary
    Query(QueryArgs),
    /// Print a cached result by id
    Get { id: String },
    /// Report cache size and warnings
    CheckSize,
    /// Delete cache entries
    Clear {
        /// Only delete entries older than this many seconds
        #[arg(long)]
        older_than_secs: Option<u64>,
    },
}

#[derive(Debug, Args)]
struct QueryArgs {
    text: String,

    /// Positional parameter bound to `{{N}}` placeholders, in order
    #[arg(long = "param", value_name = "VALUE")]
    params: Vec<String>,

    /// Timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Also print suggestions from past successful queries of the same kind
    #[arg(long, default_value_t = 0)]
    suggest: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(&path.to_string_lossy()),
        None => Config::load(),
    }
    .context("loading configuration")?;

    init_tracing(&config.logging);

    let engine = Arc::new(SparqlHttpEngine::new(&config.engine)?);
    let store = Arc::new(
        FsBlobStore::new(&config.cache.dir)
            .with_context(|| format!("opening cache dir {}", config.cache.dir.display()))?,
    );
    let service = QueryService::new(config, engine, store, Arc::new(SystemClock))?;

    match cli.command {
        Command::Query(args) => {
            let mut query = Query::new(&args.text)
                .with_parameters(args.params.iter().map(String::as_str).map(parse_param).collect());
            if let Some(secs) = args.timeout {
                query = query.with_timeout(secs);
            }

            match service.execute(&query).await {
                Ok(delivery) => print_json(&delivery)?,
                Err(e) => {
                    print_json(&serde_json::json!({
                        "error": e.to_string(),
                        "kind": e.kind(),
                        "status": e.status_hint(),
                        "hint": e.hint(),
                    }))?;
                    std::process::exit(1);
                }
            }

            if args.suggest > 0 {
                print_json(&service.suggest(&args.text, args.suggest))?;
            }
        }
        Command::Get { id } => print_json(&service.get(&id)?)?,
        Command::CheckSize => print_json(&service.check_size())?,
        Command::Clear { older_than_secs } => {
            let removed = service.clear(older_than_secs.map(Duration::from_secs))?;
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
    }

    Ok(())
}

/// Integers, floats and booleans are typed; `<...>` is an IRI; anything
/// else is a plain string.
fn parse_param(raw: &str) -> Scalar {
    if let Ok(i) = raw.parse::<i64>() {
        Scalar::Int(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        Scalar::Float(f)
    } else if let Ok(b) = raw.parse::<bool>() {
        Scalar::Bool(b)
    } else if let Some(iri) = raw.strip_prefix('<').and_then(|r| r.strip_suffix('>')) {
        Scalar::iri(iri)
    } else {
        Scalar::string(raw)
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing(logging_config: &LoggingConfig) {
    // RUST_LOG takes precedence over the configured level
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&logging_config.level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let (non_blocking, guard) = match &logging_config.file {
        Some(path) => match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            Ok(f) => tracing_appender::non_blocking(f),
            Err(e) => {
                eprintln!("ERROR: Unable to open log file '{}': {e}", path.display());
                tracing_appender::non_blocking(std::io::stderr())
            }
        },
        None => tracing_appender::non_blocking(std::io::stderr()),
    };
    let _ = TRACE_GUARD.set(guard);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(non_blocking);

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = if logging_config.format == "json" {
        Box::new(builder.json().finish())
    } else {
        Box::new(builder.compact().finish())
    };

    let _ = tracing::subscriber::set_global_default(subscriber);
}
