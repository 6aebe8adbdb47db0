use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tripload_core::LoadOutcome;
use tripload_ingest::{
    build_blob_store, build_ledger, build_runner, load_rules, migrate, IngestConfig, LogFormat,
};
use tripload_rules::{FieldValue, RuleTable};
use tripload_storage::{object_name_for_url, BlobError, HttpClientConfig, HttpFetcher};

static LOGGING: Once = Once::new();

#[derive(Debug, Parser)]
#[command(name = "tripload")]
#[command(about = "Normalize historical NYC taxi trip files and load each one exactly once")]
struct Cli {
    /// YAML config file; `./config.yml` is used when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load the given objects, or every eligible object in the container.
    Load {
        file_ids: Vec<String>,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Print the ingestion ledger.
    Status,
    /// Create the Postgres ledger and trips tables.
    Migrate,
    /// Download files and upload them into the container.
    Mirror {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Validate a dialect rule file and print the canonical fields it maps.
    Rules {
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn init_logging(default_level: &str, format: LogFormat) {
    LOGGING.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty().with_writer(std::io::stderr))
                    .init();
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config =
        IngestConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_logging(&config.log_level, config.log_format);

    let command = cli.command.unwrap_or(Commands::Load {
        file_ids: Vec::new(),
        workers: None,
    });

    match command {
        Commands::Load { file_ids, workers } => {
            if let Some(workers) = workers {
                config.loader.workers = workers.max(1);
            }
            run_load(&config, file_ids).await?;
        }
        Commands::Status => print_status(&config).await?,
        Commands::Migrate => {
            let created = migrate(&config).await?;
            if created.is_empty() {
                println!("nothing to migrate: neither ledger nor store is postgres-backed");
            } else {
                println!("migrate complete: tables={}", created.join(","));
            }
        }
        Commands::Mirror { urls } => run_mirror(&config, urls).await?,
        Commands::Rules { path } => {
            let table = match path {
                Some(path) => RuleTable::from_path(&path)?,
                None => load_rules(&config)?,
            };
            print_rules(&table);
        }
    }

    Ok(())
}

async fn run_load(config: &IngestConfig, file_ids: Vec<String>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown requested; in-flight loads stop at the next batch");
            shutdown_tx.send_replace(true);
        }
    });

    let runner = build_runner(config, shutdown_rx).await?;
    let summary = if file_ids.is_empty() {
        runner.run_container().await?
    } else {
        runner.run(file_ids).await?
    };

    for report in &summary.reports {
        match &report.outcome {
            LoadOutcome::Failed {
                kind,
                message,
                partial,
            } => println!(
                "{:<9} {} kind={kind:?} partial={partial} error={message}",
                report.outcome.label(),
                report.file_id
            ),
            LoadOutcome::Skipped { reason } => println!(
                "{:<9} {} reason={reason:?}",
                report.outcome.label(),
                report.file_id
            ),
            LoadOutcome::Succeeded => println!(
                "{:<9} {} rows={} rejected={} warnings={}",
                report.outcome.label(),
                report.file_id,
                report.stats.rows_inserted,
                report.stats.rows_rejected,
                report.stats.field_warnings
            ),
        }
    }
    println!(
        "load complete: run_id={} files={} succeeded={} skipped={} failed={} partial={} rows={} rejected={}",
        summary.run_id,
        summary.files,
        summary.succeeded,
        summary.skipped,
        summary.failed,
        summary.partial,
        summary.rows_inserted,
        summary.rows_rejected
    );
    Ok(())
}

async fn print_status(config: &IngestConfig) -> Result<()> {
    let ledger = build_ledger(config).await?;
    let entries = ledger.entries().await.context("reading ledger")?;
    if entries.is_empty() {
        println!("ledger is empty");
    }
    for entry in entries {
        println!(
            "{:<11} attempts={} updated={} {}{}",
            entry.state.as_str(),
            entry.attempts,
            entry.updated_at.format("%Y-%m-%dT%H:%M:%SZ"),
            entry.file_id,
            entry
                .last_error
                .map(|err| format!(" last_error={err}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn run_mirror(config: &IngestConfig, urls: Vec<String>) -> Result<()> {
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.loader.fetch_timeout_secs),
        user_agent: Some(format!("tripload/{}", env!("CARGO_PKG_VERSION"))),
        concurrency: config.loader.workers,
        backoff: config.backoff(),
    })?;
    let blobs = build_blob_store(config);
    let container = Arc::new(config.storage.container.clone());

    let existing: BTreeSet<String> = match blobs.list_objects(&container).await {
        Ok(objects) => objects.into_iter().collect(),
        Err(BlobError::ContainerNotFound(_)) => BTreeSet::new(),
        Err(err) => return Err(err).context("listing container"),
    };

    let mut tasks = JoinSet::new();
    for url in urls {
        let Some(name) = object_name_for_url(&url) else {
            warn!(%url, "no object name in url; skipping");
            continue;
        };
        if existing.contains(&name) {
            println!("present  {name}");
            continue;
        }

        let fetcher = fetcher.clone();
        let blobs = Arc::clone(&blobs);
        let container = Arc::clone(&container);
        tasks.spawn(async move {
            let fetched = fetcher
                .fetch_bytes(&url)
                .await
                .with_context(|| format!("downloading {url}"))?;
            let stored = blobs
                .put(&container, &name, Box::pin(std::io::Cursor::new(fetched.body)))
                .await
                .with_context(|| format!("uploading {name}"))?;
            anyhow::Ok(stored)
        });
    }

    let mut failed = 0usize;
    while let Some(joined) = tasks.join_next().await {
        match joined.context("mirror task")? {
            Ok(stored) => println!(
                "uploaded {} bytes={} sha256={}",
                stored.file_id, stored.byte_size, stored.sha256
            ),
            Err(err) => {
                failed += 1;
                warn!(error = ?err, "mirror failed");
            }
        }
    }
    println!("mirror complete: failed={failed}");
    Ok(())
}

fn print_rules(table: &RuleTable) {
    for rule in table.rules() {
        let columns: Vec<&str> = rule.candidates.iter().map(|c| c.column.as_str()).collect();
        let default = match &rule.default {
            None => "required".to_string(),
            Some(FieldValue::Null) => "default=null".to_string(),
            Some(FieldValue::Int(v)) => format!("default={v}"),
            Some(FieldValue::Float(v)) => format!("default={v}"),
            Some(FieldValue::Text(v)) => format!("default={v:?}"),
            Some(FieldValue::Timestamp(v)) => format!("default={v}"),
        };
        println!("{:<22} <- {} ({default})", rule.field.name(), columns.join(", "));
    }
    println!("rules ok: fields={}", table.known_canonical_fields().len());
}
