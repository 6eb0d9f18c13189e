//! kgmerge - merge extracted entities and relations into a knowledge graph.
//!
//! # Configuration
//!
//! The engine configuration is read once at startup, from `--config`, from
//! the file named by `KGMERGE_CONFIG`, or from `~/.config/kgmerge/config.yaml`.
//! A `.env` file in the working directory is loaded first. These variables
//! override file settings:
//!
//! - `KGMERGE_STORE_PROVIDER` / `KGMERGE_STORE_URL` - `memory` or `kuzu`, and the Kuzu API URL
//! - `KGMERGE_EMBEDDER` / `KGMERGE_EMBEDDING_MODEL` / `KGMERGE_EMBEDDING_URL`
//! - `KGMERGE_MAX_CONCURRENT_BATCHES`
//! - `RUST_LOG` - log filter, default `info`
//!
//! # Usage
//!
//! ```text
//! kgmerge merge extracted/ --format json
//! kgmerge check-config --config kgmerge.yaml
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kgmerge_core::{EngineConfig, MergeEngine, MergePipeline, PipelineReport};
use kgmerge_embeddings::EmbedderFactory;
use kgmerge_graph_stores::GraphStoreFactory;

#[derive(Parser)]
#[command(name = "kgmerge")]
#[command(author, version, about = "Merge extracted entities and relations into a knowledge graph", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine configuration file (TOML, JSON or YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge an extraction file or a directory of `*.json` files
    Merge {
        /// File or directory to merge
        path: PathBuf,
        /// Batches merged at once (overrides the config)
        #[arg(long)]
        concurrency: Option<usize>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Load and validate the configuration, then print a summary
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();

    // Logs go to stderr; stdout carries the report
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::CheckConfig => {
            print_config_summary(&config);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Merge {
            path,
            concurrency,
            format,
        } => {
            let report = run_merge(config, &path, concurrency).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Text => print_report(&report),
            }
            Ok(if report.is_clean() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            })
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => {
            let mut config = EngineConfig::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            config.apply_overrides(|key| std::env::var(key).ok())?;
            config.validate()?;
            config
        }
        None => EngineConfig::from_env().context("Failed to load config")?,
    };
    Ok(config)
}

async fn run_merge(config: EngineConfig, path: &Path, concurrency: Option<usize>) -> Result<PipelineReport> {
    let config = Arc::new(config);
    let store = GraphStoreFactory::create(&config)?;
    let embedder = EmbedderFactory::from_config(&config.embedder)?;
    let engine = Arc::new(MergeEngine::with_embedder(config.clone(), store, embedder));

    let mut pipeline = MergePipeline::new(engine);
    if let Some(n) = concurrency {
        pipeline = pipeline.with_concurrency(n);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing the current group and stopping");
            on_signal.cancel();
        }
    });

    tracing::info!("Merging {}", path.display());
    let report = pipeline
        .process_path(path, &cancel)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(report)
}

fn print_config_summary(config: &EngineConfig) {
    println!("store:      {} ({})", config.graph_store.provider, config.graph_store.url);
    println!("embedder:   {} ({})", config.embedder.provider, config.embedder.config.model);
    println!("batches:    {} at a time", config.max_concurrent_batches);
    println!(
        "retry:      {} retries, {}ms..{}ms",
        config.retry.max_retries, config.retry.initial_delay_ms, config.retry.max_delay_ms
    );
    for (entity_type, schema) in &config.schema {
        let rules = config.rules_for(entity_type);
        println!(
            "{:<12}{} fields, {} match rules",
            entity_type,
            schema.fields().count(),
            rules.len()
        );
        for rule in rules {
            println!(
                "  [{}] {:?} {} -> {} ({:.2})",
                rule.priority, rule.kind, rule.source_field, rule.storage_field, rule.confidence
            );
        }
    }
}

fn print_report(report: &PipelineReport) {
    for batch in &report.batches {
        println!(
            "{}: {} groups ({} created, {} merged, {} failed), {} relations ({} skipped, {} failed){}",
            batch.provenance_id,
            batch.groups_processed,
            batch.entities_created,
            batch.entities_merged,
            batch.groups_failed,
            batch.relations_processed,
            batch.relations_skipped,
            batch.relations_failed,
            if batch.cancelled { " [cancelled]" } else { "" }
        );
        for error in &batch.errors {
            println!("  {} {}: {}", error.code, error.scope, error.message);
        }
    }
    for input in &report.failed_inputs {
        println!("skipped {}: {}", input.scope, input.message);
    }

    let totals = &report.totals;
    println!(
        "\n{} batches in {}ms: {} entities created, {} merged, {} groups failed, {} relations written",
        totals.batches,
        report.elapsed_ms,
        totals.entities_created,
        totals.entities_merged,
        totals.groups_failed,
        totals.relations_processed
    );
}
