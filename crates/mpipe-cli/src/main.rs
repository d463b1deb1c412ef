use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use mpipe_core::{SourceUpdate, TargetSet};
use mpipe_sync::{IndexOptions, ReindexOptions, SyncConfig};
use serde_json::Value as JsonValue;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "mpipe-cli")]
#[command(about = "Bibliographic master pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write one source slot of a record.
    Ingest {
        bibcode: String,
        /// bib_data (or metadata), nonbib_data, orcid_claims, fulltext, metrics, augments
        slot: String,
        /// JSON payload
        payload: String,
    },
    /// Run the pipeline for the given records.
    Index {
        #[arg(required = true)]
        bibcodes: Vec<String>,
        /// Any of s (solr), m (metrics), l (links)
        #[arg(long, default_value = "sml")]
        targets: String,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        ignore_checksums: bool,
        #[arg(long)]
        commit: bool,
    },
    /// Reindex records updated since the last run.
    Reindex {
        /// RFC 3339 start of the window; defaults to the stored stamp.
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long, default_value = "sml")]
        targets: String,
    },
    /// Resubmit records whose last dispatch failed.
    Reconcile {
        #[arg(long)]
        batch_size: Option<usize>,
    },
    Delete {
        bibcode: String,
    },
    Rename {
        old: String,
        new: String,
    },
    /// Print a record, its mappings and what each target would receive.
    Diagnostics {
        bibcode: String,
    },
    /// Send every record to another Solr collection.
    RebuildCollection {
        collection: String,
    },
    Migrate,
    /// Run reconciliation on RECONCILE_CRON until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Reconcile { batch_size: None }) {
        Commands::Ingest {
            bibcode,
            slot,
            payload,
        } => {
            let payload: JsonValue =
                serde_json::from_str(&payload).context("parsing payload as JSON")?;
            let update = SourceUpdate::named(&slot, payload)?;
            let pipeline = mpipe_sync::build_pipeline(&config).await?;
            let record = pipeline.ingest(&bibcode, update).await?;
            println!("ingested: bibcode={} id={} updated={}", record.bibcode, record.id, record.updated);
        }
        Commands::Index {
            bibcodes,
            targets,
            force,
            ignore_checksums,
            commit,
        } => {
            let pipeline = mpipe_sync::build_pipeline(&config).await?;
            let options = IndexOptions {
                targets: TargetSet::from_letters(&targets),
                force,
                ignore_checksums,
                commit,
                ..IndexOptions::default()
            };
            let report = pipeline.index_records(&bibcodes, options).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Reindex {
            since,
            force,
            batch_size,
            targets,
        } => {
            let pipeline = mpipe_sync::build_pipeline(&config).await?;
            let report = pipeline
                .reindex_since(ReindexOptions {
                    since,
                    force,
                    batch_size: batch_size.unwrap_or(config.index_batch_size),
                    targets: TargetSet::from_letters(&targets),
                })
                .await?;
            println!(
                "reindex complete: since={} batches={} delivered={} failed={}",
                report.since,
                report.batches,
                report.index.delivered_total(),
                report.index.failed_total()
            );
        }
        Commands::Reconcile { batch_size } => {
            let pipeline = mpipe_sync::build_pipeline(&config).await?;
            let report = pipeline
                .reconcile(batch_size.unwrap_or(config.reconcile_batch_size))
                .await?;
            println!(
                "reconcile complete: requested={} delivered={} failed={}",
                report.requested,
                report.delivered_total(),
                report.failed_total()
            );
        }
        Commands::Delete { bibcode } => {
            let pipeline = mpipe_sync::build_pipeline(&config).await?;
            let report = pipeline.delete(&bibcode).await?;
            println!(
                "delete complete: bibcode={} existed={} solr={:?} metrics={:?}",
                report.bibcode,
                report.record.is_some(),
                report.search_index_deleted,
                report.metrics_row_deleted
            );
        }
        Commands::Rename { old, new } => {
            let pipeline = mpipe_sync::build_pipeline(&config).await?;
            let record = pipeline.rename(&old, &new).await?;
            println!("renamed: {old} -> {} (id={})", record.bibcode, record.id);
        }
        Commands::Diagnostics { bibcode } => {
            let pipeline = mpipe_sync::build_pipeline(&config).await?;
            let diagnostics = pipeline.diagnostics(&bibcode).await?;
            println!("{}", serde_json::to_string_pretty(&diagnostics)?);
        }
        Commands::RebuildCollection { collection } => {
            let report = mpipe_sync::run_rebuild_collection_from_env(&collection).await?;
            println!(
                "rebuild complete: collection={collection} delivered={} failed={}",
                report.delivered_total(),
                report.failed_total()
            );
        }
        Commands::Migrate => {
            mpipe_sync::run_migrations(&config).await?;
        }
        Commands::Schedule => {
            let pipeline = Arc::new(mpipe_sync::build_pipeline(&config).await?);
            let Some(sched) = mpipe_sync::maybe_build_scheduler(&config, pipeline).await? else {
                anyhow::bail!("scheduler disabled; set MPIPE_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.reconcile_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down");
        }
    }

    Ok(())
}
