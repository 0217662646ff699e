// MMP Ingest - command line front end
// import a plan file, sweep stale uploads, inspect the registry and saved plans

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mmp_ingest::{
    resolve_uploader, sweep_stale_pending, IngestConfig, LocalObjectStore, PlanIngestor,
    PlanMetadata, RecordStore, SqliteRecordStore, TracingProgress, UploadRequest, UploadResult,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "mmp-ingest", version, about = "Monitoring plan ingestion")]
struct Cli {
    /// SQLite database file
    #[arg(long, env = "MMP_DATABASE_PATH")]
    database: Option<PathBuf>,

    /// Root directory for stored plan files
    #[arg(long, env = "MMP_STORAGE_DIR")]
    storage: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a plan file
    Import {
        file: PathBuf,

        #[arg(long)]
        project: Option<String>,

        /// Plan month, e.g. 2025-03
        #[arg(long)]
        month: Option<String>,

        /// Hub the file belongs to (rows naming another hub are rejected)
        #[arg(long)]
        hub: Option<String>,

        /// Plan name (defaults to the file name)
        #[arg(long)]
        name: Option<String>,

        #[arg(long, env = "MMP_UPLOADER_ID", default_value = "cli")]
        uploader: String,

        /// Where to write the issues report when validation fails
        #[arg(long)]
        report: Option<PathBuf>,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove plans stuck in pending and registry sites nothing uses
    Sweep {
        /// Override the pending TTL (seconds)
        #[arg(long)]
        ttl_secs: Option<u64>,
    },

    /// List registry sites
    Sites {
        /// Only codes containing this text
        #[arg(long)]
        filter: Option<String>,
    },

    /// Show a saved plan and its entries
    Show { plan_id: Uuid },
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

    let mut config = IngestConfig::from_env();
    if let Some(path) = cli.database {
        config = config.with_database_path(path);
    }
    if let Some(root) = cli.storage {
        config = config.with_storage_root(root);
    }

    let store = Arc::new(SqliteRecordStore::open(&config.database_path)?);
    let objects = Arc::new(LocalObjectStore::new(config.storage_root.clone()));

    match cli.command {
        Command::Import {
            file,
            project,
            month,
            hub,
            name,
            uploader,
            report,
            json,
        } => {
            let metadata = PlanMetadata {
                display_name: name,
                hub,
                month,
                owner_project_id: project,
            };
            let uploader = resolve_uploader(store.as_ref(), &uploader).await;
            let ingestor = PlanIngestor::new(config, store, objects);
            run_import(&ingestor, file, metadata, &uploader, report, json).await
        }
        Command::Sweep { ttl_secs } => {
            let ttl = ttl_secs.map(Duration::from_secs).unwrap_or(config.pending_ttl);
            let report = sweep_stale_pending(store.as_ref(), objects.as_ref(), ttl).await?;
            println!(
                "🧹 Examined {} stale plan(s), removed {}, released {} unused site(s), {} failure(s)",
                report.examined,
                report.removed_plans.len(),
                report.released_sites,
                report.failures
            );
            Ok(())
        }
        Command::Sites { filter } => {
            let filter = filter.map(|f| f.to_uppercase());
            let sites = store.list_sites().await?;
            for site in sites.iter().filter(|s| {
                filter
                    .as_deref()
                    .map_or(true, |f| s.site_code.to_uppercase().contains(f))
            }) {
                println!(
                    "{:<24} {:<32} {:<20} {:<20} {:>4}",
                    site.site_code,
                    site.site_name,
                    site.state.as_deref().unwrap_or("-"),
                    site.locality.as_deref().unwrap_or("-"),
                    site.mmp_count
                );
            }
            println!("\n{} site(s)", sites.len());
            Ok(())
        }
        Command::Show { plan_id } => {
            let Some(plan) = store.get_plan(plan_id).await? else {
                bail!("plan {} not found", plan_id);
            };
            let entries = store.list_entries(plan_id).await?;
            println!("📋 {} ({})", plan.name, plan.mmp_id);
            println!("   status:   {}", plan.status.as_str());
            println!("   file:     {}", plan.original_filename);
            println!("   entries:  {}/{}", plan.processed_entries, plan.entries);
            println!("   uploaded: {} by {}", plan.uploaded_at, plan.uploaded_by_name);
            for e in &entries {
                let link = &e.registry_linkage;
                println!(
                    "   row {:>4}  {:<24} → {} ({}, {} confidence){}",
                    e.entry.source_row,
                    e.entry.display_name(),
                    e.registry_site_id,
                    link.match_tier.as_str(),
                    link.confidence_level(),
                    if e.needs_review() { "  ⚠️ review" } else { "" }
                );
            }
            Ok(())
        }
    }
}

async fn run_import(
    ingestor: &PlanIngestor,
    file: PathBuf,
    metadata: PlanMetadata,
    uploader: &mmp_ingest::UploaderContext,
    report_path: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let bytes = tokio::fs::read(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("import path has no file name")?;

    // Ctrl+C stops before the next batch; written batches are rolled back
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling upload");
            on_signal.cancel();
        }
    });

    let request = UploadRequest::new(&file_name, bytes).with_metadata(metadata);
    let result = ingestor
        .ingest(request, uploader, Some(&TracingProgress), &cancel)
        .await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    if let (Some(path), Some(csv)) = (report_path, result.issues_report.as_ref()) {
        tokio::fs::write(&path, csv)
            .await
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        println!("📝 Issues report written to {}", path.display());
    }

    if !result.success {
        bail!(
            "upload failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn print_result(result: &UploadResult) {
    if let Some(validation) = &result.validation {
        println!("🔍 {}", validation.headline());
    }

    match (&result.plan, &result.registry) {
        (Some(plan), Some(registry)) => {
            println!(
                "✅ {} saved as {} with {} entries",
                plan.plan.name, plan.plan.mmp_id, plan.plan.processed_entries
            );
            println!(
                "   registry: {} created, {} linked, {} to review",
                registry.created, registry.linked, registry.review_required
            );
            println!("   plan id: {}", plan.plan.id);
        }
        _ => {
            println!(
                "❌ {}",
                result.error.as_deref().unwrap_or("upload failed")
            );
        }
    }

    for warning in &result.warnings {
        println!("   ⚠️  {}", warning);
    }
}
