use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::json;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::deploy::{self, executor, verify, ExecuteOptions, Executor, RemoteLayout};
use crate::error::RunError;
use crate::models::{CollectionMetadata, SettingsSnapshot};
use crate::pipeline::{validation, BatchProcessor, ProcessOptions, ProcessReport, ResumeMode};
use crate::progress::{ProgressReporter, SilentProgress, StderrProgress};
use crate::remote::{FsObjectStore, ObjectStore};
use crate::runtime;
use crate::stats;
use crate::storage::MetadataStore;
use crate::util;

#[derive(Parser)]
#[command(author, version, about = "Photo collection processing and deployment")]
pub struct Cli {
    #[arg(short, long, action = ArgAction::Count, global = true, help = "Increase verbosity (-v, -vv)")]
    verbose: u8,
    #[arg(long, global = true, value_name = "PATH", help = "Config file (defaults to ./galleria.toml)")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Assign identities, hash and checkpoint a collection in batches
    Process(ProcessArgs),
    /// Show what a deployment would upload and delete
    Plan(PlanArgs),
    /// Upload changed content, then the metadata document
    Deploy(DeployArgs),
    /// Compare remote keys against the local document
    Verify(VerifyArgs),
    /// Local document and checkpoint state
    Status(StatusArgs),
    /// Capture spacing, devices and same-second bursts of a source collection
    Stats(StatsArgs),
}

#[derive(Args)]
pub struct ProcessArgs {
    #[arg(long, value_name = "DIR")]
    pub full_source: Option<PathBuf>,
    #[arg(long, value_name = "DIR")]
    pub web_source: Option<PathBuf>,
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,
    #[arg(long)]
    pub collection: Option<String>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    #[arg(long)]
    pub workers: Option<usize>,
    #[arg(long, allow_hyphen_values = true, help = "Hours added to every capture timestamp")]
    pub timestamp_offset: Option<i32>,
    #[arg(
        long,
        allow_hyphen_values = true,
        help = "UTC offset to stamp into published copies (13 preserves the original)"
    )]
    pub timezone: Option<i32>,
    #[arg(long, conflicts_with = "restart", help = "Continue from the latest partial batch record")]
    pub resume: bool,
    #[arg(long, help = "Discard partial batch records and start over")]
    pub restart: bool,
    #[arg(long, help = "Process only stems present in both full and web sources")]
    pub skip_validation: bool,
    #[arg(long, help = "Fail items that only filesystem creation time can order")]
    pub strict_ordering: bool,
    #[arg(long)]
    pub dry_run: bool,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Clone)]
pub struct RemoteArgs {
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,
    #[arg(long, value_name = "DIR", help = "Root directory of the object store")]
    pub store_root: Option<PathBuf>,
    #[arg(long)]
    pub prefix: Option<String>,
}

#[derive(Args)]
pub struct PlanArgs {
    #[command(flatten)]
    pub remote: RemoteArgs,
    #[arg(long, help = "Plan every local item for upload")]
    pub force: bool,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct DeployArgs {
    #[command(flatten)]
    pub remote: RemoteArgs,
    #[arg(long)]
    pub dry_run: bool,
    #[arg(long, help = "Upload every local item regardless of hashes")]
    pub force: bool,
    #[arg(long, help = "Delete remote identities absent locally after publishing")]
    pub prune: bool,
    #[arg(long)]
    pub no_verify: bool,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub remote: RemoteArgs,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct StatusArgs {
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct StatsArgs {
    #[arg(long, value_name = "DIR")]
    pub full_source: Option<PathBuf>,
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,
    #[arg(long)]
    pub json: bool,
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    runtime::init_tracing(cli.verbose)?;
    let config = Config::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Process(args) => handle_process(&config, args).await,
        Commands::Plan(args) => handle_plan(&config, args),
        Commands::Deploy(args) => handle_deploy(&config, args).await,
        Commands::Verify(args) => handle_verify(&config, args),
        Commands::Status(args) => handle_status(&config, args),
        Commands::Stats(args) => handle_stats(&config, args),
    }
}

async fn handle_process(config: &Config, args: ProcessArgs) -> Result<()> {
    let collection = &config.collection;
    let full_source = args
        .full_source
        .or_else(|| collection.full_source.clone())
        .context("no full-resolution source; pass --full-source or set [collection].full_source")?;

    let mut settings = config.settings.clone();
    if let Some(hours) = args.timestamp_offset {
        settings.timestamp_offset_hours = hours;
    }
    if let Some(hours) = args.timezone {
        settings.target_timezone_offset_hours = hours;
    }
    let snapshot = Config {
        settings,
        ..config.clone()
    }
    .snapshot()?;

    let output = args.output.unwrap_or_else(|| collection.output_dir.clone());
    let name = args.collection.unwrap_or_else(|| collection.name.clone());
    let mut options = ProcessOptions::new(&name, &full_source, &output, snapshot);
    options.web_source = args.web_source.or_else(|| collection.web_source.clone());
    options.batch_size = args.batch_size.unwrap_or(collection.batch_size);
    options.workers = args.workers.unwrap_or(collection.workers);
    options.metadata_source = collection.metadata_source;
    options.strict_ordering = args.strict_ordering || collection.strict_ordering;
    options.skip_validation = args.skip_validation || collection.skip_validation;
    options.dry_run = args.dry_run;
    options.resume = match (args.resume, args.restart) {
        (true, _) => ResumeMode::Resume,
        (_, true) => ResumeMode::Restart,
        _ => ResumeMode::Refuse,
    };

    let json = args.json;
    let processor = BatchProcessor::new(options).with_progress(reporter(json));
    let task = tokio::task::spawn_blocking(move || processor.run());
    let report = tokio::select! {
        joined = task => joined.context("processing task panicked")??,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted; rerun with --resume to continue from the last checkpoint");
            bail!("interrupted");
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_process_report(&report);
    }
    if !report.is_success() {
        bail!("{} items failed", report.failures.len());
    }
    Ok(())
}

fn print_process_report(report: &ProcessReport) {
    if let Some(validation) = &report.validation {
        println!(
            "Validation: {} matched, {} full only, {} web only",
            validation.matched,
            validation.full_only.len(),
            validation.web_only.len()
        );
    }
    if let Some(batch) = report.resumed_from_batch {
        println!("Resumed after batch {batch}");
    }
    if report.dry_run {
        println!(
            "Dry run: {} items in {} batches would be processed",
            report.planned, report.batches_total
        );
    } else {
        println!(
            "Processed {} of {} items in {} batches",
            report.processed, report.planned, report.batches_run
        );
    }
    for failure in &report.failures {
        println!("  failed: {} ({})", failure.path.display(), failure.reason);
    }
    match &report.document_path {
        Some(path) => println!("Metadata written to {}", path.display()),
        None if !report.dry_run => println!("Stopped early; rerun with --resume to continue"),
        None => {}
    }
}

fn handle_plan(config: &Config, args: PlanArgs) -> Result<()> {
    let target = RemoteTarget::resolve(config, &args.remote)?;
    target.ensure_settled()?;
    let local = target.load_local(config)?;
    deploy::plan::ensure_current(&local)?;
    let remote = deploy::fetch_remote(&*target.store, &target.layout)?;
    let plan = deploy::plan(&local, remote.as_ref(), args.force);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan.summary())?);
    } else {
        println!(
            "Plan: {} to upload, {} to delete, {} unchanged",
            plan.upload.len(),
            plan.delete.len(),
            plan.unchanged.len()
        );
        for item in &plan.upload {
            println!("  upload {}", item.identity);
        }
        for identity in &plan.delete {
            println!("  delete {identity}");
        }
    }
    Ok(())
}

async fn handle_deploy(config: &Config, args: DeployArgs) -> Result<()> {
    let target = RemoteTarget::resolve(config, &args.remote)?;
    target.ensure_settled()?;
    let local = target.load_local(config)?;
    let remote = {
        let store = target.store.clone();
        let layout = target.layout.clone();
        tokio::task::spawn_blocking(move || deploy::fetch_remote(&*store, &layout))
            .await
            .context("remote fetch task panicked")??
    };
    let plan = deploy::plan(&local, remote.as_ref(), args.force);

    let options = ExecuteOptions {
        dry_run: args.dry_run,
        retries: config.deploy.upload_retries,
        backoff: Duration::from_millis(config.deploy.retry_backoff_ms),
        workers: config.deploy.workers,
        verify: config.deploy.verify && !args.no_verify,
        prune: args.prune,
    };
    let runner = Executor::new(target.store.clone(), target.layout.clone(), &target.output, options)
        .with_progress(reporter(args.json));
    let result = runner.execute(&plan, &local).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        if result.dry_run {
            println!("Dry run: nothing was uploaded");
        }
        println!(
            "Deploy: {} uploaded, {} failed, {} unchanged, {} deleted (planned {} uploads, {} deletes)",
            result.uploaded.len(),
            result.failed.len(),
            result.unchanged,
            result.deleted.len(),
            result.planned_upload,
            result.planned_delete
        );
        for failure in &result.failed {
            println!("  failed: {} ({})", failure.key, failure.reason);
        }
        if result.metadata_published {
            println!("Metadata published to {}", target.layout.metadata_key());
        }
        if let Some(report) = &result.verification {
            print_verify_report(report);
        }
    }
    if !result.dry_run {
        executor::require_published(&result)?;
    }
    Ok(())
}

fn handle_verify(config: &Config, args: VerifyArgs) -> Result<()> {
    let target = RemoteTarget::resolve(config, &args.remote)?;
    let local = target.load_local(config)?;
    let report = verify::verify(&*target.store, &target.layout, &local.items)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_verify_report(&report);
    }
    if !report.is_clean() {
        bail!(
            "remote differs from local document ({} missing, {} orphaned)",
            report.missing.len(),
            report.orphaned.len()
        );
    }
    Ok(())
}

fn print_verify_report(report: &verify::VerifyReport) {
    println!(
        "Verify: {} expected keys, {} missing, {} orphaned",
        report.expected,
        report.missing.len(),
        report.orphaned.len()
    );
    for key in &report.missing {
        println!("  missing {key}");
    }
    for key in &report.orphaned {
        println!("  orphaned {key}");
    }
}

fn handle_status(config: &Config, args: StatusArgs) -> Result<()> {
    let output = args
        .output
        .unwrap_or_else(|| config.collection.output_dir.clone());
    let store = MetadataStore::new(&output);
    let document = store.load()?;
    let records = CheckpointStore::new(&output).list()?;
    let configured = config.snapshot()?;
    let settings_current = document
        .as_ref()
        .map(|doc| doc.settings_snapshot == configured);

    if args.json {
        let payload = json!({
            "output_dir": output.to_string_lossy(),
            "document": document.as_ref().map(|doc| json!({
                "collection_name": doc.collection_name,
                "generated_at": doc.generated_at,
                "items": doc.items.len(),
                "settings_snapshot": doc.settings_snapshot,
                "stale_items": doc.stale_items().len(),
            })),
            "settings_current": settings_current,
            "partial_records": records
                .iter()
                .map(|(_, path)| path.to_string_lossy().to_string())
                .collect::<Vec<_>>(),
            "version": util::tool_version(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!("Output: {}", output.display());
    match &document {
        Some(doc) => {
            println!(
                "Collection: {} ({} items, generated {})",
                doc.collection_name,
                doc.items.len(),
                doc.generated_at
            );
            println!("Settings: {}", describe_settings(&doc.settings_snapshot));
            if settings_current == Some(false) {
                println!(
                    "Configured settings differ ({}); rerun process before deploying",
                    describe_settings(&configured)
                );
            }
        }
        None => println!("No collection metadata yet"),
    }
    if records.is_empty() {
        println!("No partial batch records");
    } else {
        println!(
            "{} partial batch records; run process with --resume or --restart",
            records.len()
        );
    }
    Ok(())
}

fn handle_stats(config: &Config, args: StatsArgs) -> Result<()> {
    let full_source = args
        .full_source
        .or_else(|| config.collection.full_source.clone())
        .context("no full-resolution source; pass --full-source or set [collection].full_source")?;
    let output = args
        .output
        .unwrap_or_else(|| config.collection.output_dir.clone());
    let images = validation::list_images(&util::resolve_dir(&full_source)?)?;
    let source = config.collection.metadata_source.source();
    let summary = stats::analyze(&images, &*source, &config.snapshot()?);
    let processed = stats::count_variants(&output)?;

    if args.json {
        let payload = json!({
            "source": full_source.to_string_lossy(),
            "reader": source.name(),
            "stats": summary,
            "processed": processed,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!(
        "Source: {} ({} photos, {} bytes)",
        full_source.display(),
        summary.files,
        summary.total_bytes
    );
    println!(
        "Capture times: {} read, {} missing",
        summary.with_timestamp,
        summary.without_timestamp.len()
    );
    if let (Some(earliest), Some(latest)) = (summary.earliest, summary.latest) {
        println!("Span: {earliest} to {latest}");
    }
    if let (Some(mean), Some(longest)) = (summary.mean_gap_seconds, summary.longest_gap_seconds) {
        println!("Gaps: {mean:.1}s average, {longest}s longest");
    }
    for device in &summary.devices {
        println!("  {} {}: {} photos", device.tag, device.camera, device.count);
    }
    for (zone, count) in &summary.timezones {
        println!("  timezone {zone}: {count} photos");
    }
    println!(
        "Same-second groups: {} ({} photos)",
        summary.tie_groups, summary.tied_items
    );
    if let Some(burst) = &summary.largest_burst {
        println!(
            "Largest burst: {} photos at {} ({})",
            burst.size, burst.timestamp, burst.device_tag
        );
    }
    match processed {
        Some(counts) => {
            let parts: Vec<String> = counts
                .iter()
                .map(|(variant, count)| format!("{count} {variant}"))
                .collect();
            println!("Processed: {}", parts.join(", "));
        }
        None => println!("Processed: nothing at {}", output.display()),
    }
    Ok(())
}

fn describe_settings(settings: &SettingsSnapshot) -> String {
    format!(
        "timestamp offset {:+}h, timezone {}",
        settings.timestamp_offset_hours, settings.timezone
    )
}

fn reporter(json: bool) -> Arc<dyn ProgressReporter> {
    if json {
        Arc::new(SilentProgress)
    } else {
        Arc::new(StderrProgress)
    }
}

/// Object store, key layout and local output directory for the remote
/// commands.
struct RemoteTarget {
    store: Arc<dyn ObjectStore>,
    layout: RemoteLayout,
    output: PathBuf,
}

impl RemoteTarget {
    fn resolve(config: &Config, args: &RemoteArgs) -> Result<Self> {
        let root = args
            .store_root
            .clone()
            .or_else(|| config.deploy.store_root.clone())
            .context("no object store configured; pass --store-root or set [deploy].store_root")?;
        let prefix = args.prefix.as_deref().unwrap_or(&config.deploy.prefix);
        Ok(Self {
            store: Arc::new(FsObjectStore::new(&root)),
            layout: RemoteLayout::new(prefix),
            output: args
                .output
                .clone()
                .unwrap_or_else(|| config.collection.output_dir.clone()),
        })
    }

    /// An interrupted processing run has already cleared the variant
    /// directories the last document points at.
    fn ensure_settled(&self) -> Result<()> {
        let records = CheckpointStore::new(&self.output).list()?;
        if records.is_empty() {
            return Ok(());
        }
        Err(RunError::PartialBatchConflict {
            records: records.into_iter().map(|(_, path)| path).collect(),
        }
        .into())
    }

    fn load_local(&self, config: &Config) -> Result<CollectionMetadata> {
        let doc = load_document(&self.output)?;
        if config.snapshot()? != doc.settings_snapshot {
            tracing::warn!("configured settings differ from the processed document; rerun process to apply them");
        }
        Ok(doc)
    }
}

fn load_document(output: &Path) -> Result<CollectionMetadata> {
    let store = MetadataStore::new(output);
    match store.load()? {
        Some(doc) => Ok(doc),
        None => bail!(
            "no collection metadata at {}; run process first",
            store.document_path().display()
        ),
    }
}
