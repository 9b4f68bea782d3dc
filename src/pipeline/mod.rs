//! Batch processor: turns a source collection into a collection metadata
//! document plus local published variants, checkpointing after every batch.

pub mod validation;
pub mod variants;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use serde::Serialize;

use crate::checkpoint::CheckpointStore;
use crate::error::{ItemError, RunError};
use crate::hashing::DualHasher;
use crate::identity::{AssignedIdentity, Candidate, IdentityAssigner};
use crate::metadata::{MetadataSource, MetadataSourceKind};
use crate::models::{
    CollectionMetadata, Item, ItemFailure, PartialBatchRecord, SettingsSnapshot,
};
use crate::progress::{ProgressEvent, ProgressReporter, SilentProgress};
use crate::storage::MetadataStore;
use crate::transform::{ExifTransformer, PreviewThumbnailer, Thumbnailer, Transformer};
use crate::util;

pub use validation::ValidationReport;
use variants::VariantWriter;

/// What to do with partial batch records left by an unfinished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResumeMode {
    /// Fail before doing any work.
    #[default]
    Refuse,
    Resume,
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    NotStarted,
    BatchInProgress(usize),
    BatchComplete(usize),
    AllBatchesComplete,
    FinalDocumentWritten,
    Done,
}

#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub collection: String,
    pub full_source: PathBuf,
    pub web_source: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub settings: SettingsSnapshot,
    pub batch_size: usize,
    pub workers: usize,
    pub metadata_source: MetadataSourceKind,
    pub strict_ordering: bool,
    pub skip_validation: bool,
    pub resume: ResumeMode,
    pub dry_run: bool,
    /// Stop after this many batches in this invocation, leaving the
    /// checkpoints in place for a later `--resume`.
    pub max_batches: Option<usize>,
}

impl ProcessOptions {
    pub fn new(
        collection: &str,
        full_source: &Path,
        output_dir: &Path,
        settings: SettingsSnapshot,
    ) -> Self {
        Self {
            collection: collection.to_string(),
            full_source: full_source.to_path_buf(),
            web_source: None,
            output_dir: output_dir.to_path_buf(),
            settings,
            batch_size: 50,
            workers: 4,
            metadata_source: MetadataSourceKind::default(),
            strict_ordering: false,
            skip_validation: false,
            resume: ResumeMode::Refuse,
            dry_run: false,
            max_batches: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessReport {
    pub collection: String,
    pub dry_run: bool,
    pub state: BatchState,
    /// Items that passed metadata scanning and identity assignment.
    pub planned: usize,
    pub processed: usize,
    pub batches_total: usize,
    pub batches_run: usize,
    pub resumed_from_batch: Option<usize>,
    pub failures: Vec<ItemFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_path: Option<PathBuf>,
}

impl ProcessReport {
    pub fn is_complete(&self) -> bool {
        self.state == BatchState::Done
    }

    pub fn is_success(&self) -> bool {
        (self.dry_run || self.is_complete()) && self.failures.is_empty()
    }
}

/// Per-run lookups shared read-only by the workers.
struct RunContext {
    web_by_stem: Option<BTreeMap<String, PathBuf>>,
    writer: VariantWriter,
}

pub struct BatchProcessor {
    options: ProcessOptions,
    source: Box<dyn MetadataSource>,
    hasher: DualHasher,
    thumbnailer: Arc<dyn Thumbnailer>,
    progress: Arc<dyn ProgressReporter>,
}

impl BatchProcessor {
    pub fn new(options: ProcessOptions) -> Self {
        let source = options.metadata_source.source();
        Self {
            options,
            source,
            hasher: DualHasher::new(Arc::new(ExifTransformer)),
            thumbnailer: Arc::new(PreviewThumbnailer::default()),
            progress: Arc::new(SilentProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.hasher = DualHasher::new(transformer);
        self
    }

    pub fn with_thumbnailer(mut self, thumbnailer: Arc<dyn Thumbnailer>) -> Self {
        self.thumbnailer = thumbnailer;
        self
    }

    pub fn run(&self) -> Result<ProcessReport> {
        let opts = &self.options;
        if opts.batch_size == 0 {
            bail!("batch size must be at least 1");
        }
        let full_source = util::resolve_dir(&opts.full_source)?;
        let full_images = validation::list_images(&full_source)?;

        let mut report = ProcessReport {
            collection: opts.collection.clone(),
            dry_run: opts.dry_run,
            state: BatchState::NotStarted,
            planned: 0,
            processed: 0,
            batches_total: 0,
            batches_run: 0,
            resumed_from_batch: None,
            failures: Vec::new(),
            validation: None,
            document_path: None,
        };

        let (sources, web_by_stem) = match &opts.web_source {
            Some(web) => {
                let web_images = validation::list_images(&util::resolve_dir(web)?)?;
                let (check, pairs) = validation::match_collections(&full_images, &web_images);
                tracing::info!(
                    matched = check.matched,
                    full_only = check.full_only.len(),
                    web_only = check.web_only.len(),
                    "validated collections"
                );
                if !check.is_consistent() && !opts.skip_validation {
                    bail!(
                        "full and web collections differ ({} full only, {} web only); pass --skip-validation to process matched files only",
                        check.full_only.len(),
                        check.web_only.len()
                    );
                }
                let matched: Vec<PathBuf> = full_images
                    .into_iter()
                    .filter(|path| pairs.contains_key(&validation::stem(path)))
                    .collect();
                report.validation = Some(check);
                (matched, Some(pairs))
            }
            None => (full_images, None),
        };

        let checkpoints = CheckpointStore::new(&opts.output_dir);
        let resumed = self.resolve_startup(&checkpoints)?;

        let store = MetadataStore::new(&opts.output_dir);
        let previous = match store.load() {
            Ok(doc) => doc,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "ignoring unreadable previous metadata");
                None
            }
        };

        let (candidates, mut scan_failures) = self.scan(&sources);
        let (planned, ambiguous) = IdentityAssigner::new(&opts.collection, opts.settings)
            .strict(opts.strict_ordering)
            .previous(previous.as_ref())
            .assign(candidates);
        scan_failures.extend(ambiguous.iter().map(failure));

        let total = planned.len();
        report.planned = total;
        report.batches_total = total.div_ceil(opts.batch_size);

        let (mut document, mut item_failures, mut position, mut batch_number) = match resumed {
            Some(record) => {
                if let Err(reason) = check_resumable(&record, &planned) {
                    return Err(RunError::InvalidCheckpoint {
                        path: checkpoints.record_path(record.batch_number),
                        reason: format!("{reason}; use --restart"),
                    }
                    .into());
                }
                report.resumed_from_batch = Some(record.batch_number);
                (
                    record.document,
                    record.failures,
                    record.processed,
                    record.batch_number,
                )
            }
            None => (
                CollectionMetadata::new(&opts.collection, opts.settings),
                Vec::new(),
                0,
                0,
            ),
        };

        if opts.dry_run {
            report.processed = document.items.len();
            report.failures = [scan_failures, item_failures].concat();
            report.state = if batch_number > 0 {
                BatchState::BatchComplete(batch_number)
            } else {
                BatchState::NotStarted
            };
            tracing::info!(
                planned = total,
                pending = total - position,
                "dry run; nothing written"
            );
            return Ok(report);
        }

        let ctx = RunContext {
            web_by_stem,
            writer: VariantWriter::new(&opts.output_dir, self.thumbnailer.clone()),
        };
        if report.resumed_from_batch.is_some() {
            ctx.writer.prepare()?;
        } else {
            ctx.writer.reset()?;
        }

        while position < total {
            if opts.max_batches.is_some_and(|limit| report.batches_run >= limit) {
                tracing::info!(
                    batch = batch_number,
                    "stopping early; resume to continue"
                );
                report.processed = document.items.len();
                report.failures = [scan_failures, item_failures].concat();
                return Ok(report);
            }
            batch_number += 1;
            let end = (position + opts.batch_size).min(total);
            let batch = &planned[position..end];
            report.state = BatchState::BatchInProgress(batch_number);
            self.progress.report(ProgressEvent::BatchStarted {
                batch: batch_number,
                total_batches: report.batches_total,
                items: batch.len(),
            });

            for (_, outcome) in self.run_batch(&ctx, batch, position, total) {
                match outcome {
                    Ok(item) => document.items.push(item),
                    Err(err) => {
                        tracing::warn!(error = %err, "item failed");
                        item_failures.push(failure(&err));
                    }
                }
            }
            position = end;

            let record = PartialBatchRecord {
                batch_number,
                processed: position,
                total,
                failures: item_failures.clone(),
                document: document.clone(),
            };
            let path = checkpoints.write(&record)?;
            report.batches_run += 1;
            report.state = BatchState::BatchComplete(batch_number);
            self.progress.report(ProgressEvent::BatchCheckpointed {
                batch: batch_number,
                path,
            });
            tracing::info!(
                batch = batch_number,
                processed = position,
                total,
                "batch checkpointed"
            );
        }
        report.state = BatchState::AllBatchesComplete;

        document.generated_at = util::now_utc();
        store.save(&document)?;
        report.state = BatchState::FinalDocumentWritten;
        report.document_path = Some(store.document_path());

        let removed = checkpoints.clear()?;
        tracing::debug!(removed, "removed partial batch records");
        report.processed = document.items.len();
        report.failures = [scan_failures, item_failures].concat();
        report.state = BatchState::Done;
        Ok(report)
    }

    /// Applies the resume directive to any partial records on disk.
    fn resolve_startup(&self, checkpoints: &CheckpointStore) -> Result<Option<PartialBatchRecord>> {
        let existing = checkpoints.list()?;
        if existing.is_empty() {
            if self.options.resume == ResumeMode::Resume {
                tracing::info!("no partial batch records; starting from the beginning");
            }
            return Ok(None);
        }
        match self.options.resume {
            ResumeMode::Refuse => Err(RunError::PartialBatchConflict {
                records: existing.into_iter().map(|(_, path)| path).collect(),
            }
            .into()),
            ResumeMode::Restart => {
                if self.options.dry_run {
                    tracing::info!(records = existing.len(), "would discard partial batch records");
                } else {
                    let removed = checkpoints.clear()?;
                    tracing::info!(removed, "discarded partial batch records");
                }
                Ok(None)
            }
            ResumeMode::Resume => {
                let Some(record) = checkpoints.latest()? else {
                    return Ok(None);
                };
                let path = checkpoints.record_path(record.batch_number);
                if record.document.collection_name != self.options.collection {
                    return Err(RunError::InvalidCheckpoint {
                        path,
                        reason: format!(
                            "checkpoint belongs to collection {}",
                            record.document.collection_name
                        ),
                    }
                    .into());
                }
                if record.document.settings_snapshot != self.options.settings {
                    return Err(RunError::InvalidCheckpoint {
                        path,
                        reason: "settings changed since the checkpoint was written; use --restart"
                            .to_string(),
                    }
                    .into());
                }
                tracing::info!(
                    batch = record.batch_number,
                    processed = record.processed,
                    "resuming from checkpoint"
                );
                Ok(Some(record))
            }
        }
    }

    fn scan(&self, sources: &[PathBuf]) -> (Vec<Candidate>, Vec<ItemFailure>) {
        let mut candidates = Vec::with_capacity(sources.len());
        let mut failures = Vec::new();
        for path in sources {
            match self.source.read(path) {
                Ok(Some(capture)) => candidates.push(Candidate {
                    source_path: path.clone(),
                    capture,
                    created: fs::metadata(path).and_then(|meta| meta.created()).ok(),
                }),
                Ok(None) => failures.push(failure(&ItemError::MissingMetadata {
                    path: path.clone(),
                })),
                Err(source) => failures.push(failure(&ItemError::Io {
                    path: path.clone(),
                    source,
                })),
            }
        }
        tracing::debug!(
            reader = self.source.name(),
            candidates = candidates.len(),
            failures = failures.len(),
            "scanned capture metadata"
        );
        (candidates, failures)
    }

    /// Processes one batch on up to `workers` threads. Results come back in
    /// batch order regardless of completion order.
    fn run_batch(
        &self,
        ctx: &RunContext,
        batch: &[AssignedIdentity],
        offset: usize,
        total: usize,
    ) -> Vec<(usize, Result<Item, ItemError>)> {
        let next = AtomicUsize::new(0);
        let results = Mutex::new(Vec::with_capacity(batch.len()));
        let workers = self.options.workers.clamp(1, batch.len().max(1));
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(assigned) = batch.get(index) else {
                        break;
                    };
                    let outcome = self.process_item(ctx, assigned);
                    self.progress.report(ProgressEvent::Item {
                        index: offset + index + 1,
                        total,
                        path: assigned.candidate.source_path.clone(),
                    });
                    results
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push((index, outcome));
                });
            }
        });
        let mut results = results
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        results.sort_by_key(|(index, _)| *index);
        results
    }

    fn process_item(&self, ctx: &RunContext, assigned: &AssignedIdentity) -> Result<Item, ItemError> {
        let candidate = &assigned.candidate;
        let path = &candidate.source_path;
        let bytes = fs::read(path).map_err(|source| ItemError::Io {
            path: path.clone(),
            source,
        })?;
        let hashes = self
            .hasher
            .compute(&bytes, assigned.corrected, self.options.settings.timezone)
            .map_err(|err| ItemError::Transform {
                path: path.clone(),
                reason: format!("{err:#}"),
            })?;

        let web_source = ctx
            .web_by_stem
            .as_ref()
            .and_then(|pairs| pairs.get(&validation::stem(path)))
            .unwrap_or(path);
        let variant_paths = ctx
            .writer
            .publish(&assigned.identity, path, web_source, &bytes)
            .map_err(|err| ItemError::Publish {
                path: path.clone(),
                reason: format!("{err:#}"),
            })?;

        let capture = &candidate.capture;
        Ok(Item {
            identity: assigned.identity.clone(),
            source_path: path.clone(),
            capture_timestamp_raw: capture.timestamp,
            capture_timestamp_corrected: assigned.corrected,
            subsecond: capture.subsecond.clone(),
            timezone_original: capture.timezone_original.clone(),
            timezone_context: self.options.settings.timezone,
            device_info: capture.device.clone(),
            source_hash: hashes.source_hash,
            published_hash: hashes.published_hash,
            variant_paths,
        })
    }
}

/// A checkpoint can only be continued when the already processed prefix of
/// today's plan is exactly what it recorded: same paths, same identities.
fn check_resumable(record: &PartialBatchRecord, planned: &[AssignedIdentity]) -> Result<(), String> {
    if record.total != planned.len() {
        return Err(format!(
            "checkpoint planned {} items but the collection now has {}",
            record.total,
            planned.len()
        ));
    }
    let done = planned.get(..record.processed).unwrap_or(planned);
    let expected: BTreeMap<&Path, &str> = done
        .iter()
        .map(|assigned| (assigned.candidate.source_path.as_path(), assigned.identity.as_str()))
        .collect();

    let mut seen = BTreeSet::new();
    for item in &record.document.items {
        let path = item.source_path.as_path();
        if expected.get(path) != Some(&item.identity.as_str()) || !seen.insert(path) {
            return Err(format!(
                "{} ({}) no longer matches the collection",
                item.identity,
                path.display()
            ));
        }
    }
    for failed in &record.failures {
        let path = failed.path.as_path();
        if !expected.contains_key(path) || !seen.insert(path) {
            return Err(format!("{} no longer matches the collection", path.display()));
        }
    }
    if seen.len() != expected.len() {
        return Err(format!(
            "checkpoint covers {} of the first {} planned items",
            seen.len(),
            expected.len()
        ));
    }
    Ok(())
}

fn failure(err: &ItemError) -> ItemFailure {
    ItemFailure {
        path: err.path().clone(),
        reason: err.to_string(),
    }
}
