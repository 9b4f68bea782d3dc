//! Applies a deployment plan: content first, metadata document last.
//!
//! The remote document only ever describes content that is already
//! uploaded. Any content failure leaves it untouched, so the next run plans
//! against the old document and re-requests the same uploads.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::plan::{ensure_current, DeploymentPlan};
use super::verify::{self, VerifyReport};
use super::RemoteLayout;
use crate::error::StoreError;
use crate::models::{CollectionMetadata, Item, Variant};
use crate::progress::{ProgressEvent, ProgressReporter, SilentProgress};
use crate::remote::ObjectStore;
use crate::storage;
use crate::transform::{ExifTransformer, Transformer};
use crate::util;

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub dry_run: bool,
    /// Extra attempts per object after the first failure.
    pub retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub backoff: Duration,
    pub workers: usize,
    pub verify: bool,
    /// Delete remote content for identities no longer present locally,
    /// after the new document is published.
    pub prune: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            retries: 3,
            backoff: Duration::from_millis(250),
            workers: 8,
            verify: true,
            prune: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadFailure {
    pub identity: String,
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeploymentResult {
    pub dry_run: bool,
    pub planned_upload: usize,
    pub planned_delete: usize,
    /// Identities whose every variant reached the store.
    pub uploaded: Vec<String>,
    pub failed: Vec<UploadFailure>,
    pub unchanged: usize,
    pub deleted: Vec<String>,
    pub metadata_published: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerifyReport>,
}

impl DeploymentResult {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
            && self.metadata_error.is_none()
            && (self.dry_run || self.metadata_published)
    }
}

pub struct Executor {
    store: Arc<dyn ObjectStore>,
    layout: RemoteLayout,
    output_dir: PathBuf,
    transformer: Arc<dyn Transformer>,
    progress: Arc<dyn ProgressReporter>,
    options: ExecuteOptions,
}

impl Executor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        layout: RemoteLayout,
        output_dir: &Path,
        options: ExecuteOptions,
    ) -> Self {
        Self {
            store,
            layout,
            output_dir: output_dir.to_path_buf(),
            transformer: Arc::new(ExifTransformer),
            progress: Arc::new(SilentProgress),
            options,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformer = transformer;
        self
    }

    pub async fn execute(
        &self,
        plan: &DeploymentPlan,
        local: &CollectionMetadata,
    ) -> Result<DeploymentResult> {
        ensure_current(local)?;
        let mut result = DeploymentResult {
            dry_run: self.options.dry_run,
            planned_upload: plan.upload.len(),
            planned_delete: plan.delete.len(),
            unchanged: plan.unchanged.len(),
            ..DeploymentResult::default()
        };
        if self.options.dry_run {
            tracing::info!(
                upload = plan.upload.len(),
                delete = plan.delete.len(),
                unchanged = plan.unchanged.len(),
                "dry run; nothing uploaded"
            );
            return Ok(result);
        }

        self.upload_items(plan, &mut result).await?;
        result.uploaded.sort();

        if !result.failed.is_empty() {
            tracing::warn!(
                failed = result.failed.len(),
                "content uploads failed; metadata document left untouched"
            );
            return Ok(result);
        }

        let document = storage::encode_document(local)?;
        match self.put_with_retry(self.layout.metadata_key(), document).await {
            Ok(()) => {
                result.metadata_published = true;
                tracing::info!(key = %self.layout.metadata_key(), "metadata document published");
            }
            Err(err) => {
                tracing::error!(error = %err, "metadata document upload failed");
                result.metadata_error = Some(err.to_string());
                return Ok(result);
            }
        }

        if self.options.prune {
            result.deleted = self.prune(&plan.delete).await;
        } else if !plan.delete.is_empty() {
            tracing::info!(
                count = plan.delete.len(),
                "remote identities absent locally; pass --prune to delete them"
            );
        }

        if self.options.verify {
            let store = self.store.clone();
            let layout = self.layout.clone();
            let items: Vec<Item> = plan.upload.iter().chain(&plan.unchanged).cloned().collect();
            let report = tokio::task::spawn_blocking(move || verify::verify(&*store, &layout, &items))
                .await
                .context("verification task panicked")??;
            if !report.is_clean() {
                tracing::warn!(
                    missing = report.missing.len(),
                    orphaned = report.orphaned.len(),
                    "remote content does not match the published document"
                );
            }
            result.verification = Some(report);
        }
        Ok(result)
    }

    async fn upload_items(&self, plan: &DeploymentPlan, result: &mut DeploymentResult) -> Result<()> {
        let limit = Arc::new(Semaphore::new(self.options.workers.max(1)));
        let total = plan.upload.len();
        let mut tasks = JoinSet::new();
        for (index, item) in plan.upload.iter().cloned().enumerate() {
            let permit = limit.clone().acquire_owned().await?;
            let uploader = ItemUploader {
                store: self.store.clone(),
                layout: self.layout.clone(),
                output_dir: self.output_dir.clone(),
                transformer: self.transformer.clone(),
                progress: self.progress.clone(),
                retries: self.options.retries,
                backoff: self.options.backoff,
            };
            tasks.spawn(async move {
                let outcome = uploader.upload(&item, index + 1, total).await;
                drop(permit);
                (item.identity, outcome)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            let (identity, outcome) = joined.context("upload task panicked")?;
            match outcome {
                Ok(()) => result.uploaded.push(identity),
                Err(failure) => {
                    tracing::warn!(
                        identity = %failure.identity,
                        key = %failure.key,
                        reason = %failure.reason,
                        "upload failed"
                    );
                    result.failed.push(failure);
                }
            }
        }
        result.failed.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(())
    }

    async fn put_with_retry(&self, key: String, bytes: Vec<u8>) -> Result<(), StoreError> {
        put_with_retry(
            self.store.clone(),
            key,
            Arc::new(bytes),
            self.options.retries,
            self.options.backoff,
        )
        .await
    }

    async fn prune(&self, identities: &[String]) -> Vec<String> {
        let mut deleted = Vec::new();
        for identity in identities {
            let keys: Vec<String> = Variant::ALL
                .iter()
                .map(|variant| self.layout.variant_key(*variant, identity))
                .collect();
            let store = self.store.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                keys.iter().try_for_each(|key| store.delete(key))
            })
            .await;
            match outcome {
                Ok(Ok(())) => deleted.push(identity.clone()),
                Ok(Err(err)) => {
                    tracing::warn!(identity = %identity, error = %err, "prune failed")
                }
                Err(err) => {
                    tracing::warn!(identity = %identity, error = %err, "prune task panicked")
                }
            }
        }
        tracing::info!(deleted = deleted.len(), "pruned remote identities");
        deleted
    }
}

/// Owned handles for one upload task.
struct ItemUploader {
    store: Arc<dyn ObjectStore>,
    layout: RemoteLayout,
    output_dir: PathBuf,
    transformer: Arc<dyn Transformer>,
    progress: Arc<dyn ProgressReporter>,
    retries: u32,
    backoff: Duration,
}

impl ItemUploader {
    /// Uploads every variant of `item`; the first failing variant ends the
    /// item.
    async fn upload(&self, item: &Item, index: usize, total: usize) -> Result<(), UploadFailure> {
        for (variant, key) in self.layout.keys_for(item) {
            let fail = |reason: String| UploadFailure {
                identity: item.identity.clone(),
                key: key.clone(),
                reason,
            };
            self.progress.report(ProgressEvent::Upload {
                index,
                total,
                key: key.clone(),
            });
            let Some(relative) = item.variant_paths.get(&variant) else {
                continue;
            };
            let path = self.output_dir.join(relative);
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|err| fail(format!("failed to read {}: {err}", path.display())))?;
            let payload = self.prepare(item, variant, bytes).await.map_err(&fail)?;
            put_with_retry(
                self.store.clone(),
                key.clone(),
                Arc::new(payload),
                self.retries,
                self.backoff,
            )
            .await
            .map_err(|err| fail(err.to_string()))?;
            tracing::debug!(key = %key, "uploaded");
        }
        Ok(())
    }

    /// Applies the metadata rewrite in memory. The full variant must hash to
    /// the recorded `published_hash`, otherwise the source moved since
    /// processing and the document no longer describes it.
    async fn prepare(&self, item: &Item, variant: Variant, bytes: Vec<u8>) -> Result<Vec<u8>, String> {
        if !variant.rewrites_metadata() {
            return Ok(bytes);
        }
        let transformer = self.transformer.clone();
        let corrected = item.capture_timestamp_corrected;
        let timezone = item.timezone_context;
        let payload = tokio::task::spawn_blocking(move || transformer.apply(&bytes, corrected, timezone))
            .await
            .map_err(|err| format!("transform task panicked: {err}"))?
            .map_err(|err| format!("metadata rewrite failed: {err:#}"))?;
        if variant == Variant::Full && util::hash_bytes(&payload) != item.published_hash {
            return Err("source changed since processing; rerun process".to_string());
        }
        Ok(payload)
    }
}

async fn put_with_retry(
    store: Arc<dyn ObjectStore>,
    key: String,
    bytes: Arc<Vec<u8>>,
    retries: u32,
    backoff: Duration,
) -> Result<(), StoreError> {
    let mut attempt = 0;
    loop {
        let store = store.clone();
        let target = key.clone();
        let payload = bytes.clone();
        let outcome = tokio::task::spawn_blocking(move || store.put(&target, &payload))
            .await
            .map_err(|err| StoreError::Backend(format!("upload task panicked: {err}")))?;
        match outcome {
            Ok(()) => return Ok(()),
            Err(err) if attempt < retries => {
                let delay = backoff.saturating_mul(1u32 << attempt.min(5));
                tracing::debug!(key = %key, attempt, error = %err, "retrying upload");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Turns an unsuccessful result into the run-level error callers exit on.
/// Retry with [`DeploymentPlan::remaining_after`] to re-attempt only what
/// is left.
pub fn require_published(result: &DeploymentResult) -> Result<()> {
    if let Some(reason) = &result.metadata_error {
        return Err(crate::error::RunError::MetadataUpload(reason.clone()).into());
    }
    if !result.failed.is_empty() {
        bail!("{} uploads failed; metadata document not published", result.failed.len());
    }
    Ok(())
}
