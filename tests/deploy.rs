mod common;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use galleria::deploy::{self, ExecuteOptions, Executor, RemoteLayout};
use galleria::error::{RunError, StoreError};
use galleria::models::{CollectionMetadata, SettingsSnapshot, TimezoneContext, Variant};
use galleria::remote::{MemoryObjectStore, ObjectStore};
use galleria::storage::{self, MetadataStore};
use galleria::transform::{ExifTransformer, Transformer};
use galleria::util;

use common::{options, process, write_collection};

/// Memory store that rejects puts for keys containing `fail_on` while
/// `failing` is set.
struct FlakyStore {
    inner: MemoryObjectStore,
    fail_on: String,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl FlakyStore {
    fn new(fail_on: &str) -> Self {
        Self {
            inner: MemoryObjectStore::new(),
            fail_on: fail_on.to_string(),
            failing: AtomicBool::new(true),
            attempts: AtomicUsize::new(0),
        }
    }
}

impl ObjectStore for FlakyStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) && key.contains(&self.fail_on) {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Backend("connection reset".to_string()));
        }
        self.inner.put(key, bytes)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.inner.get(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list(prefix)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key)
    }
}

fn processed(count: usize) -> (tempfile::TempDir, tempfile::TempDir, CollectionMetadata) {
    let source = tempfile::tempdir().unwrap();
    write_collection(source.path(), count);
    let output = tempfile::tempdir().unwrap();
    process(options(source.path(), output.path(), SettingsSnapshot::default()));
    let doc = MetadataStore::new(output.path()).load().unwrap().unwrap();
    (source, output, doc)
}

fn executor(store: Arc<dyn ObjectStore>, output: &Path, options: ExecuteOptions) -> Executor {
    Executor::new(store, RemoteLayout::new("photos"), output, options)
}

fn quick() -> ExecuteOptions {
    ExecuteOptions {
        retries: 2,
        backoff: Duration::from_millis(1),
        workers: 2,
        ..ExecuteOptions::default()
    }
}

#[tokio::test]
async fn failed_upload_holds_back_metadata_and_retry_sends_only_the_rest() {
    let (_source, output, local) = processed(5);
    let third = local.items[2].identity.clone();
    let store = Arc::new(FlakyStore::new(&third));
    let layout = RemoteLayout::new("photos");

    let plan = deploy::plan(&local, None, false);
    assert_eq!(plan.upload.len(), 5);
    let first = executor(store.clone(), output.path(), quick())
        .execute(&plan, &local)
        .await
        .unwrap();

    assert!(!first.is_success());
    assert!(!first.metadata_published);
    assert_eq!(first.uploaded.len(), 4);
    assert_eq!(first.failed.len(), 1);
    assert_eq!(first.failed[0].identity, third);
    assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
    assert!(matches!(
        store.get(&layout.metadata_key()),
        Err(StoreError::NotFound(_))
    ));
    assert!(deploy::executor::require_published(&first).is_err());

    store.failing.store(false, Ordering::SeqCst);
    let retry = plan.remaining_after(&first);
    assert_eq!(retry.upload.len(), 1);
    assert_eq!(retry.upload[0].identity, third);

    let second = executor(store.clone(), output.path(), quick())
        .execute(&retry, &local)
        .await
        .unwrap();
    assert!(second.is_success());
    assert_eq!(second.uploaded, vec![third]);
    assert!(second.verification.as_ref().unwrap().is_clean());

    let remote = deploy::fetch_remote(&*store, &layout).unwrap().unwrap();
    assert_eq!(remote.items, local.items);
    assert!(deploy::plan(&local, Some(&remote), false).is_noop());
}

#[tokio::test]
async fn metadata_upload_failure_is_reported_as_a_run_error() {
    let (_source, output, local) = processed(3);
    let store = Arc::new(FlakyStore::new("gallery-metadata"));
    let layout = RemoteLayout::new("photos");
    let plan = deploy::plan(&local, None, false);

    let result = executor(store.clone(), output.path(), quick())
        .execute(&plan, &local)
        .await
        .unwrap();
    assert_eq!(result.uploaded.len(), 3);
    assert!(result.failed.is_empty());
    assert!(!result.metadata_published);
    assert!(result
        .metadata_error
        .as_deref()
        .is_some_and(|reason| reason.contains("connection reset")));
    assert!(result.verification.is_none());
    assert!(!result.is_success());
    assert_eq!(store.attempts.load(Ordering::SeqCst), 3);

    let err = deploy::executor::require_published(&result).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RunError>(),
        Some(RunError::MetadataUpload(_))
    ));
    assert!(matches!(deploy::fetch_remote(&*store, &layout), Ok(None)));
}

/// Appends a trailer to every rewritten variant, so uploads no longer
/// match the processed hashes.
struct Drifting;

impl Transformer for Drifting {
    fn apply(
        &self,
        bytes: &[u8],
        corrected: NaiveDateTime,
        timezone: TimezoneContext,
    ) -> anyhow::Result<Vec<u8>> {
        let mut out = ExifTransformer.apply(bytes, corrected, timezone)?;
        out.extend_from_slice(b"drift");
        Ok(out)
    }
}

#[tokio::test]
async fn rewrite_drift_fails_items_and_holds_back_metadata() {
    let (_source, output, local) = processed(2);
    let store = Arc::new(MemoryObjectStore::new());
    let layout = RemoteLayout::new("photos");
    let plan = deploy::plan(&local, None, false);

    let result = executor(store.clone(), output.path(), quick())
        .with_transformer(Arc::new(Drifting))
        .execute(&plan, &local)
        .await
        .unwrap();
    assert!(result.uploaded.is_empty());
    assert_eq!(result.failed.len(), 2);
    assert!(result
        .failed
        .iter()
        .all(|failure| failure.reason.contains("source changed since processing")));
    assert!(!result.metadata_published);
    assert!(store.get(&layout.metadata_key()).is_err());
    assert!(store
        .keys()
        .iter()
        .all(|key| !key.contains("/full/")));
}

#[tokio::test]
async fn full_variant_is_rewritten_and_thumbnail_is_verbatim() {
    let (_source, output, local) = processed(2);
    let store = Arc::new(MemoryObjectStore::new());
    let layout = RemoteLayout::new("photos");
    let plan = deploy::plan(&local, None, false);
    let result = executor(store.clone(), output.path(), quick())
        .execute(&plan, &local)
        .await
        .unwrap();
    assert!(result.is_success());

    let item = &local.items[0];
    let full = store.get(&layout.variant_key(Variant::Full, &item.identity)).unwrap();
    assert_eq!(util::hash_bytes(&full), item.published_hash);

    let thumb = store.get(&layout.variant_key(Variant::Thumb, &item.identity)).unwrap();
    let local_thumb = std::fs::read(output.path().join(&item.variant_paths[&Variant::Thumb])).unwrap();
    assert_eq!(thumb, local_thumb);
}

#[tokio::test]
async fn removed_identities_are_orphaned_until_pruned() {
    let (_source, output, local) = processed(3);
    let store = Arc::new(MemoryObjectStore::new());
    let first_plan = deploy::plan(&local, None, false);
    executor(store.clone(), output.path(), quick())
        .execute(&first_plan, &local)
        .await
        .unwrap();

    let layout = RemoteLayout::new("photos");
    let mut shrunk = local.clone();
    let gone = shrunk.items.pop().unwrap().identity;
    let remote = deploy::fetch_remote(&*store, &layout).unwrap();
    let plan = deploy::plan(&shrunk, remote.as_ref(), false);
    assert!(plan.upload.is_empty());
    assert_eq!(plan.delete, vec![gone.clone()]);

    let kept = executor(store.clone(), output.path(), quick())
        .execute(&plan, &shrunk)
        .await
        .unwrap();
    let report = kept.verification.unwrap();
    assert!(report.missing.is_empty());
    assert_eq!(report.orphaned.len(), 3);
    assert!(report.orphaned.iter().all(|key| key.contains(&gone)));

    let pruned = executor(
        store.clone(),
        output.path(),
        ExecuteOptions {
            prune: true,
            ..quick()
        },
    )
    .execute(&plan, &shrunk)
    .await
    .unwrap();
    assert_eq!(pruned.deleted, vec![gone.clone()]);
    assert!(pruned.verification.unwrap().is_clean());
    assert!(store.keys().iter().all(|key| !key.contains(&gone)));
}

#[tokio::test]
async fn dry_run_touches_nothing() {
    let (_source, output, local) = processed(2);
    let store = Arc::new(MemoryObjectStore::new());
    let plan = deploy::plan(&local, None, false);
    let result = executor(
        store.clone(),
        output.path(),
        ExecuteOptions {
            dry_run: true,
            ..quick()
        },
    )
    .execute(&plan, &local)
    .await
    .unwrap();
    assert!(result.dry_run);
    assert!(result.is_success());
    assert_eq!(result.planned_upload, 2);
    assert!(store.keys().is_empty());
}

#[tokio::test]
async fn corrupt_remote_metadata_redeploys_everything() {
    let (_source, output, local) = processed(2);
    let store = Arc::new(MemoryObjectStore::new());
    let layout = RemoteLayout::new("photos");
    store.put(&layout.metadata_key(), b"{\"schema_version\": \"1.0\", \"items\": [").unwrap();

    let remote = deploy::fetch_remote(&*store, &layout).unwrap();
    assert!(remote.is_none());
    let plan = deploy::plan(&local, remote.as_ref(), false);
    assert_eq!(plan.upload.len(), 2);

    let result = executor(store.clone(), output.path(), quick())
        .execute(&plan, &local)
        .await
        .unwrap();
    assert!(result.metadata_published);
    let published = storage::decode_document(&store.get(&layout.metadata_key()).unwrap()).unwrap();
    assert_eq!(published.items, local.items);
}

#[tokio::test]
async fn stale_local_document_is_refused() {
    let (_source, output, mut local) = processed(1);
    local.settings_snapshot.timestamp_offset_hours = 3;
    let store = Arc::new(MemoryObjectStore::new());
    let plan = deploy::plan(&local, None, false);
    let outcome = executor(store.clone(), output.path(), quick())
        .execute(&plan, &local)
        .await;
    assert!(outcome.is_err());
    assert!(store.keys().is_empty());
}
