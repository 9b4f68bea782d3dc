use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use serde::Serialize;

use super::executor::DeploymentResult;
use super::RemoteLayout;
use crate::error::StoreError;
use crate::models::{CollectionMetadata, Item};
use crate::remote::ObjectStore;
use crate::storage;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentPlan {
    pub upload: Vec<Item>,
    /// Identities published remotely that no longer exist locally.
    pub delete: Vec<String>,
    pub unchanged: Vec<Item>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub upload: Vec<String>,
    pub delete: Vec<String>,
    pub unchanged: usize,
}

/// Compares `published_hash` per identity. A missing remote document is an
/// empty baseline, so everything uploads. `force` uploads every local item
/// regardless of hashes.
pub fn plan(
    local: &CollectionMetadata,
    remote: Option<&CollectionMetadata>,
    force: bool,
) -> DeploymentPlan {
    let remote_hashes: HashMap<&str, &str> = remote
        .map(|doc| {
            doc.items
                .iter()
                .map(|item| (item.identity.as_str(), item.published_hash.as_str()))
                .collect()
        })
        .unwrap_or_default();

    let mut result = DeploymentPlan::default();
    for item in &local.items {
        match remote_hashes.get(item.identity.as_str()) {
            Some(hash) if !force && *hash == item.published_hash => {
                result.unchanged.push(item.clone())
            }
            _ => result.upload.push(item.clone()),
        }
    }

    let local_ids: HashSet<&str> = local.items.iter().map(|item| item.identity.as_str()).collect();
    if let Some(doc) = remote {
        result.delete = doc
            .items
            .iter()
            .filter(|item| !local_ids.contains(item.identity.as_str()))
            .map(|item| item.identity.clone())
            .collect();
        result.delete.sort();
    }
    result
}

impl DeploymentPlan {
    /// Nothing to upload and nothing to delete.
    pub fn is_noop(&self) -> bool {
        self.upload.is_empty() && self.delete.is_empty()
    }

    /// Plan for retrying after `result`: only items that were not fully
    /// uploaded stay in `upload`.
    pub fn remaining_after(&self, result: &DeploymentResult) -> DeploymentPlan {
        let done: HashSet<&str> = result.uploaded.iter().map(String::as_str).collect();
        let deleted: HashSet<&str> = result.deleted.iter().map(String::as_str).collect();
        let (finished, upload): (Vec<Item>, Vec<Item>) = self
            .upload
            .iter()
            .cloned()
            .partition(|item| done.contains(item.identity.as_str()));
        let mut unchanged = self.unchanged.clone();
        unchanged.extend(finished);
        DeploymentPlan {
            upload,
            delete: self
                .delete
                .iter()
                .filter(|identity| !deleted.contains(identity.as_str()))
                .cloned()
                .collect(),
            unchanged,
        }
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            upload: self.upload.iter().map(|item| item.identity.clone()).collect(),
            delete: self.delete.clone(),
            unchanged: self.unchanged.len(),
        }
    }
}

/// Fetches the published document. Missing or unparsable documents come
/// back as `None`; only store failures are errors.
pub fn fetch_remote(
    store: &dyn ObjectStore,
    layout: &RemoteLayout,
) -> Result<Option<CollectionMetadata>> {
    let key = layout.metadata_key();
    let bytes = match store.get(&key) {
        Ok(bytes) => bytes,
        Err(StoreError::NotFound(_)) => {
            tracing::info!(key = %key, "no remote metadata; treating remote as empty");
            return Ok(None);
        }
        Err(err) => bail!("failed to fetch remote metadata {key}: {err}"),
    };
    match storage::decode_document(&bytes) {
        Ok(doc) => Ok(Some(doc)),
        Err(err) => {
            tracing::warn!(
                key = %key,
                error = %format!("{err:#}"),
                "remote metadata unreadable; treating remote as empty"
            );
            Ok(None)
        }
    }
}

/// The local document must match its own settings snapshot before it can
/// be diffed.
pub fn ensure_current(local: &CollectionMetadata) -> Result<()> {
    let stale = local.stale_items();
    if !stale.is_empty() {
        bail!(
            "{} items were computed under different settings than the document snapshot; rerun process",
            stale.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceInfo, SettingsSnapshot, TimezoneContext};
    use crate::remote::MemoryObjectStore;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn item(identity: &str, hash: &str) -> Item {
        let ts = NaiveDate::from_ymd_opt(2024, 8, 10)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        Item {
            identity: identity.to_string(),
            source_path: format!("/src/{identity}.jpg").into(),
            capture_timestamp_raw: ts,
            capture_timestamp_corrected: ts,
            subsecond: None,
            timezone_original: None,
            timezone_context: TimezoneContext::PreserveOriginal,
            device_info: DeviceInfo::default(),
            source_hash: format!("src-{hash}"),
            published_hash: hash.to_string(),
            variant_paths: BTreeMap::new(),
        }
    }

    fn doc(items: Vec<Item>) -> CollectionMetadata {
        let mut doc = CollectionMetadata::new("wedding", SettingsSnapshot::default());
        doc.items = items;
        doc
    }

    fn ids(items: &[Item]) -> Vec<&str> {
        items.iter().map(|item| item.identity.as_str()).collect()
    }

    #[test]
    fn splits_into_upload_delete_unchanged() {
        let local = doc(vec![item("A", "h1"), item("B", "h2")]);
        let remote = doc(vec![item("A", "h1"), item("C", "h3")]);
        let result = plan(&local, Some(&remote), false);
        assert_eq!(ids(&result.upload), vec!["B"]);
        assert_eq!(result.delete, vec!["C".to_string()]);
        assert_eq!(ids(&result.unchanged), vec!["A"]);
    }

    #[test]
    fn changed_hash_uploads_and_missing_remote_uploads_all() {
        let local = doc(vec![item("A", "h1-new"), item("B", "h2")]);
        let remote = doc(vec![item("A", "h1"), item("B", "h2")]);
        assert_eq!(ids(&plan(&local, Some(&remote), false).upload), vec!["A"]);

        let everything = plan(&local, None, false);
        assert_eq!(ids(&everything.upload), vec!["A", "B"]);
        assert!(everything.delete.is_empty());
    }

    #[test]
    fn force_uploads_unchanged_items() {
        let local = doc(vec![item("A", "h1")]);
        let forced = plan(&local, Some(&local.clone()), true);
        assert_eq!(ids(&forced.upload), vec!["A"]);
        assert!(plan(&local, Some(&local.clone()), false).is_noop());
    }

    #[test]
    fn remaining_after_keeps_only_unfinished_uploads() {
        let local = doc(vec![item("A", "h1"), item("B", "h2"), item("C", "h3")]);
        let full = plan(&local, None, false);
        let result = DeploymentResult {
            uploaded: vec!["A".to_string(), "C".to_string()],
            ..DeploymentResult::default()
        };
        let retry = full.remaining_after(&result);
        assert_eq!(ids(&retry.upload), vec!["B"]);
        assert_eq!(ids(&retry.unchanged), vec!["A", "C"]);
    }

    #[test]
    fn corrupt_remote_document_is_an_empty_baseline() {
        let store = MemoryObjectStore::new();
        let layout = RemoteLayout::new("photos");
        assert!(fetch_remote(&store, &layout).unwrap().is_none());

        store.put(&layout.metadata_key(), b"{\"partial\": ").unwrap();
        assert!(fetch_remote(&store, &layout).unwrap().is_none());

        let published = doc(vec![item("A", "h1")]);
        store
            .put(&layout.metadata_key(), &storage::encode_document(&published).unwrap())
            .unwrap();
        assert_eq!(fetch_remote(&store, &layout).unwrap(), Some(published));
    }

    #[test]
    fn stale_documents_are_refused() {
        let mut local = doc(vec![item("A", "h1")]);
        assert!(ensure_current(&local).is_ok());
        local.settings_snapshot.timestamp_offset_hours = 2;
        assert!(ensure_current(&local).is_err());
    }
}
