use std::collections::BTreeSet;

use serde::Serialize;

use super::RemoteLayout;
use crate::error::StoreError;
use crate::models::Item;
use crate::remote::ObjectStore;

/// Remote listing compared to what the local document says should exist.
/// Mismatches are for the operator to review; nothing is corrected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub expected: usize,
    pub missing: Vec<String>,
    pub orphaned: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.orphaned.is_empty()
    }
}

pub fn expected_keys<'a, I>(layout: &RemoteLayout, items: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a Item>,
{
    let mut keys: BTreeSet<String> = items
        .into_iter()
        .flat_map(|item| layout.keys_for(item).into_iter().map(|(_, key)| key))
        .collect();
    keys.insert(layout.metadata_key());
    keys
}

pub fn verify<'a, I>(
    store: &dyn ObjectStore,
    layout: &RemoteLayout,
    items: I,
) -> Result<VerifyReport, StoreError>
where
    I: IntoIterator<Item = &'a Item>,
{
    let expected = expected_keys(layout, items);
    let listed: BTreeSet<String> = store.list(&layout.list_prefix())?.into_iter().collect();
    Ok(VerifyReport {
        expected: expected.len(),
        missing: expected.difference(&listed).cloned().collect(),
        orphaned: listed.difference(&expected).cloned().collect(),
    })
}
