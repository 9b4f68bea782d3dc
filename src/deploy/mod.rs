//! Diffing a local collection document against the published one and
//! pushing the difference to an object store, metadata last.

pub mod executor;
pub mod plan;
pub mod verify;

use crate::models::{Item, Variant};
use crate::storage::METADATA_FILENAME;

pub use executor::{DeploymentResult, ExecuteOptions, Executor, UploadFailure};
pub use plan::{fetch_remote, plan, DeploymentPlan};
pub use verify::VerifyReport;

/// Maps identities and variants to object keys under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLayout {
    prefix: String,
}

impl RemoteLayout {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn join(&self, rest: &str) -> String {
        if self.prefix.is_empty() {
            rest.to_string()
        } else {
            format!("{}/{rest}", self.prefix)
        }
    }

    pub fn variant_key(&self, variant: Variant, identity: &str) -> String {
        self.join(&format!("{}/{identity}.jpg", variant.as_str()))
    }

    pub fn metadata_key(&self) -> String {
        self.join(METADATA_FILENAME)
    }

    /// Prefix to list when looking for everything this layout owns.
    pub fn list_prefix(&self) -> String {
        self.join("")
    }

    pub fn keys_for(&self, item: &Item) -> Vec<(Variant, String)> {
        item.variant_paths
            .keys()
            .map(|variant| (*variant, self.variant_key(*variant, &item.identity)))
            .collect()
    }
}
