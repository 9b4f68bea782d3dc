//! Source and published content hashes.
//!
//! `source_hash` covers the original bytes and ignores configuration.
//! `published_hash` covers the bytes the executor will upload, so it moves
//! whenever the source or the transformation settings move. The
//! transformed buffer only lives for the duration of [`DualHasher::compute`].

use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDateTime;

use crate::models::{Item, TimezoneContext};
use crate::transform::Transformer;
use crate::util;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DualHash {
    pub source_hash: String,
    pub published_hash: String,
}

#[derive(Clone)]
pub struct DualHasher {
    transformer: Arc<dyn Transformer>,
}

impl DualHasher {
    pub fn new(transformer: Arc<dyn Transformer>) -> Self {
        Self { transformer }
    }

    pub fn compute(
        &self,
        source: &[u8],
        corrected: NaiveDateTime,
        timezone: TimezoneContext,
    ) -> Result<DualHash> {
        let source_hash = util::hash_bytes(source);
        let published = self.transformer.apply(source, corrected, timezone)?;
        let published_hash = util::hash_bytes(&published);
        Ok(DualHash {
            source_hash,
            published_hash,
        })
    }

    /// Re-derives an item's published hash from its source bytes using the
    /// parameters recorded on the item.
    pub fn verify(&self, item: &Item, source: &[u8]) -> Result<bool> {
        let derived = self.compute(
            source,
            item.capture_timestamp_corrected,
            item.timezone_context,
        )?;
        Ok(derived.source_hash == item.source_hash && derived.published_hash == item.published_hash)
    }
}
