use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::models::{CollectionMetadata, SCHEMA_VERSION};
use crate::util;

pub const METADATA_FILENAME: &str = "gallery-metadata.json";

/// Local home of the final collection document and the published
/// variant files it points at.
pub struct MetadataStore {
    output_dir: PathBuf,
}

impl MetadataStore {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
        }
    }

    pub fn document_path(&self) -> PathBuf {
        self.output_dir.join(METADATA_FILENAME)
    }

    pub fn exists(&self) -> bool {
        self.document_path().exists()
    }

    pub fn load(&self) -> Result<Option<CollectionMetadata>> {
        let path = self.document_path();
        if !path.exists() {
            return Ok(None);
        }
        let file =
            File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        let doc: CollectionMetadata = serde_json::from_reader(file)
            .with_context(|| format!("failed to parse collection metadata {}", path.display()))?;
        check_schema(&doc)?;
        Ok(Some(doc))
    }

    pub fn save(&self, doc: &CollectionMetadata) -> Result<()> {
        util::ensure_dir(&self.output_dir)?;
        util::write_json_atomic(&self.document_path(), doc)
    }
}

pub fn encode_document(doc: &CollectionMetadata) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(doc)?)
}

pub fn decode_document(bytes: &[u8]) -> Result<CollectionMetadata> {
    let doc: CollectionMetadata =
        serde_json::from_slice(bytes).context("failed to parse collection metadata")?;
    check_schema(&doc)?;
    Ok(doc)
}

fn check_schema(doc: &CollectionMetadata) -> Result<()> {
    let major = |version: &str| version.split('.').next().map(str::to_string);
    if major(&doc.schema_version) != major(SCHEMA_VERSION) {
        bail!(
            "unsupported metadata schema version {} (expected {})",
            doc.schema_version,
            SCHEMA_VERSION
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SettingsSnapshot, TimezoneContext};

    #[test]
    fn save_then_load_returns_same_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        assert!(store.load().unwrap().is_none());

        let settings = SettingsSnapshot {
            timestamp_offset_hours: -4,
            timezone: TimezoneContext::Offset(2),
        };
        let doc = CollectionMetadata::new("wedding", settings);
        store.save(&doc).unwrap();
        assert_eq!(store.load().unwrap(), Some(doc));
    }

    #[test]
    fn rejects_foreign_schema_versions() {
        let mut doc = CollectionMetadata::new("wedding", SettingsSnapshot::default());
        doc.schema_version = "2.0".into();
        let bytes = encode_document(&doc).unwrap();
        assert!(decode_document(&bytes).is_err());
        assert!(decode_document(b"{\"partial\": \"data\"}").is_err());
    }
}
