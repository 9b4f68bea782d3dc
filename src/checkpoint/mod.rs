//! Numbered partial batch records (`gallery-metadata.partNNN.json`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::RunError;
use crate::models::PartialBatchRecord;
use crate::util;

const RECORD_PREFIX: &str = "gallery-metadata.part";
const RECORD_SUFFIX: &str = ".json";

pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn record_path(&self, batch_number: usize) -> PathBuf {
        self.dir
            .join(format!("{RECORD_PREFIX}{batch_number:03}{RECORD_SUFFIX}"))
    }

    /// Existing records ordered by batch number.
    pub fn list(&self) -> Result<Vec<(usize, PathBuf)>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read {}", self.dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(number) = parse_record_name(&name) {
                records.push((number, entry.path()));
            }
        }
        records.sort();
        Ok(records)
    }

    pub fn write(&self, record: &PartialBatchRecord) -> Result<PathBuf> {
        let path = self.record_path(record.batch_number);
        util::write_json_atomic(&path, record)?;
        Ok(path)
    }

    /// Loads the newest record, checking it is the one its file name claims.
    pub fn latest(&self) -> Result<Option<PartialBatchRecord>> {
        let Some((number, path)) = self.list()?.pop() else {
            return Ok(None);
        };
        let bytes = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let record: PartialBatchRecord =
            serde_json::from_slice(&bytes).map_err(|err| RunError::InvalidCheckpoint {
                path: path.clone(),
                reason: err.to_string(),
            })?;
        if record.batch_number != number {
            return Err(RunError::InvalidCheckpoint {
                path,
                reason: format!(
                    "file is numbered {number} but holds batch {}",
                    record.batch_number
                ),
            }
            .into());
        }
        if record.processed > record.total {
            return Err(RunError::InvalidCheckpoint {
                path,
                reason: format!(
                    "processed count {} exceeds total {}",
                    record.processed, record.total
                ),
            }
            .into());
        }
        Ok(Some(record))
    }

    pub fn clear(&self) -> Result<usize> {
        let records = self.list()?;
        for (_, path) in &records {
            fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(records.len())
    }
}

fn parse_record_name(name: &str) -> Option<usize> {
    let digits = name.strip_prefix(RECORD_PREFIX)?.strip_suffix(RECORD_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
