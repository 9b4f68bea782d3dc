//! Human-readable progress lines.
//!
//! Emitted on stderr so stdout stays free for `--json` summaries. Not a
//! programmatic contract.

use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    BatchStarted {
        batch: usize,
        total_batches: usize,
        items: usize,
    },
    Item {
        index: usize,
        total: usize,
        path: PathBuf,
    },
    BatchCheckpointed {
        batch: usize,
        path: PathBuf,
    },
    Upload {
        index: usize,
        total: usize,
        key: String,
    },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::BatchStarted {
                batch,
                total_batches,
                items,
            } => format!("batch {batch}/{total_batches}: {items} items\n"),
            ProgressEvent::Item { index, total, path } => format!(
                "  processing item {index} of {total}: {}\n",
                path.file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_default()
            ),
            ProgressEvent::BatchCheckpointed { batch, path } => {
                format!("batch {batch} checkpointed to {}\n", path.display())
            }
            ProgressEvent::Upload { index, total, key } => {
                format!("  uploading {index} of {total}: {key}\n")
            }
        };
        let _ = std::io::stderr().write_all(line.as_bytes());
    }
}

/// Discards events; used by tests and `--json` runs.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn report(&self, _event: ProgressEvent) {}
}
