//! Collection analysis ahead of processing: how captures are spaced, which
//! devices contributed, and how large the same-second tie groups get.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::Serialize;

use crate::identity::device_tag;
use crate::metadata::MetadataSource;
use crate::models::{SettingsSnapshot, Variant};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceCount {
    pub tag: String,
    /// First camera seen with this tag.
    pub camera: String,
    pub count: usize,
}

/// Largest group of captures sharing a corrected second and device tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Burst {
    pub timestamp: NaiveDateTime,
    pub device_tag: String,
    pub size: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionStats {
    pub files: usize,
    pub total_bytes: u64,
    pub with_timestamp: usize,
    pub without_timestamp: Vec<PathBuf>,
    pub earliest: Option<NaiveDateTime>,
    pub latest: Option<NaiveDateTime>,
    pub mean_gap_seconds: Option<f64>,
    pub longest_gap_seconds: Option<i64>,
    pub devices: Vec<DeviceCount>,
    /// Recorded capture offsets; `"none"` counts files without one.
    pub timezones: BTreeMap<String, usize>,
    pub tie_groups: usize,
    pub tied_items: usize,
    pub largest_burst: Option<Burst>,
}

pub fn analyze(
    paths: &[PathBuf],
    source: &dyn MetadataSource,
    settings: &SettingsSnapshot,
) -> CollectionStats {
    let mut stats = CollectionStats {
        files: paths.len(),
        ..CollectionStats::default()
    };
    let mut timestamps = Vec::with_capacity(paths.len());
    let mut devices: BTreeMap<String, DeviceCount> = BTreeMap::new();
    let mut groups: BTreeMap<(NaiveDateTime, String), usize> = BTreeMap::new();

    for path in paths {
        stats.total_bytes += fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
        let capture = match source.read(path) {
            Ok(Some(capture)) => capture,
            Ok(None) => {
                stats.without_timestamp.push(path.clone());
                continue;
            }
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "unreadable");
                stats.without_timestamp.push(path.clone());
                continue;
            }
        };
        let corrected = settings.correct(capture.timestamp);
        let tag = device_tag(capture.device.make.as_deref(), capture.device.model.as_deref());
        timestamps.push(corrected);
        devices
            .entry(tag.clone())
            .or_insert_with(|| DeviceCount {
                tag: tag.clone(),
                camera: capture.device.to_string(),
                count: 0,
            })
            .count += 1;
        let zone = capture.timezone_original.unwrap_or_else(|| "none".to_string());
        *stats.timezones.entry(zone).or_default() += 1;
        *groups.entry((corrected, tag)).or_default() += 1;
    }

    timestamps.sort();
    stats.with_timestamp = timestamps.len();
    stats.earliest = timestamps.first().copied();
    stats.latest = timestamps.last().copied();
    let gaps: Vec<i64> = timestamps
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).num_seconds())
        .collect();
    if !gaps.is_empty() {
        stats.mean_gap_seconds = Some(gaps.iter().sum::<i64>() as f64 / gaps.len() as f64);
        stats.longest_gap_seconds = gaps.iter().max().copied();
    }

    stats.devices = devices.into_values().collect();
    stats
        .devices
        .sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tag.cmp(&b.tag)));

    for ((timestamp, tag), size) in groups {
        if size < 2 {
            continue;
        }
        stats.tie_groups += 1;
        stats.tied_items += size;
        if stats.largest_burst.as_ref().map_or(true, |burst| size > burst.size) {
            stats.largest_burst = Some(Burst {
                timestamp,
                device_tag: tag,
                size,
            });
        }
    }
    stats
}

/// Files per variant directory of a processed output, or `None` when
/// nothing was processed there yet.
pub fn count_variants(output_dir: &Path) -> Result<Option<BTreeMap<Variant, usize>>> {
    if !output_dir.exists() {
        return Ok(None);
    }
    let mut counts = BTreeMap::new();
    for variant in Variant::ALL {
        let dir = output_dir.join(variant.as_str());
        let count = if dir.is_dir() {
            fs::read_dir(&dir)
                .with_context(|| format!("failed to list {}", dir.display()))?
                .filter_map(|entry| entry.ok())
                .count()
        } else {
            0
        };
        counts.insert(variant, count);
    }
    Ok(Some(counts))
}
