use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: &str = "1.0";

/// Offset value that means "leave the captured timezone untouched".
pub const PRESERVE_TIMEZONE_SENTINEL: i32 = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum TimezoneContext {
    PreserveOriginal,
    /// Whole hours east of UTC.
    Offset(i32),
}

impl TimezoneContext {
    pub fn from_hours(hours: i32) -> Result<Self, String> {
        if hours == PRESERVE_TIMEZONE_SENTINEL {
            Ok(TimezoneContext::PreserveOriginal)
        } else if (-12..=14).contains(&hours) {
            Ok(TimezoneContext::Offset(hours))
        } else {
            Err(format!(
                "timezone offset {hours} is outside -12..=14 (use {PRESERVE_TIMEZONE_SENTINEL} to preserve)"
            ))
        }
    }

    pub fn offset_hours(&self) -> Option<i32> {
        match self {
            TimezoneContext::PreserveOriginal => None,
            TimezoneContext::Offset(hours) => Some(*hours),
        }
    }
}

impl From<TimezoneContext> for i32 {
    fn from(value: TimezoneContext) -> Self {
        match value {
            TimezoneContext::PreserveOriginal => PRESERVE_TIMEZONE_SENTINEL,
            TimezoneContext::Offset(hours) => hours,
        }
    }
}

impl TryFrom<i32> for TimezoneContext {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        TimezoneContext::from_hours(value)
    }
}

impl fmt::Display for TimezoneContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimezoneContext::PreserveOriginal => write!(f, "preserve original"),
            TimezoneContext::Offset(hours) => write!(f, "UTC{hours:+03}:00"),
        }
    }
}

/// Transformation parameters every `published_hash` in a document was
/// computed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    pub timestamp_offset_hours: i32,
    #[serde(rename = "target_timezone_offset_hours")]
    pub timezone: TimezoneContext,
}

impl Default for SettingsSnapshot {
    fn default() -> Self {
        Self {
            timestamp_offset_hours: 0,
            timezone: TimezoneContext::PreserveOriginal,
        }
    }
}

impl SettingsSnapshot {
    pub fn correct(&self, raw: NaiveDateTime) -> NaiveDateTime {
        raw + Duration::hours(i64::from(self.timestamp_offset_hours))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub make: Option<String>,
    pub model: Option<String>,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.make, &self.model) {
            (Some(make), Some(model)) => write!(f, "{make} {model}"),
            (Some(only), None) | (None, Some(only)) => write!(f, "{only}"),
            (None, None) => write!(f, "unknown device"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Full,
    Web,
    Thumb,
}

impl Variant {
    pub const ALL: [Variant; 3] = [Variant::Full, Variant::Web, Variant::Thumb];

    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Full => "full",
            Variant::Web => "web",
            Variant::Thumb => "thumb",
        }
    }

    /// Whether the published copy carries the rewritten capture metadata.
    /// Thumbnails are derived output and ship as produced.
    pub fn rewrites_metadata(&self) -> bool {
        !matches!(self, Variant::Thumb)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub identity: String,
    pub source_path: PathBuf,
    pub capture_timestamp_raw: NaiveDateTime,
    pub capture_timestamp_corrected: NaiveDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsecond: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone_original: Option<String>,
    pub timezone_context: TimezoneContext,
    pub device_info: DeviceInfo,
    pub source_hash: String,
    pub published_hash: String,
    /// Paths relative to the output directory the document lives in.
    pub variant_paths: BTreeMap<Variant, PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub collection_name: String,
    pub settings_snapshot: SettingsSnapshot,
    pub items: Vec<Item>,
}

impl CollectionMetadata {
    pub fn new(collection_name: &str, settings: SettingsSnapshot) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            generated_at: Utc::now(),
            collection_name: collection_name.to_string(),
            settings_snapshot: settings,
            items: Vec::new(),
        }
    }

    /// Checks that every item was produced under this document's own
    /// settings snapshot. A document failing this must be reprocessed before
    /// it can be diffed.
    pub fn stale_items(&self) -> Vec<&Item> {
        self.items
            .iter()
            .filter(|item| {
                item.timezone_context != self.settings_snapshot.timezone
                    || item.capture_timestamp_corrected
                        != self.settings_snapshot.correct(item.capture_timestamp_raw)
            })
            .collect()
    }
}

/// Per-item failure as persisted in partial batch records and reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Durable checkpoint written after every batch: the cumulative document
/// so far plus the position processing reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialBatchRecord {
    pub batch_number: usize,
    /// Number of planned items consumed, successful or not.
    pub processed: usize,
    /// Total planned items when the record was written.
    pub total: usize,
    #[serde(default)]
    pub failures: Vec<ItemFailure>,
    #[serde(flatten)]
    pub document: CollectionMetadata,
}
