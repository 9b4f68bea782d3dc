//! Capture metadata readers.
//!
//! Two adapters share the [`MetadataSource`] interface: EXIF for camera
//! originals and file-name parsing for collections that were already
//! renamed into identity form. One is chosen at the boundary via
//! [`MetadataSourceKind`] and the pipeline never branches on it again.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use chrono::NaiveDateTime;
use serde::Deserialize;

use crate::exif;
use crate::identity::decode_counter;
use crate::models::DeviceInfo;

/// APP1 segments are capped at 64 KiB and sit near the start of the file.
const HEADER_READ_LIMIT: u64 = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureMetadata {
    pub timestamp: NaiveDateTime,
    /// Fractional seconds as recorded, e.g. `"123"` for .123 s.
    pub subsecond: Option<String>,
    pub timezone_original: Option<String>,
    pub device: DeviceInfo,
    /// Burst position supplied by the source itself; overrides the
    /// sequence number parsed from the file name.
    pub sequence_hint: Option<u64>,
}

pub trait MetadataSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` means the file has no usable capture timestamp.
    fn read(&self, path: &Path) -> io::Result<Option<CaptureMetadata>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataSourceKind {
    #[default]
    Exif,
    Filename,
}

impl MetadataSourceKind {
    pub fn source(self) -> Box<dyn MetadataSource> {
        match self {
            MetadataSourceKind::Exif => Box::new(ExifMetadataSource),
            MetadataSourceKind::Filename => Box::new(FilenameMetadataSource),
        }
    }
}

pub struct ExifMetadataSource;

impl MetadataSource for ExifMetadataSource {
    fn name(&self) -> &'static str {
        "exif"
    }

    fn read(&self, path: &Path) -> io::Result<Option<CaptureMetadata>> {
        let mut header = Vec::new();
        File::open(path)?
            .take(HEADER_READ_LIMIT)
            .read_to_end(&mut header)?;
        let fields = match exif::read_capture(&header) {
            Ok(fields) => fields,
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "no readable EXIF");
                return Ok(None);
            }
        };
        Ok(fields.datetime_original.map(|timestamp| CaptureMetadata {
            timestamp,
            subsecond: fields.subsec_original,
            timezone_original: fields.offset_original,
            device: DeviceInfo {
                make: fields.make,
                model: fields.model,
            },
            sequence_hint: None,
        }))
    }
}

/// Reads `{collection}-{YYYYMMDDTHHMMSS}-{tag}-{counter}.jpg` names.
pub struct FilenameMetadataSource;

impl FilenameMetadataSource {
    pub fn parse(file_name: &str) -> Option<CaptureMetadata> {
        let stem = file_name.rsplit_once('.').map_or(file_name, |(stem, _)| stem);
        let mut parts = stem.rsplitn(4, '-');
        let counter = parts.next()?;
        let tag = parts.next()?;
        let timestamp = parts.next()?;
        let collection = parts.next()?;
        if collection.is_empty() || tag.is_empty() {
            return None;
        }
        let timestamp = NaiveDateTime::parse_from_str(timestamp, "%Y%m%dT%H%M%S").ok()?;
        Some(CaptureMetadata {
            timestamp,
            subsecond: None,
            timezone_original: None,
            device: DeviceInfo {
                make: None,
                model: Some(tag.to_string()),
            },
            sequence_hint: Some(u64::from(decode_counter(counter)?)),
        })
    }
}

impl MetadataSource for FilenameMetadataSource {
    fn name(&self) -> &'static str {
        "filename"
    }

    fn read(&self, path: &Path) -> io::Result<Option<CaptureMetadata>> {
        if !path.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(Self::parse(&name))
    }
}
