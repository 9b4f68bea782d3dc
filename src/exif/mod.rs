//! Minimal JPEG/EXIF codec.
//!
//! Only the handful of tags the pipeline cares about are interpreted:
//! capture time, sub-second time, capture offset, camera make/model and the
//! embedded IFD1 thumbnail. Rewrites never reorder or move existing TIFF
//! data; new data is appended to the end of the TIFF block so every
//! absolute offset already in the file stays valid.

mod rewrite;
#[cfg(test)]
pub(crate) mod testing;

pub use rewrite::rewrite_capture_time;

use std::ops::Range;

use chrono::NaiveDateTime;

pub(crate) const TAG_MAKE: u16 = 0x010F;
pub(crate) const TAG_MODEL: u16 = 0x0110;
pub(crate) const TAG_EXIF_IFD: u16 = 0x8769;
pub(crate) const TAG_DATETIME_ORIGINAL: u16 = 0x9003;
pub(crate) const TAG_OFFSET_TIME_ORIGINAL: u16 = 0x9011;
pub(crate) const TAG_SUBSEC_TIME_ORIGINAL: u16 = 0x9291;
pub(crate) const TAG_THUMBNAIL_OFFSET: u16 = 0x0201;
pub(crate) const TAG_THUMBNAIL_LENGTH: u16 = 0x0202;

pub(crate) const TYPE_ASCII: u16 = 2;
pub(crate) const TYPE_SHORT: u16 = 3;
pub(crate) const TYPE_LONG: u16 = 4;

pub(crate) const EXIF_DATETIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";
const EXIF_HEADER: &[u8] = b"Exif\0\0";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExifError {
    #[error("not a JPEG stream")]
    NotJpeg,
    #[error("no EXIF block before image data")]
    NoExif,
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("invalid TIFF structure: {0}")]
    InvalidTiff(String),
    #[error("DateTimeOriginal tag is missing")]
    MissingDateTimeOriginal,
    #[error("rewritten EXIF block exceeds the 64 KiB segment limit")]
    TooLarge,
}

/// Capture fields read out of an EXIF block. Absent or blank tags are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureFields {
    pub datetime_original: Option<NaiveDateTime>,
    pub subsec_original: Option<String>,
    pub offset_original: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
}

/// Byte position of the APP1 EXIF segment inside a JPEG stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExifLocation {
    pub segment_start: usize,
    pub segment_end: usize,
    pub tiff_start: usize,
}

pub(crate) fn locate(bytes: &[u8]) -> Result<ExifLocation, ExifError> {
    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] != 0xD8 {
        return Err(ExifError::NotJpeg);
    }
    let mut pos = 2usize;
    loop {
        if pos + 4 > bytes.len() {
            return Err(ExifError::NoExif);
        }
        if bytes[pos] != 0xFF {
            return Err(ExifError::Truncated("segment marker"));
        }
        let marker = bytes[pos + 1];
        match marker {
            0xFF => {
                pos += 1;
                continue;
            }
            // start of scan or end of image: metadata segments are over
            0xDA | 0xD9 => return Err(ExifError::NoExif),
            0x01 | 0xD0..=0xD7 => {
                pos += 2;
                continue;
            }
            _ => {}
        }
        let length = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
        if length < 2 {
            return Err(ExifError::Truncated("segment length"));
        }
        let end = pos + 2 + length;
        if end > bytes.len() {
            return Err(ExifError::Truncated("segment"));
        }
        if marker == 0xE1 && bytes[pos + 4..end].starts_with(EXIF_HEADER) {
            return Ok(ExifLocation {
                segment_start: pos,
                segment_end: end,
                tiff_start: pos + 4 + EXIF_HEADER.len(),
            });
        }
        pos = end;
    }
}

/// One 12-byte IFD record. `pos` is the record's offset inside the TIFF block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Entry {
    pub pos: usize,
    pub tag: u16,
    pub kind: u16,
    pub count: u32,
    pub raw: u32,
}

impl Entry {
    fn type_size(&self) -> Option<usize> {
        match self.kind {
            1 | 2 | 6 | 7 => Some(1),
            3 | 8 => Some(2),
            4 | 9 | 11 => Some(4),
            5 | 10 | 12 => Some(8),
            _ => None,
        }
    }

    pub fn data_range(&self, tiff_len: usize) -> Result<Range<usize>, ExifError> {
        let size = self
            .type_size()
            .ok_or_else(|| ExifError::InvalidTiff(format!("tag {:#06x} has unknown type {}", self.tag, self.kind)))?;
        let len = size
            .checked_mul(self.count as usize)
            .ok_or_else(|| ExifError::InvalidTiff("value length overflow".into()))?;
        let start = if len <= 4 { self.pos + 8 } else { self.raw as usize };
        let end = start
            .checked_add(len)
            .ok_or_else(|| ExifError::InvalidTiff("value offset overflow".into()))?;
        if end > tiff_len {
            return Err(ExifError::Truncated("tag value"));
        }
        Ok(start..end)
    }
}

pub(crate) struct Tiff<'a> {
    data: &'a [u8],
    little: bool,
}

impl<'a> Tiff<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, ExifError> {
        if data.len() < 8 {
            return Err(ExifError::Truncated("TIFF header"));
        }
        let little = match &data[..2] {
            b"II" => true,
            b"MM" => false,
            _ => return Err(ExifError::InvalidTiff("unknown byte order".into())),
        };
        let tiff = Self { data, little };
        if tiff.u16_at(2)? != 42 {
            return Err(ExifError::InvalidTiff("bad magic number".into()));
        }
        Ok(tiff)
    }

    pub fn little_endian(&self) -> bool {
        self.little
    }

    pub fn u16_at(&self, pos: usize) -> Result<u16, ExifError> {
        let bytes = self
            .data
            .get(pos..pos + 2)
            .ok_or(ExifError::Truncated("TIFF field"))?;
        let pair = [bytes[0], bytes[1]];
        Ok(if self.little {
            u16::from_le_bytes(pair)
        } else {
            u16::from_be_bytes(pair)
        })
    }

    pub fn u32_at(&self, pos: usize) -> Result<u32, ExifError> {
        let bytes = self
            .data
            .get(pos..pos + 4)
            .ok_or(ExifError::Truncated("TIFF field"))?;
        let quad = [bytes[0], bytes[1], bytes[2], bytes[3]];
        Ok(if self.little {
            u32::from_le_bytes(quad)
        } else {
            u32::from_be_bytes(quad)
        })
    }

    pub fn ifd0_offset(&self) -> Result<usize, ExifError> {
        Ok(self.u32_at(4)? as usize)
    }

    pub fn entries(&self, offset: usize) -> Result<Vec<Entry>, ExifError> {
        let count = self.u16_at(offset)? as usize;
        let mut entries = Vec::with_capacity(count);
        for index in 0..count {
            let pos = offset + 2 + index * 12;
            entries.push(Entry {
                pos,
                tag: self.u16_at(pos)?,
                kind: self.u16_at(pos + 2)?,
                count: self.u32_at(pos + 4)?,
                raw: self.u32_at(pos + 8)?,
            });
        }
        Ok(entries)
    }

    /// Offset of the IFD that follows the table at `offset`, 0 when none.
    pub fn next_ifd(&self, offset: usize) -> Result<usize, ExifError> {
        let count = self.u16_at(offset)? as usize;
        Ok(self.u32_at(offset + 2 + count * 12)? as usize)
    }

    pub fn ascii(&self, entry: &Entry) -> Result<Option<String>, ExifError> {
        let range = entry.data_range(self.data.len())?;
        let raw = &self.data[range];
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        let text = String::from_utf8_lossy(&raw[..end]).trim().to_string();
        Ok(if text.is_empty() { None } else { Some(text) })
    }

    /// Integer value of a SHORT or LONG entry.
    pub fn unsigned(&self, entry: &Entry) -> Result<u32, ExifError> {
        match entry.kind {
            TYPE_SHORT => self.u16_at(entry.pos + 8).map(u32::from),
            TYPE_LONG => Ok(entry.raw),
            other => Err(ExifError::InvalidTiff(format!(
                "tag {:#06x} expected an integer, found type {other}",
                entry.tag
            ))),
        }
    }

    pub fn exif_ifd_offset(&self, ifd0: &[Entry]) -> Result<Option<usize>, ExifError> {
        match find(ifd0, TAG_EXIF_IFD) {
            Some(entry) => Ok(Some(self.unsigned(entry)? as usize)),
            None => Ok(None),
        }
    }
}

pub(crate) fn find(entries: &[Entry], tag: u16) -> Option<&Entry> {
    entries.iter().find(|entry| entry.tag == tag)
}

fn parse_exif_datetime(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, EXIF_DATETIME_FORMAT).ok()
}

pub fn read_capture(bytes: &[u8]) -> Result<CaptureFields, ExifError> {
    let location = locate(bytes)?;
    let tiff = Tiff::parse(&bytes[location.tiff_start..location.segment_end])?;
    let ifd0 = tiff.entries(tiff.ifd0_offset()?)?;

    let mut fields = CaptureFields::default();
    if let Some(entry) = find(&ifd0, TAG_MAKE) {
        fields.make = tiff.ascii(entry)?;
    }
    if let Some(entry) = find(&ifd0, TAG_MODEL) {
        fields.model = tiff.ascii(entry)?;
    }

    let Some(exif_offset) = tiff.exif_ifd_offset(&ifd0)? else {
        return Ok(fields);
    };
    let exif = tiff.entries(exif_offset)?;
    if let Some(entry) = find(&exif, TAG_DATETIME_ORIGINAL) {
        fields.datetime_original = tiff.ascii(entry)?.as_deref().and_then(parse_exif_datetime);
    }
    if let Some(entry) = find(&exif, TAG_SUBSEC_TIME_ORIGINAL) {
        fields.subsec_original = tiff.ascii(entry)?;
    }
    if let Some(entry) = find(&exif, TAG_OFFSET_TIME_ORIGINAL) {
        fields.offset_original = tiff.ascii(entry)?;
    }
    Ok(fields)
}

/// Returns the JPEG thumbnail stored in IFD1, if the file carries one.
pub fn embedded_thumbnail(bytes: &[u8]) -> Option<Vec<u8>> {
    let location = locate(bytes).ok()?;
    let data = &bytes[location.tiff_start..location.segment_end];
    let tiff = Tiff::parse(data).ok()?;
    let ifd1 = tiff.next_ifd(tiff.ifd0_offset().ok()?).ok()?;
    if ifd1 == 0 {
        return None;
    }
    let entries = tiff.entries(ifd1).ok()?;
    let offset = tiff.unsigned(find(&entries, TAG_THUMBNAIL_OFFSET)?).ok()? as usize;
    let length = tiff.unsigned(find(&entries, TAG_THUMBNAIL_LENGTH)?).ok()? as usize;
    let thumb = data.get(offset..offset.checked_add(length)?)?;
    if thumb.starts_with(&[0xFF, 0xD8]) {
        Some(thumb.to_vec())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::testing::JpegBuilder;
    use super::*;

    #[test]
    fn reads_capture_fields_in_both_byte_orders() {
        for big_endian in [false, true] {
            let jpeg = JpegBuilder::new()
                .big_endian(big_endian)
                .with_jfif()
                .make("Canon")
                .model("Canon EOS R5")
                .datetime_original("2024:08:10 14:30:45")
                .subsec("123")
                .offset("+01:00")
                .build();
            let fields = read_capture(&jpeg).unwrap();
            assert_eq!(fields.make.as_deref(), Some("Canon"));
            assert_eq!(fields.model.as_deref(), Some("Canon EOS R5"));
            assert_eq!(
                fields.datetime_original.unwrap().to_string(),
                "2024-08-10 14:30:45"
            );
            assert_eq!(fields.subsec_original.as_deref(), Some("123"));
            assert_eq!(fields.offset_original.as_deref(), Some("+01:00"));
        }
    }

    #[test]
    fn blank_datetime_reads_as_absent() {
        let jpeg = JpegBuilder::new()
            .datetime_original("0000:00:00 00:00:00")
            .build();
        assert_eq!(read_capture(&jpeg).unwrap().datetime_original, None);
    }

    #[test]
    fn rejects_non_jpeg_and_missing_exif() {
        assert_eq!(read_capture(b"not an image"), Err(ExifError::NotJpeg));
        let bare = [0xFF, 0xD8, 0xFF, 0xDA, 0x00, 0x02, 0xFF, 0xD9];
        assert_eq!(read_capture(&bare), Err(ExifError::NoExif));
    }

    #[test]
    fn extracts_embedded_thumbnail() {
        let thumb = vec![0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9];
        let jpeg = JpegBuilder::new()
            .datetime_original("2024:08:10 14:30:45")
            .thumbnail(thumb.clone())
            .build();
        assert_eq!(embedded_thumbnail(&jpeg), Some(thumb));

        let without = JpegBuilder::new()
            .datetime_original("2024:08:10 14:30:45")
            .build();
        assert_eq!(embedded_thumbnail(&without), None);
    }
}
