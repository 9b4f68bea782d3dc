use chrono::NaiveDateTime;

use super::{
    find, locate, Entry, ExifError, Tiff, EXIF_DATETIME_FORMAT, EXIF_HEADER, TAG_DATETIME_ORIGINAL,
    TAG_OFFSET_TIME_ORIGINAL, TYPE_ASCII,
};

const MAX_SEGMENT_LEN: usize = 0xFFFF;

/// Returns a copy of `bytes` whose `DateTimeOriginal` is `timestamp` and,
/// when `offset_hours` is set, whose `OffsetTimeOriginal` is `±HH:00`.
/// Everything outside the EXIF segment is copied through untouched.
pub fn rewrite_capture_time(
    bytes: &[u8],
    timestamp: NaiveDateTime,
    offset_hours: Option<i32>,
) -> Result<Vec<u8>, ExifError> {
    let location = locate(bytes)?;
    let mut tiff = bytes[location.tiff_start..location.segment_end].to_vec();

    let (little, exif_pointer, exif_offset, exif_entries) = {
        let view = Tiff::parse(&tiff)?;
        let ifd0 = view.entries(view.ifd0_offset()?)?;
        let pointer = *find(&ifd0, super::TAG_EXIF_IFD).ok_or(ExifError::MissingDateTimeOriginal)?;
        let offset = view.unsigned(&pointer)? as usize;
        (view.little_endian(), pointer, offset, view.entries(offset)?)
    };

    let original = find(&exif_entries, TAG_DATETIME_ORIGINAL).ok_or(ExifError::MissingDateTimeOriginal)?;
    let stamp = timestamp.format(EXIF_DATETIME_FORMAT).to_string();
    write_ascii_in_place(&mut tiff, original, &stamp)?;

    if let Some(hours) = offset_hours {
        let offset = format_offset(hours);
        let existing = find(&exif_entries, TAG_OFFSET_TIME_ORIGINAL).copied();
        let written_in_place = match existing {
            Some(entry) => write_ascii_in_place(&mut tiff, &entry, &offset).is_ok(),
            None => false,
        };
        if !written_in_place {
            let next_ifd = {
                let view = Tiff::parse(&tiff)?;
                view.next_ifd(exif_offset)? as u32
            };
            append_exif_ifd(
                &mut tiff,
                little,
                &exif_pointer,
                &exif_entries,
                next_ifd,
                TAG_OFFSET_TIME_ORIGINAL,
                &offset,
            )?;
        }
    }

    let segment_len = 2 + EXIF_HEADER.len() + tiff.len();
    if segment_len > MAX_SEGMENT_LEN {
        return Err(ExifError::TooLarge);
    }
    let mut out = Vec::with_capacity(bytes.len() + segment_len);
    out.extend_from_slice(&bytes[..location.segment_start]);
    out.extend_from_slice(&[0xFF, 0xE1]);
    out.extend_from_slice(&(segment_len as u16).to_be_bytes());
    out.extend_from_slice(EXIF_HEADER);
    out.extend_from_slice(&tiff);
    out.extend_from_slice(&bytes[location.segment_end..]);
    Ok(out)
}

pub(crate) fn format_offset(hours: i32) -> String {
    let sign = if hours < 0 { '-' } else { '+' };
    format!("{sign}{:02}:00", hours.abs())
}

fn write_ascii_in_place(tiff: &mut [u8], entry: &Entry, text: &str) -> Result<(), ExifError> {
    let range = entry.data_range(tiff.len())?;
    if entry.kind != TYPE_ASCII || range.len() < text.len() + 1 {
        return Err(ExifError::InvalidTiff(format!(
            "tag {:#06x} cannot hold {} bytes in place",
            entry.tag,
            text.len() + 1
        )));
    }
    let slot = &mut tiff[range];
    slot.fill(0);
    slot[..text.len()].copy_from_slice(text.as_bytes());
    Ok(())
}

fn put_u16(buf: &mut Vec<u8>, little: bool, value: u16) {
    if little {
        buf.extend_from_slice(&value.to_le_bytes());
    } else {
        buf.extend_from_slice(&value.to_be_bytes());
    }
}

fn put_u32(buf: &mut Vec<u8>, little: bool, value: u32) {
    if little {
        buf.extend_from_slice(&value.to_le_bytes());
    } else {
        buf.extend_from_slice(&value.to_be_bytes());
    }
}

/// Copies the Exif IFD to the end of the TIFF block with `tag` set to
/// `text`, then repoints IFD0 at the copy. Values stored out of line keep
/// their original absolute offsets.
fn append_exif_ifd(
    tiff: &mut Vec<u8>,
    little: bool,
    pointer: &Entry,
    entries: &[Entry],
    next_ifd: u32,
    tag: u16,
    text: &str,
) -> Result<(), ExifError> {
    if tiff.len() % 2 == 1 {
        tiff.push(0);
    }
    let ifd_start = tiff.len();
    let kept: Vec<&Entry> = entries.iter().filter(|entry| entry.tag != tag).collect();
    let count = kept.len() + 1;
    let value_pos = ifd_start + 2 + count * 12 + 4;
    let value_pos = u32::try_from(value_pos).map_err(|_| ExifError::TooLarge)?;
    let mut value = text.as_bytes().to_vec();
    value.push(0);

    let mut records: Vec<(u16, Vec<u8>)> = kept
        .iter()
        .map(|entry| (entry.tag, tiff[entry.pos..entry.pos + 12].to_vec()))
        .collect();
    let mut added = Vec::with_capacity(12);
    put_u16(&mut added, little, tag);
    put_u16(&mut added, little, TYPE_ASCII);
    put_u32(&mut added, little, value.len() as u32);
    put_u32(&mut added, little, value_pos);
    records.push((tag, added));
    records.sort_by_key(|(tag, _)| *tag);

    let mut table = Vec::with_capacity(2 + count * 12 + 4 + value.len());
    put_u16(&mut table, little, count as u16);
    for (_, record) in &records {
        table.extend_from_slice(record);
    }
    put_u32(&mut table, little, next_ifd);
    table.extend_from_slice(&value);
    tiff.extend_from_slice(&table);

    let start = u32::try_from(ifd_start).map_err(|_| ExifError::TooLarge)?;
    let field = pointer.pos + 8;
    let encoded = if little {
        start.to_le_bytes()
    } else {
        start.to_be_bytes()
    };
    tiff[field..field + 4].copy_from_slice(&encoded);
    Ok(())
}
