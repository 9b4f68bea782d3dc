//! Builds small but structurally valid JPEG files for tests.
//!
//! Shared with the integration tests through `tests/common`, so it only
//! depends on the standard library.

const TAG_MAKE: u16 = 0x010F;
const TAG_MODEL: u16 = 0x0110;
const TAG_EXIF_IFD: u16 = 0x8769;
const TAG_DATETIME_ORIGINAL: u16 = 0x9003;
const TAG_OFFSET_TIME_ORIGINAL: u16 = 0x9011;
const TAG_SUBSEC_TIME_ORIGINAL: u16 = 0x9291;
const TAG_THUMBNAIL_OFFSET: u16 = 0x0201;
const TAG_THUMBNAIL_LENGTH: u16 = 0x0202;

const TYPE_ASCII: u16 = 2;
const TYPE_LONG: u16 = 4;

struct RawEntry {
    tag: u16,
    kind: u16,
    count: u32,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct JpegBuilder {
    big_endian: bool,
    jfif: bool,
    make: Option<String>,
    model: Option<String>,
    datetime_original: Option<String>,
    subsec: Option<String>,
    offset: Option<String>,
    thumbnail: Option<Vec<u8>>,
    scan: Vec<u8>,
}

impl JpegBuilder {
    pub fn new() -> Self {
        Self {
            scan: vec![0x12, 0x34, 0x56, 0x78],
            ..Self::default()
        }
    }

    pub fn big_endian(mut self, big_endian: bool) -> Self {
        self.big_endian = big_endian;
        self
    }

    pub fn with_jfif(mut self) -> Self {
        self.jfif = true;
        self
    }

    pub fn make(mut self, make: &str) -> Self {
        self.make = Some(make.to_string());
        self
    }

    pub fn model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn datetime_original(mut self, value: &str) -> Self {
        self.datetime_original = Some(value.to_string());
        self
    }

    pub fn subsec(mut self, value: &str) -> Self {
        self.subsec = Some(value.to_string());
        self
    }

    pub fn offset(mut self, value: &str) -> Self {
        self.offset = Some(value.to_string());
        self
    }

    pub fn thumbnail(mut self, bytes: Vec<u8>) -> Self {
        self.thumbnail = Some(bytes);
        self
    }

    /// Entropy-coded payload placed after the scan header; vary it to make
    /// otherwise identical files hash differently.
    pub fn scan_data(mut self, bytes: &[u8]) -> Self {
        self.scan = bytes.to_vec();
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let tiff = self.tiff();
        let mut out = vec![0xFF, 0xD8];
        if self.jfif {
            out.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
            out.extend_from_slice(b"JFIF\0");
            out.extend_from_slice(&[1, 1, 0, 0, 1, 0, 1, 0, 0]);
        }
        let segment_len = (2 + 6 + tiff.len()) as u16;
        out.extend_from_slice(&[0xFF, 0xE1]);
        out.extend_from_slice(&segment_len.to_be_bytes());
        out.extend_from_slice(b"Exif\0\0");
        out.extend_from_slice(&tiff);
        out.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x08, 1, 1, 0, 0, 0x3F, 0]);
        out.extend_from_slice(&self.scan);
        out.extend_from_slice(&[0xFF, 0xD9]);
        out
    }

    fn u16_bytes(&self, value: u16) -> [u8; 2] {
        if self.big_endian {
            value.to_be_bytes()
        } else {
            value.to_le_bytes()
        }
    }

    fn u32_bytes(&self, value: u32) -> [u8; 4] {
        if self.big_endian {
            value.to_be_bytes()
        } else {
            value.to_le_bytes()
        }
    }

    fn ascii(tag: u16, text: &str) -> RawEntry {
        let mut data = text.as_bytes().to_vec();
        data.push(0);
        RawEntry {
            tag,
            kind: TYPE_ASCII,
            count: data.len() as u32,
            data,
        }
    }

    fn long(&self, tag: u16, value: u32) -> RawEntry {
        RawEntry {
            tag,
            kind: TYPE_LONG,
            count: 1,
            data: self.u32_bytes(value).to_vec(),
        }
    }

    fn ifd_len(entries: &[RawEntry]) -> usize {
        let values: usize = entries
            .iter()
            .filter(|entry| entry.data.len() > 4)
            .map(|entry| entry.data.len() + entry.data.len() % 2)
            .sum();
        2 + entries.len() * 12 + 4 + values
    }

    fn write_ifd(&self, out: &mut Vec<u8>, entries: &mut [RawEntry], next: u32) {
        entries.sort_by_key(|entry| entry.tag);
        let start = out.len();
        let mut value_pos = start + 2 + entries.len() * 12 + 4;
        let mut values = Vec::new();
        out.extend_from_slice(&self.u16_bytes(entries.len() as u16));
        for entry in entries.iter() {
            out.extend_from_slice(&self.u16_bytes(entry.tag));
            out.extend_from_slice(&self.u16_bytes(entry.kind));
            out.extend_from_slice(&self.u32_bytes(entry.count));
            if entry.data.len() <= 4 {
                let mut inline = entry.data.clone();
                inline.resize(4, 0);
                out.extend_from_slice(&inline);
            } else {
                out.extend_from_slice(&self.u32_bytes(value_pos as u32));
                values.extend_from_slice(&entry.data);
                if entry.data.len() % 2 == 1 {
                    values.push(0);
                }
                value_pos = start + 2 + entries.len() * 12 + 4 + values.len();
            }
        }
        out.extend_from_slice(&self.u32_bytes(next));
        out.extend_from_slice(&values);
    }

    fn tiff(&self) -> Vec<u8> {
        let mut exif = Vec::new();
        if let Some(value) = &self.datetime_original {
            exif.push(Self::ascii(TAG_DATETIME_ORIGINAL, value));
        }
        if let Some(value) = &self.offset {
            exif.push(Self::ascii(TAG_OFFSET_TIME_ORIGINAL, value));
        }
        if let Some(value) = &self.subsec {
            exif.push(Self::ascii(TAG_SUBSEC_TIME_ORIGINAL, value));
        }

        let mut ifd0 = Vec::new();
        if let Some(value) = &self.make {
            ifd0.push(Self::ascii(TAG_MAKE, value));
        }
        if let Some(value) = &self.model {
            ifd0.push(Self::ascii(TAG_MODEL, value));
        }
        if !exif.is_empty() {
            // placeholder, patched once the layout is known
            ifd0.push(self.long(TAG_EXIF_IFD, 0));
        }

        let ifd0_offset = 8usize;
        let exif_offset = ifd0_offset + Self::ifd_len(&ifd0);
        let ifd1_offset = exif_offset + if exif.is_empty() { 0 } else { Self::ifd_len(&exif) };
        if let Some(pointer) = ifd0.iter_mut().find(|entry| entry.tag == TAG_EXIF_IFD) {
            pointer.data = self.u32_bytes(exif_offset as u32).to_vec();
        }

        let mut ifd1 = Vec::new();
        if let Some(thumb) = &self.thumbnail {
            ifd1.push(self.long(TAG_THUMBNAIL_OFFSET, 0));
            ifd1.push(self.long(TAG_THUMBNAIL_LENGTH, thumb.len() as u32));
            let thumb_offset = ifd1_offset + Self::ifd_len(&ifd1);
            ifd1[0].data = self.u32_bytes(thumb_offset as u32).to_vec();
        }

        let mut out = Vec::new();
        out.extend_from_slice(if self.big_endian { b"MM" } else { b"II" });
        out.extend_from_slice(&self.u16_bytes(42));
        out.extend_from_slice(&self.u32_bytes(ifd0_offset as u32));
        let next = if ifd1.is_empty() { 0 } else { ifd1_offset as u32 };
        self.write_ifd(&mut out, &mut ifd0, next);
        if !exif.is_empty() {
            self.write_ifd(&mut out, &mut exif, 0);
        }
        if let Some(thumb) = &self.thumbnail {
            self.write_ifd(&mut out, &mut ifd1, 0);
            out.extend_from_slice(thumb);
        }
        out
    }
}
