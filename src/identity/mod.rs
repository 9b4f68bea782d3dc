//! Chronological identity assignment.
//!
//! Identities look like `wedding-20240810T143045-r5a-0`. Candidates are
//! ordered by corrected capture time, sub-second tag, the sequence number
//! in the original file name, the file name itself and finally filesystem
//! creation time. Items that share a second and a device tag form a tie
//! group and receive consecutive counters in that order. All ordering state
//! lives inside a single [`IdentityAssigner::assign`] call.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::NaiveDateTime;

use crate::error::ItemError;
use crate::metadata::CaptureMetadata;
use crate::models::{CollectionMetadata, SettingsSnapshot};

const COUNTER_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHIJKLMNOPQRSTUV";
/// The last digit doubles as a "more digits follow" prefix.
const COUNTER_ESCAPE: u32 = 31;

const CAMERA_CODES: &[(&str, &str)] = &[
    ("canon eos r5", "r5a"),
    ("canon eos r6", "r6a"),
    ("canon eos 5d", "5da"),
    ("canon eos 6d", "6da"),
    ("nikon d850", "d85"),
    ("nikon d750", "d75"),
    ("sony a7r", "a7r"),
    ("sony a7 iii", "a73"),
    ("iphone 15", "i15"),
    ("iphone 14", "i14"),
    ("iphone 13", "i13"),
    ("iphone 12", "i12"),
    ("iphone", "iph"),
];

/// Encodes a burst counter so that lexical order equals numeric order:
/// `0`..`U` for 0..=30, then `V` followed by the encoding of `n - 31`.
pub fn encode_counter(mut value: u32) -> String {
    let mut out = String::new();
    while value >= COUNTER_ESCAPE {
        out.push('V');
        value -= COUNTER_ESCAPE;
    }
    out.push(COUNTER_ALPHABET[value as usize] as char);
    out
}

pub fn decode_counter(encoded: &str) -> Option<u32> {
    let digits = encoded.as_bytes();
    let (last, escapes) = digits.split_last()?;
    if escapes.iter().any(|b| *b != b'V') {
        return None;
    }
    let tail = COUNTER_ALPHABET
        .iter()
        .position(|c| *c == last.to_ascii_uppercase())? as u32;
    if tail == COUNTER_ESCAPE {
        return None;
    }
    Some(escapes.len() as u32 * COUNTER_ESCAPE + tail)
}

/// Three-character lowercase device code used in identities.
pub fn device_tag(make: Option<&str>, model: Option<&str>) -> String {
    let combined = format!("{} {}", make.unwrap_or(""), model.unwrap_or(""));
    let combined = combined.trim().to_lowercase();
    if combined.is_empty() {
        return "unk".to_string();
    }
    if let Some((_, code)) = CAMERA_CODES.iter().find(|(key, _)| combined.contains(key)) {
        return code.to_string();
    }
    let mut clean: String = combined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(3)
        .collect();
    if clean.is_empty() {
        return "unk".to_string();
    }
    while clean.len() < 3 {
        clean.push('x');
    }
    clean
}

/// Last run of digits in the file stem, e.g. `IMG_0042` -> 42.
pub fn filename_sequence(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_string_lossy();
    let bytes = stem.as_bytes();
    let end = bytes.iter().rposition(|b| b.is_ascii_digit())? + 1;
    let start = bytes[..end]
        .iter()
        .rposition(|b| !b.is_ascii_digit())
        .map_or(0, |pos| pos + 1);
    let digits = &stem[start..end];
    let digits = &digits[digits.len().saturating_sub(19)..];
    digits.parse().ok()
}

/// Normalises an EXIF sub-second string to nanoseconds.
pub fn subsecond_nanos(subsec: &str) -> Option<u32> {
    let digits = subsec.trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut padded: String = digits.chars().take(9).collect();
    while padded.len() < 9 {
        padded.push('0');
    }
    padded.parse().ok()
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub source_path: PathBuf,
    pub capture: CaptureMetadata,
    pub created: Option<SystemTime>,
}

#[derive(Debug, Clone)]
pub struct AssignedIdentity {
    pub identity: String,
    pub corrected: NaiveDateTime,
    pub device_tag: String,
    pub candidate: Candidate,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    corrected: NaiveDateTime,
    subsecond: Option<u32>,
    sequence: Option<u64>,
    file_name: String,
    created: Option<SystemTime>,
    path: PathBuf,
    device: String,
}

impl OrderKey {
    /// Everything but creation time; equal keys can only be ordered by the
    /// filesystem. Different devices never share a tie group.
    fn tie_key(&self) -> (NaiveDateTime, Option<u32>, Option<u64>, &str, &str) {
        (
            self.corrected,
            self.subsecond,
            self.sequence,
            &self.file_name,
            &self.device,
        )
    }
}

pub struct IdentityAssigner<'a> {
    collection: String,
    settings: SettingsSnapshot,
    strict: bool,
    previous: Option<&'a CollectionMetadata>,
}

impl<'a> IdentityAssigner<'a> {
    pub fn new(collection: &str, settings: SettingsSnapshot) -> Self {
        Self {
            collection: collection.to_lowercase(),
            settings,
            strict: false,
            previous: None,
        }
    }

    /// Refuse to order items that only filesystem creation time separates.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Keep identities from an earlier document for unchanged candidates.
    pub fn previous(mut self, previous: Option<&'a CollectionMetadata>) -> Self {
        self.previous = previous;
        self
    }

    fn prefix(&self, corrected: NaiveDateTime, tag: &str) -> String {
        format!(
            "{}-{}-{}",
            self.collection,
            corrected.format("%Y%m%dT%H%M%S"),
            tag
        )
    }

    /// Returns assignments sorted by identity, plus the candidates that
    /// could not be ordered.
    pub fn assign(&self, candidates: Vec<Candidate>) -> (Vec<AssignedIdentity>, Vec<ItemError>) {
        let mut keyed: Vec<(OrderKey, Candidate)> = candidates
            .into_iter()
            .map(|candidate| (self.order_key(&candidate), candidate))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        let mut errors = Vec::new();
        let ambiguous: Vec<bool> = {
            let mut sizes: HashMap<_, usize> = HashMap::new();
            for (key, _) in &keyed {
                *sizes.entry(key.tie_key()).or_default() += 1;
            }
            keyed
                .iter()
                .map(|(key, _)| sizes.get(&key.tie_key()).is_some_and(|size| *size > 1))
                .collect()
        };
        let mut ordered = Vec::with_capacity(keyed.len());
        for ((_, candidate), tied) in keyed.into_iter().zip(ambiguous) {
            if tied && self.strict {
                errors.push(ItemError::AmbiguousOrder {
                    path: candidate.source_path,
                });
                continue;
            }
            if tied {
                tracing::warn!(
                    path = %candidate.source_path.display(),
                    "ordering relies on filesystem creation time"
                );
            }
            ordered.push(candidate);
        }

        let previous: HashMap<&Path, &str> = self
            .previous
            .map(|doc| {
                doc.items
                    .iter()
                    .map(|item| (item.source_path.as_path(), item.identity.as_str()))
                    .collect()
            })
            .unwrap_or_default();

        let prepared: Vec<(String, NaiveDateTime, String, Option<String>)> = ordered
            .iter()
            .map(|candidate| {
                let corrected = self.settings.correct(candidate.capture.timestamp);
                let tag = device_tag(
                    candidate.capture.device.make.as_deref(),
                    candidate.capture.device.model.as_deref(),
                );
                let prefix = self.prefix(corrected, &tag);
                let pinned = previous
                    .get(candidate.source_path.as_path())
                    .filter(|identity| {
                        identity
                            .strip_prefix(prefix.as_str())
                            .and_then(|rest| rest.strip_prefix('-'))
                            .and_then(decode_counter)
                            .is_some()
                    })
                    .map(|identity| identity.to_string());
                (prefix, corrected, tag, pinned)
            })
            .collect();

        let reserved: HashSet<&str> = prepared
            .iter()
            .filter_map(|(_, _, _, pinned)| pinned.as_deref())
            .collect();
        let mut next_counter: HashMap<&str, u32> = HashMap::new();
        let mut taken: HashSet<String> = HashSet::new();
        let mut assigned = Vec::with_capacity(ordered.len());
        for (candidate, (prefix, corrected, tag, pinned)) in ordered.into_iter().zip(prepared.iter()) {
            let identity = match pinned {
                Some(identity) if !taken.contains(identity) => identity.clone(),
                _ => {
                    let counter = next_counter.entry(prefix.as_str()).or_insert(0);
                    loop {
                        let id = format!("{prefix}-{}", encode_counter(*counter));
                        *counter += 1;
                        if !reserved.contains(id.as_str()) && !taken.contains(&id) {
                            break id;
                        }
                    }
                }
            };
            taken.insert(identity.clone());
            assigned.push(AssignedIdentity {
                identity,
                corrected: *corrected,
                device_tag: tag.clone(),
                candidate,
            });
        }
        assigned.sort_by(|a, b| compare_identities(&a.identity, &b.identity));
        (assigned, errors)
    }

    fn order_key(&self, candidate: &Candidate) -> OrderKey {
        let file_name = candidate
            .source_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        OrderKey {
            corrected: self.settings.correct(candidate.capture.timestamp),
            subsecond: candidate
                .capture
                .subsecond
                .as_deref()
                .and_then(subsecond_nanos),
            sequence: candidate
                .capture
                .sequence_hint
                .or_else(|| filename_sequence(&candidate.source_path)),
            file_name,
            created: candidate.created,
            path: candidate.source_path.clone(),
            device: device_tag(
                candidate.capture.device.make.as_deref(),
                candidate.capture.device.model.as_deref(),
            ),
        }
    }
}

/// Identity order. Plain byte order already matches chronology because
/// every component is fixed width or lexically sortable.
pub fn compare_identities(a: &str, b: &str) -> Ordering {
    a.cmp(b)
}
