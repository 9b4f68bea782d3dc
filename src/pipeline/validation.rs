//! Pairing of the full-resolution and web-resolution source collections.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use walkdir::WalkDir;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub matched: usize,
    pub full_only: Vec<String>,
    pub web_only: Vec<String>,
}

impl ValidationReport {
    pub fn is_consistent(&self) -> bool {
        self.full_only.is_empty() && self.web_only.is_empty()
    }
}

/// JPEG files directly inside `dir`, sorted by file name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("failed to scan {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_jpeg = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
            .unwrap_or(false);
        if is_jpeg {
            images.push(entry.into_path());
        }
    }
    Ok(images)
}

pub fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Matches the two collections by file stem. Returns the report and the
/// web copy for every matched stem.
pub fn match_collections(
    full: &[PathBuf],
    web: &[PathBuf],
) -> (ValidationReport, BTreeMap<String, PathBuf>) {
    let full_by_stem: BTreeMap<String, &PathBuf> =
        full.iter().map(|path| (stem(path), path)).collect();
    let web_by_stem: BTreeMap<String, &PathBuf> =
        web.iter().map(|path| (stem(path), path)).collect();

    let mut report = ValidationReport::default();
    let mut pairs = BTreeMap::new();
    for (name, web_path) in &web_by_stem {
        if full_by_stem.contains_key(name) {
            report.matched += 1;
            pairs.insert(name.clone(), (*web_path).clone());
        } else {
            report.web_only.push(name.clone());
        }
    }
    report.full_only = full_by_stem
        .keys()
        .filter(|name| !web_by_stem.contains_key(*name))
        .cloned()
        .collect();
    (report, pairs)
}
