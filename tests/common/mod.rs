#![allow(dead_code)]

#[path = "../../src/exif/testing.rs"]
mod jpeg;

use std::fs;
use std::path::{Path, PathBuf};

use galleria::models::SettingsSnapshot;
use galleria::pipeline::{BatchProcessor, ProcessOptions, ProcessReport};

pub use jpeg::JpegBuilder;

/// Writes `count` camera originals named `IMG_0000.jpg`.. where every two
/// consecutive files share a capture second.
pub fn write_collection(dir: &Path, count: usize) -> Vec<PathBuf> {
    (0..count).map(|i| write_image(dir, i)).collect()
}

/// Writes `IMG_{i:04}.jpg`, captured at 12:00:00 plus `i / 2` minutes.
pub fn write_image(dir: &Path, i: usize) -> PathBuf {
    let bytes = JpegBuilder::new()
        .make("Canon")
        .model("Canon EOS R5")
        .datetime_original(&format!("2024:08:10 12:{:02}:00", i / 2))
        .thumbnail(vec![0xFF, 0xD8, i as u8, 0xFF, 0xD9])
        .scan_data(&[i as u8, 0xAB, 0xCD])
        .build();
    let path = dir.join(format!("IMG_{i:04}.jpg"));
    fs::write(&path, bytes).unwrap();
    path
}

pub fn options(source: &Path, output: &Path, settings: SettingsSnapshot) -> ProcessOptions {
    let mut options = ProcessOptions::new("Wedding", source, output, settings);
    options.batch_size = 2;
    options.workers = 3;
    options
}

pub fn process(options: ProcessOptions) -> ProcessReport {
    BatchProcessor::new(options).run().unwrap()
}
