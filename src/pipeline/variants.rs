//! Local published variants under the output directory.
//!
//! `full` and `web` are symlinks to untouched source files; the metadata
//! rewrite only ever happens in memory at upload time. `thumb` holds the
//! embedded preview, or a downscaled copy when there is none.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::models::Variant;
use crate::transform::Thumbnailer;
use crate::util;

pub fn relative_path(variant: Variant, identity: &str) -> PathBuf {
    PathBuf::from(variant.as_str()).join(format!("{identity}.jpg"))
}

pub struct VariantWriter {
    output_dir: PathBuf,
    thumbnailer: Arc<dyn Thumbnailer>,
}

impl VariantWriter {
    pub fn new(output_dir: &Path, thumbnailer: Arc<dyn Thumbnailer>) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            thumbnailer,
        }
    }

    /// Drops variant files left by an earlier run so identities that no
    /// longer exist do not linger.
    pub fn reset(&self) -> Result<()> {
        for variant in Variant::ALL {
            let dir = self.output_dir.join(variant.as_str());
            if dir.exists() {
                fs::remove_dir_all(&dir)
                    .with_context(|| format!("failed to clear {}", dir.display()))?;
            }
        }
        self.prepare()
    }

    pub fn prepare(&self) -> Result<()> {
        for variant in Variant::ALL {
            util::ensure_dir(&self.output_dir.join(variant.as_str()))?;
        }
        Ok(())
    }

    pub fn publish(
        &self,
        identity: &str,
        full_source: &Path,
        web_source: &Path,
        bytes: &[u8],
    ) -> Result<BTreeMap<Variant, PathBuf>> {
        let mut paths = BTreeMap::new();

        let full = relative_path(Variant::Full, identity);
        link(full_source, &self.output_dir.join(&full))?;
        paths.insert(Variant::Full, full);

        let web = relative_path(Variant::Web, identity);
        link(web_source, &self.output_dir.join(&web))?;
        paths.insert(Variant::Web, web);

        let thumbnail = self
            .thumbnailer
            .thumbnail(bytes)
            .with_context(|| format!("no thumbnail for {}", full_source.display()))?;
        let thumb = relative_path(Variant::Thumb, identity);
        util::write_atomic(&self.output_dir.join(&thumb), &thumbnail)?;
        paths.insert(Variant::Thumb, thumb);
        Ok(paths)
    }
}

fn link(target: &Path, link_path: &Path) -> Result<()> {
    if let Some(parent) = link_path.parent() {
        util::ensure_dir(parent)?;
    }
    if fs::symlink_metadata(link_path).is_ok() {
        fs::remove_file(link_path)
            .with_context(|| format!("failed to replace {}", link_path.display()))?;
    }
    create_link(target, link_path).with_context(|| {
        format!(
            "failed to link {} -> {}",
            link_path.display(),
            target.display()
        )
    })
}

#[cfg(unix)]
fn create_link(target: &Path, link_path: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link_path)
}

#[cfg(not(unix))]
fn create_link(target: &Path, link_path: &Path) -> std::io::Result<()> {
    fs::copy(target, link_path).map(|_| ())
}
