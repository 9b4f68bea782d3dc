use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;

use crate::metadata::MetadataSourceKind;
use crate::models::{SettingsSnapshot, TimezoneContext, PRESERVE_TIMEZONE_SENTINEL};

pub const CONFIG_FILENAME: &str = "galleria.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub collection: CollectionConfig,
    pub settings: SettingsConfig,
    pub deploy: DeployConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub name: String,
    pub full_source: Option<PathBuf>,
    pub web_source: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub batch_size: usize,
    pub workers: usize,
    pub metadata_source: MetadataSourceKind,
    pub strict_ordering: bool,
    pub skip_validation: bool,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            name: "gallery".to_string(),
            full_source: None,
            web_source: None,
            output_dir: PathBuf::from("prod/pics"),
            batch_size: 50,
            workers: 4,
            metadata_source: MetadataSourceKind::Exif,
            strict_ordering: false,
            skip_validation: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    pub timestamp_offset_hours: i32,
    pub target_timezone_offset_hours: i32,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            timestamp_offset_hours: 0,
            target_timezone_offset_hours: PRESERVE_TIMEZONE_SENTINEL,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub store_root: Option<PathBuf>,
    pub prefix: String,
    pub upload_retries: u32,
    pub retry_backoff_ms: u64,
    pub workers: usize,
    pub verify: bool,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            store_root: None,
            prefix: "photos".to_string(),
            upload_retries: 3,
            retry_backoff_ms: 250,
            workers: 8,
            verify: true,
        }
    }
}

impl Config {
    /// Loads the first config file found: `explicit`, `./galleria.toml`,
    /// then the per-user config directory. Missing files mean defaults.
    /// Environment overrides are applied on top.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match locate(explicit) {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading config");
                Self::from_file(&path)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("GALLERIA_TIMESTAMP_OFFSET_HOURS") {
            self.settings.timestamp_offset_hours = value
                .trim()
                .parse()
                .with_context(|| format!("invalid GALLERIA_TIMESTAMP_OFFSET_HOURS: {value}"))?;
        }
        if let Some(value) = lookup("GALLERIA_TARGET_TIMEZONE_OFFSET_HOURS") {
            self.settings.target_timezone_offset_hours =
                value.trim().parse().with_context(|| {
                    format!("invalid GALLERIA_TARGET_TIMEZONE_OFFSET_HOURS: {value}")
                })?;
        }
        if let Some(value) = lookup("GALLERIA_COLLECTION") {
            self.collection.name = value;
        }
        if let Some(value) = lookup("GALLERIA_STORE_ROOT") {
            self.deploy.store_root = Some(PathBuf::from(value));
        }
        Ok(())
    }

    /// The explicit settings value every transformation and hash is
    /// computed with.
    pub fn snapshot(&self) -> Result<SettingsSnapshot> {
        let timezone = TimezoneContext::from_hours(self.settings.target_timezone_offset_hours)
            .map_err(anyhow::Error::msg)?;
        Ok(SettingsSnapshot {
            timestamp_offset_hours: self.settings.timestamp_offset_hours,
            timezone,
        })
    }
}

fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = PathBuf::from(CONFIG_FILENAME);
    if local.exists() {
        return Some(local);
    }
    ProjectDirs::from("", "", "galleria")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILENAME))
        .filter(|path| path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_sections() {
        let config: Config = toml::from_str(
            r#"
            [collection]
            name = "wedding"
            full_source = "pics/full"

            [settings]
            timestamp_offset_hours = -4
            "#,
        )
        .unwrap();
        assert_eq!(config.collection.name, "wedding");
        assert_eq!(config.collection.batch_size, 50);
        assert_eq!(config.collection.output_dir, PathBuf::from("prod/pics"));
        assert_eq!(config.deploy.prefix, "photos");

        let snapshot = config.snapshot().unwrap();
        assert_eq!(snapshot.timestamp_offset_hours, -4);
        assert_eq!(snapshot.timezone, TimezoneContext::PreserveOriginal);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = Config::default();
        config
            .apply_env(|key| match key {
                "GALLERIA_TARGET_TIMEZONE_OFFSET_HOURS" => Some("-5".to_string()),
                "GALLERIA_COLLECTION" => Some("party".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.collection.name, "party");
        assert_eq!(config.snapshot().unwrap().timezone, TimezoneContext::Offset(-5));

        assert!(config
            .apply_env(|key| (key == "GALLERIA_TIMESTAMP_OFFSET_HOURS").then(|| "soon".to_string()))
            .is_err());
    }

    #[test]
    fn out_of_range_timezone_is_rejected() {
        let mut config = Config::default();
        config.settings.target_timezone_offset_hours = 20;
        assert!(config.snapshot().is_err());
    }

    #[test]
    fn metadata_source_is_selected_by_name() {
        let config: Config = toml::from_str(
            r#"
            [collection]
            metadata_source = "filename"
            "#,
        )
        .unwrap();
        assert_eq!(config.collection.metadata_source, MetadataSourceKind::Filename);
    }
}
