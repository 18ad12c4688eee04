//! Device settings file: TOML configuration for the daemon binary, with the
//! storage/scanner sections this service's configuration surface needs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::Deserialize;
use tokio::fs;

use mediasync_core::scanner::MediaScannerConfig;
use mediasync_core::storage::StorageOptions;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DeviceSettingsFile {
    /// Host may be absent, in which case scanner operations are SKIPPED.
    pub media_scanner: Option<MediaScannerSection>,
    #[serde(default)]
    pub storages: HashMap<String, StorageSection>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MediaScannerSection {
    pub host: String,
    #[serde(default = "default_scanner_port")]
    pub port: u16,
}

fn default_scanner_port() -> u16 {
    8080
}

impl From<MediaScannerSection> for MediaScannerConfig {
    fn from(section: MediaScannerSection) -> Self {
        MediaScannerConfig {
            host: section.host,
            port: section.port,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSection {
    /// Local directory backing this storage's reference handler.
    pub path: PathBuf,
    #[serde(default)]
    pub watch_folder: bool,
    pub watch_folder_target_id: Option<String>,
    pub media_path: Option<String>,
}

impl StorageSection {
    pub fn options(&self) -> StorageOptions {
        StorageOptions {
            media_path: self.media_path.clone(),
        }
    }
}

impl DeviceSettingsFile {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .wrap_err_with(|| format!("failed to read config file: {}", path.display()))?;
        let settings: DeviceSettingsFile = toml::from_str(&content).wrap_err("failed to parse config file")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Every `watch_folder_target_id` must resolve to another configured
    /// storage id — the generator's `init()` fails hard on a dangling
    /// target, so it is better caught here at load time.
    fn validate(&self) -> Result<()> {
        for (id, storage) in &self.storages {
            if !storage.watch_folder {
                continue;
            }
            let Some(target_id) = &storage.watch_folder_target_id else {
                eyre::bail!("storage '{id}' has watch_folder = true but no watch_folder_target_id");
            };
            if !self.storages.contains_key(target_id) {
                eyre::bail!("storage '{id}' targets unknown storage '{target_id}'");
            }
            if target_id == id {
                eyre::bail!("storage '{id}' cannot target itself");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dangling_target_fails_validation() {
        let mut storages = HashMap::new();
        storages.insert(
            "src".to_string(),
            StorageSection {
                path: PathBuf::from("/tmp/src"),
                watch_folder: true,
                watch_folder_target_id: Some("missing".to_string()),
                media_path: None,
            },
        );
        let settings = DeviceSettingsFile {
            media_scanner: None,
            storages,
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn self_target_fails_validation() {
        let mut storages = HashMap::new();
        storages.insert(
            "src".to_string(),
            StorageSection {
                path: PathBuf::from("/tmp/src"),
                watch_folder: true,
                watch_folder_target_id: Some("src".to_string()),
                media_path: None,
            },
        );
        let settings = DeviceSettingsFile {
            media_scanner: None,
            storages,
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn well_formed_config_validates() {
        let mut storages = HashMap::new();
        storages.insert(
            "src".to_string(),
            StorageSection {
                path: PathBuf::from("/tmp/src"),
                watch_folder: true,
                watch_folder_target_id: Some("dest".to_string()),
                media_path: None,
            },
        );
        storages.insert(
            "dest".to_string(),
            StorageSection {
                path: PathBuf::from("/tmp/dest"),
                watch_folder: false,
                watch_folder_target_id: None,
                media_path: Some("library".to_string()),
            },
        );
        let settings = DeviceSettingsFile {
            media_scanner: Some(MediaScannerSection {
                host: "localhost".to_string(),
                port: 9000,
            }),
            storages,
        };
        assert!(settings.validate().is_ok());
    }
}
