//! TOML files under the data directory: engine tuning and classifier assets.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use topics_core::{ClassifierAssets, ConfigSource, TopicsConfig, TopicsError};

use crate::error::{Result, StoreError};

/// Config re-read from disk on every `load`, so edits apply to the next
/// operation without a restart. A missing file means all defaults.
#[derive(Clone, Debug)]
pub struct TomlConfigFile {
    path: PathBuf,
}

impl TomlConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<TopicsConfig> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(TopicsConfig::default()),
            Err(e) => Err(e.into()),
        }
    }
}

impl ConfigSource for TomlConfigFile {
    fn load(&self) -> topics_core::Result<TopicsConfig> {
        let config = self
            .read()
            .map_err(|e| TopicsError::Config(format!("{}: {e}", self.path.display())))?;
        config.validate()?;
        Ok(config)
    }
}

pub fn load_classifier_assets(path: &Path) -> Result<ClassifierAssets> {
    let content = fs::read_to_string(path)?;
    let assets: ClassifierAssets = toml::from_str(&content)?;
    if assets.labels.is_empty() {
        return Err(StoreError::InvalidData(format!(
            "{}: taxonomy has no labels",
            path.display()
        )));
    }
    tracing::debug!(
        labels = assets.labels.len(),
        apps = assets.apps.len(),
        "loaded classifier assets"
    );
    Ok(assets)
}
