//! Configuration registration interface
//!
//! A `ConfigurationStore` holds the registered webhook configurations. The
//! snapshot store pulls `list()` from one of these periodically.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::types::WebhookConfiguration;
use crate::error::{Error, Result};

/// Where webhook configurations are registered
#[async_trait]
pub trait ConfigurationStore: Send + Sync {
    /// Register a configuration; fails if the name is taken
    async fn create(&self, config: WebhookConfiguration) -> Result<WebhookConfiguration>;

    /// Remove a configuration by name
    async fn delete(&self, name: &str) -> Result<()>;

    /// All registered configurations
    async fn list(&self) -> Result<Vec<WebhookConfiguration>>;
}

/// Process-local configuration store
#[derive(Default)]
pub struct InMemoryConfigurationStore {
    configs: RwLock<BTreeMap<String, WebhookConfiguration>>,
}

impl InMemoryConfigurationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigurationStore for InMemoryConfigurationStore {
    async fn create(&self, config: WebhookConfiguration) -> Result<WebhookConfiguration> {
        config.validate()?;
        let mut configs = self.configs.write().await;
        if configs.contains_key(&config.name) {
            return Err(Error::AlreadyExists(config.name));
        }
        info!("Registered webhook configuration {}", config.name);
        configs.insert(config.name.clone(), config.clone());
        Ok(config)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.configs.write().await.remove(name) {
            Some(_) => {
                info!("Removed webhook configuration {}", name);
                Ok(())
            }
            None => Err(Error::NotFound(format!("webhook configuration {name}"))),
        }
    }

    async fn list(&self) -> Result<Vec<WebhookConfiguration>> {
        Ok(self.configs.read().await.values().cloned().collect())
    }
}

/// Configurations kept as YAML or JSON manifests in a directory
pub struct FileConfigurationStore {
    dir: PathBuf,
}

impl FileConfigurationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn manifests(&self) -> Result<Vec<(PathBuf, Vec<WebhookConfiguration>)>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Manifest directory {} does not exist", self.dir.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if manifest_format(&path).is_some() && entry.file_type().await?.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut manifests = Vec::with_capacity(paths.len());
        for path in paths {
            let contents = tokio::fs::read_to_string(&path).await?;
            let configs = parse_manifest(&path, &contents)?;
            debug!(
                "Loaded {} configuration(s) from {}",
                configs.len(),
                path.display()
            );
            manifests.push((path, configs));
        }
        Ok(manifests)
    }
}

#[async_trait]
impl ConfigurationStore for FileConfigurationStore {
    async fn create(&self, config: WebhookConfiguration) -> Result<WebhookConfiguration> {
        config.validate()?;
        let manifests = self.manifests().await?;
        if manifests
            .iter()
            .flat_map(|(_, configs)| configs)
            .any(|c| c.name == config.name)
        {
            return Err(Error::AlreadyExists(config.name));
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("{}.yaml", file_stem(&config.name)));
        if tokio::fs::try_exists(&path).await? {
            return Err(Error::AlreadyExists(config.name));
        }
        tokio::fs::write(&path, serde_yaml::to_string(&config)?).await?;

        info!(
            "Registered webhook configuration {} at {}",
            config.name,
            path.display()
        );
        Ok(config)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        for (path, configs) in self.manifests().await? {
            if !configs.iter().any(|c| c.name == name) {
                continue;
            }

            let remaining: Vec<_> = configs.into_iter().filter(|c| c.name != name).collect();
            if remaining.is_empty() {
                tokio::fs::remove_file(&path).await?;
            } else {
                let mut docs = Vec::with_capacity(remaining.len());
                for config in &remaining {
                    docs.push(serde_yaml::to_string(config)?);
                }
                tokio::fs::write(&path, docs.join("---\n")).await?;
            }

            info!("Removed webhook configuration {} from {}", name, path.display());
            return Ok(());
        }
        Err(Error::NotFound(format!("webhook configuration {name}")))
    }

    async fn list(&self) -> Result<Vec<WebhookConfiguration>> {
        let mut by_name = BTreeMap::new();
        for (path, configs) in self.manifests().await? {
            for config in configs {
                if let Err(e) = config.validate() {
                    warn!("Skipping invalid configuration in {}: {}", path.display(), e);
                    continue;
                }
                if by_name.contains_key(&config.name) {
                    warn!(
                        "Skipping duplicate configuration {} in {}",
                        config.name,
                        path.display()
                    );
                    continue;
                }
                by_name.insert(config.name.clone(), config);
            }
        }
        Ok(by_name.into_values().collect())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ManifestFormat {
    Yaml,
    Json,
}

fn manifest_format(path: &Path) -> Option<ManifestFormat> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => Some(ManifestFormat::Yaml),
        Some("json") => Some(ManifestFormat::Json),
        _ => None,
    }
}

/// Parse every configuration document in a manifest file
pub fn parse_manifest(path: &Path, contents: &str) -> Result<Vec<WebhookConfiguration>> {
    match manifest_format(path) {
        Some(ManifestFormat::Json) => {
            let value: serde_json::Value = serde_json::from_str(contents)?;
            match value {
                serde_json::Value::Array(items) => items
                    .into_iter()
                    .map(|item| serde_json::from_value(item).map_err(Error::from))
                    .collect(),
                other => Ok(vec![serde_json::from_value(other)?]),
            }
        }
        Some(ManifestFormat::Yaml) => {
            let mut configs = Vec::new();
            for document in serde_yaml::Deserializer::from_str(contents) {
                let value = serde_yaml::Value::deserialize(document)?;
                if value.is_null() {
                    continue;
                }
                configs.push(serde_yaml::from_value(value)?);
            }
            Ok(configs)
        }
        None => Err(Error::ConfigError(format!(
            "{} is not a .yaml, .yml or .json manifest",
            path.display()
        ))),
    }
}

fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
