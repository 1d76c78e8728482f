//! Dispatcher settings
//!
//! Settings come from an optional TOML file; command-line flags and their
//! environment variables override file values.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::webhook::pipeline::DispatchMode;
use crate::webhook::snapshot::DEFAULT_REFRESH_INTERVAL;

/// Where webhook configurations are registered
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// `ValidatingWebhookConfiguration` objects in the cluster
    #[default]
    Kubernetes,
    /// YAML/JSON manifests in a directory
    Directory,
    /// Process memory, registered through the HTTP interface
    Memory,
}

impl FromStr for SourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "kubernetes" | "k8s" => Ok(SourceKind::Kubernetes),
            "directory" | "dir" => Ok(SourceKind::Directory),
            "memory" => Ok(SourceKind::Memory),
            other => Err(Error::ConfigError(format!(
                "unknown configuration source {other}, expected kubernetes, directory or memory"
            ))),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Kubernetes => write!(f, "kubernetes"),
            SourceKind::Directory => write!(f, "directory"),
            SourceKind::Memory => write!(f, "memory"),
        }
    }
}

/// Dispatcher settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherConfig {
    pub listen_addr: SocketAddr,

    /// PEM serving certificate chain
    pub tls_cert: Option<PathBuf>,
    /// PEM private key for `tls_cert`
    pub tls_key: Option<PathBuf>,
    /// Serve with an ephemeral self-signed certificate
    pub self_signed: bool,
    /// Subject alternative names for the self-signed certificate
    pub subject_alt_names: Vec<String>,

    pub source: SourceKind,
    pub manifest_dir: Option<PathBuf>,
    pub refresh_interval_ms: u64,

    pub dispatch_mode: DispatchMode,

    /// Namespace labels for the directory and memory sources, keyed by namespace
    pub namespaces: BTreeMap<String, BTreeMap<String, String>>,

    pub log_json: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8443)),
            tls_cert: None,
            tls_key: None,
            self_signed: false,
            subject_alt_names: vec!["localhost".to_string()],
            source: SourceKind::default(),
            manifest_dir: None,
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL.as_millis() as u64,
            dispatch_mode: DispatchMode::default(),
            namespaces: BTreeMap::new(),
            log_json: false,
        }
    }
}

/// How the HTTP surface is secured
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TlsMode {
    Files { cert: PathBuf, key: PathBuf },
    SelfSigned(Vec<String>),
    Insecure,
}

impl DispatcherConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Read a settings file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::ConfigError(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Read a settings file if one is given, otherwise use defaults
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path).await,
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval_ms == 0 {
            return Err(Error::ConfigError(
                "refresh_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.source == SourceKind::Directory && self.manifest_dir.is_none() {
            return Err(Error::ConfigError(
                "the directory source needs manifest_dir".to_string(),
            ));
        }
        match (&self.tls_cert, &self.tls_key) {
            (Some(_), None) | (None, Some(_)) => Err(Error::ConfigError(
                "tls_cert and tls_key must be set together".to_string(),
            )),
            (Some(_), Some(_)) if self.self_signed => Err(Error::ConfigError(
                "self_signed cannot be combined with tls_cert/tls_key".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn tls_mode(&self) -> TlsMode {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => TlsMode::Files {
                cert: cert.clone(),
                key: key.clone(),
            },
            _ if self.self_signed => TlsMode::SelfSigned(self.subject_alt_names.clone()),
            _ => TlsMode::Insecure,
        }
    }
}

/// Values given on the command line; each one that is set wins over the file
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub listen_addr: Option<SocketAddr>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub self_signed: bool,
    pub source: Option<SourceKind>,
    pub manifest_dir: Option<PathBuf>,
    pub refresh_interval_ms: Option<u64>,
    pub dispatch_mode: Option<DispatchMode>,
    pub log_json: bool,
}

impl Overrides {
    pub fn apply(self, mut config: DispatcherConfig) -> DispatcherConfig {
        if let Some(addr) = self.listen_addr {
            config.listen_addr = addr;
        }
        if let Some(cert) = self.tls_cert {
            config.tls_cert = Some(cert);
        }
        if let Some(key) = self.tls_key {
            config.tls_key = Some(key);
        }
        if let Some(source) = self.source {
            config.source = source;
        }
        if let Some(dir) = self.manifest_dir {
            config.manifest_dir = Some(dir);
            if self.source.is_none() {
                config.source = SourceKind::Directory;
            }
        }
        if let Some(ms) = self.refresh_interval_ms {
            config.refresh_interval_ms = ms;
        }
        if let Some(mode) = self.dispatch_mode {
            config.dispatch_mode = mode;
        }
        config.self_signed |= self.self_signed;
        config.log_json |= self.log_json;
        config
    }
}
