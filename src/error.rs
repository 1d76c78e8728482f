//! Error types for the admission dispatcher

use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML manifest error
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Dispatcher settings file error
    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Filesystem error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Dispatcher configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A webhook configuration failed validation on registration
    #[error("Invalid webhook configuration {name}: {}", .errors.join("; "))]
    InvalidConfiguration { name: String, errors: Vec<String> },

    /// A webhook configuration with this name is already registered
    #[error("Webhook configuration {0} already exists")]
    AlreadyExists(String),

    /// No such webhook configuration or object
    #[error("{0} not found")]
    NotFound(String),

    /// Optimistic concurrency conflict reported by the object store
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The configuration API is not served, so dynamic admission is off
    #[error("Dynamic admission configuration is not available: {0}")]
    FeatureDisabled(String),

    /// Waiting for a condition exceeded its deadline
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// TLS material could not be loaded or built
    #[error("TLS error: {0}")]
    TlsError(String),

    /// A webhook rejected the request
    #[error("{0}")]
    Denied(String),

    /// A fail-closed webhook could not be consulted
    #[error("Internal error occurred: {0}")]
    AdmissionInternal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether retrying the same write with a fresh read may succeed
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Whether this error is an admission rejection of either class
    pub fn is_admission_denial(&self) -> bool {
        matches!(self, Error::Denied(_) | Error::AdmissionInternal(_))
    }
}
