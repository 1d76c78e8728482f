//! Namespace label sources

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, Client};
use tracing::debug;

use crate::error::{Error, Result};

/// Looks up the current labels of a namespace
#[async_trait]
pub trait NamespaceLabels: Send + Sync {
    async fn labels(&self, namespace: &str) -> Result<BTreeMap<String, String>>;
}

/// Fixed namespace labels held in memory
#[derive(Default)]
pub struct StaticNamespaceLabels {
    namespaces: RwLock<HashMap<String, BTreeMap<String, String>>>,
}

impl StaticNamespaceLabels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a namespace -> labels table
    pub fn from_table(table: BTreeMap<String, BTreeMap<String, String>>) -> Self {
        Self {
            namespaces: RwLock::new(table.into_iter().collect()),
        }
    }

    /// Set (or replace) the labels of a namespace
    pub fn set_labels(&self, namespace: &str, labels: BTreeMap<String, String>) {
        let mut namespaces = self.namespaces.write().unwrap_or_else(|e| e.into_inner());
        namespaces.insert(namespace.to_string(), labels);
    }

    pub fn remove(&self, namespace: &str) {
        let mut namespaces = self.namespaces.write().unwrap_or_else(|e| e.into_inner());
        namespaces.remove(namespace);
    }
}

#[async_trait]
impl NamespaceLabels for StaticNamespaceLabels {
    async fn labels(&self, namespace: &str) -> Result<BTreeMap<String, String>> {
        let namespaces = self.namespaces.read().unwrap_or_else(|e| e.into_inner());
        namespaces
            .get(namespace)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("namespace {namespace}")))
    }
}

/// Reads namespace labels from the Kubernetes API
pub struct KubeNamespaceLabels {
    api: Api<Namespace>,
}

impl KubeNamespaceLabels {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl NamespaceLabels for KubeNamespaceLabels {
    async fn labels(&self, namespace: &str) -> Result<BTreeMap<String, String>> {
        match self.api.get_opt(namespace).await? {
            Some(ns) => {
                let labels = ns.metadata.labels.unwrap_or_default();
                debug!("Namespace {} has {} label(s)", namespace, labels.len());
                Ok(labels)
            }
            None => Err(Error::NotFound(format!("namespace {namespace}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_labels() {
        let source = StaticNamespaceLabels::new();
        source.set_labels(
            "exempted",
            BTreeMap::from([("skip-webhook-admission".to_string(), "yes".to_string())]),
        );

        let labels = source.labels("exempted").await.unwrap();
        assert_eq!(labels["skip-webhook-admission"], "yes");

        source.remove("exempted");
        assert!(matches!(
            source.labels("exempted").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_labels_from_table() {
        let source = StaticNamespaceLabels::from_table(BTreeMap::from([
            (
                "fail-closed-namespace".to_string(),
                BTreeMap::from([("fail-closed-webhook".to_string(), "yes".to_string())]),
            ),
            ("webhook-ns".to_string(), BTreeMap::new()),
        ]));

        assert_eq!(
            source.labels("fail-closed-namespace").await.unwrap()["fail-closed-webhook"],
            "yes"
        );
        assert!(source.labels("webhook-ns").await.unwrap().is_empty());
        assert!(matches!(
            source.labels("exempted").await,
            Err(Error::NotFound(_))
        ));
    }
}
