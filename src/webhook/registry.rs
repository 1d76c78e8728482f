//! Resource type registry
//!
//! Maps an object's `apiVersion`/`kind` to the resource identity webhook rules
//! match against. Built-in and custom resource types are handled identically.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::types::{
    AdmissionRequest, GroupVersionKind, GroupVersionResource, Operation,
};
use crate::error::{Error, Result};

/// Whether objects of a type live in a namespace
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum ResourceScope {
    Namespaced,
    Cluster,
}

/// A resource type the dispatcher can admit
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceType {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub scope: ResourceScope,
}

impl ResourceType {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str, scope: ResourceScope) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            scope,
        }
    }

    pub fn resource(&self) -> GroupVersionResource {
        GroupVersionResource::new(&self.group, &self.version, &self.plural)
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::new(&self.group, &self.version, &self.kind)
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    fn same_resource(&self, other: &ResourceType) -> bool {
        self.group == other.group && self.version == other.version && self.plural == other.plural
    }
}

/// Split an `apiVersion` into group and version; the core group is empty
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

fn builtin_types() -> Vec<ResourceType> {
    use ResourceScope::{Cluster, Namespaced};
    vec![
        ResourceType::new("", "v1", "Pod", "pods", Namespaced),
        ResourceType::new("", "v1", "ConfigMap", "configmaps", Namespaced),
        ResourceType::new("", "v1", "Secret", "secrets", Namespaced),
        ResourceType::new("", "v1", "Service", "services", Namespaced),
        ResourceType::new("", "v1", "ServiceAccount", "serviceaccounts", Namespaced),
        ResourceType::new("", "v1", "Namespace", "namespaces", Cluster),
        ResourceType::new("", "v1", "Node", "nodes", Cluster),
        ResourceType::new("apps", "v1", "Deployment", "deployments", Namespaced),
        ResourceType::new("apps", "v1", "StatefulSet", "statefulsets", Namespaced),
        ResourceType::new("apps", "v1", "DaemonSet", "daemonsets", Namespaced),
        ResourceType::new("batch", "v1", "Job", "jobs", Namespaced),
        ResourceType::new(
            "apiextensions.k8s.io",
            "v1",
            "CustomResourceDefinition",
            "customresourcedefinitions",
            Cluster,
        ),
        ResourceType::new(
            "admissionregistration.k8s.io",
            "v1",
            "ValidatingWebhookConfiguration",
            "validatingwebhookconfigurations",
            Cluster,
        ),
    ]
}

/// Known resource types
pub struct ResourceTypeRegistry {
    types: RwLock<Vec<ResourceType>>,
}

impl Default for ResourceTypeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ResourceTypeRegistry {
    /// Registry with no types
    pub fn empty() -> Self {
        Self {
            types: RwLock::new(Vec::new()),
        }
    }

    /// Registry preloaded with the core built-in types
    pub fn with_builtins() -> Self {
        Self {
            types: RwLock::new(builtin_types()),
        }
    }

    /// Register a resource type. Re-registering an identical type is a no-op.
    pub fn register(&self, resource_type: ResourceType) -> Result<()> {
        if resource_type.version.is_empty()
            || resource_type.kind.is_empty()
            || resource_type.plural.is_empty()
        {
            return Err(Error::ConfigError(format!(
                "resource type {:?} needs a version, kind and plural",
                resource_type
            )));
        }

        let mut types = self.types.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = types.iter().find(|t| t.same_resource(&resource_type)) {
            if *existing == resource_type {
                return Ok(());
            }
            return Err(Error::AlreadyExists(format!(
                "resource {}",
                resource_type.resource()
            )));
        }

        info!(
            "Registered resource type {} ({})",
            resource_type.resource(),
            resource_type.kind
        );
        types.push(resource_type);
        Ok(())
    }

    /// Remove a resource type by group, version and plural
    pub fn unregister(&self, resource: &GroupVersionResource) -> Result<()> {
        let mut types = self.types.write().unwrap_or_else(|e| e.into_inner());
        let before = types.len();
        types.retain(|t| t.resource() != *resource);
        if types.len() == before {
            return Err(Error::NotFound(format!("resource {resource}")));
        }
        Ok(())
    }

    pub fn resolve_kind(&self, api_version: &str, kind: &str) -> Option<ResourceType> {
        let (group, version) = split_api_version(api_version);
        let types = self.types.read().unwrap_or_else(|e| e.into_inner());
        types
            .iter()
            .find(|t| t.group == group && t.version == version && t.kind == kind)
            .cloned()
    }

    pub fn resolve_resource(&self, resource: &GroupVersionResource) -> Option<ResourceType> {
        let types = self.types.read().unwrap_or_else(|e| e.into_inner());
        types.iter().find(|t| t.resource() == *resource).cloned()
    }

    /// Build the admission request for writing `object`.
    ///
    /// The object's `apiVersion`/`kind` select the resource type, and
    /// `metadata.namespace` is required for namespaced types.
    pub fn request_for(
        &self,
        operation: Operation,
        object: serde_json::Value,
    ) -> Result<AdmissionRequest> {
        let api_version = object
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::ConfigError("object has no apiVersion".into()))?;
        let kind = object
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::ConfigError("object has no kind".into()))?
            .to_string();

        let resource_type = self
            .resolve_kind(api_version, &kind)
            .ok_or_else(|| Error::NotFound(format!("resource type {api_version}, Kind={kind}")))?;

        let namespace = object
            .pointer("/metadata/namespace")
            .and_then(|v| v.as_str())
            .filter(|ns| !ns.is_empty())
            .map(str::to_string);

        let mut request = AdmissionRequest::new(operation, resource_type.resource(), object)
            .with_kind(resource_type.gvk());
        match (resource_type.scope, namespace) {
            (ResourceScope::Namespaced, Some(ns)) => request.namespace = Some(ns),
            (ResourceScope::Namespaced, None) => {
                return Err(Error::ConfigError(format!(
                    "{kind} {} must specify a namespace",
                    request.name
                )))
            }
            (ResourceScope::Cluster, _) => request.namespace = None,
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn e2e_crd() -> ResourceType {
        ResourceType::new(
            "webhook-crd-test.k8s.io",
            "v1",
            "E2e-test-webhook-crd",
            "e2e-test-webhook-crds",
            ResourceScope::Namespaced,
        )
    }

    #[test]
    fn test_builtins_resolve() {
        let registry = ResourceTypeRegistry::with_builtins();
        let pods = registry.resolve_kind("v1", "Pod").unwrap();
        assert_eq!(pods.resource(), GroupVersionResource::new("", "v1", "pods"));

        let deployments = registry.resolve_kind("apps/v1", "Deployment").unwrap();
        assert_eq!(deployments.group, "apps");
        assert!(registry.resolve_kind("v1", "Unknown").is_none());
    }

    #[test]
    fn test_register_custom_type() {
        let registry = ResourceTypeRegistry::with_builtins();
        registry.register(e2e_crd()).unwrap();
        registry.register(e2e_crd()).unwrap();

        let resolved = registry
            .resolve_kind("webhook-crd-test.k8s.io/v1", "E2e-test-webhook-crd")
            .unwrap();
        assert_eq!(resolved.plural, "e2e-test-webhook-crds");

        let mut conflicting = e2e_crd();
        conflicting.kind = "Other".to_string();
        assert!(matches!(
            registry.register(conflicting),
            Err(Error::AlreadyExists(_))
        ));

        registry.unregister(&e2e_crd().resource()).unwrap();
        assert!(registry.resolve_resource(&e2e_crd().resource()).is_none());
    }

    #[test]
    fn test_request_for_namespaced_object() {
        let registry = ResourceTypeRegistry::with_builtins();
        let request = registry
            .request_for(
                Operation::Create,
                json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": { "name": "cm", "namespace": "webhook-ns" },
                    "data": { "webhook-e2e-test": "webhook-disallow" }
                }),
            )
            .unwrap();
        assert_eq!(request.resource.resource, "configmaps");
        assert_eq!(request.kind.kind, "ConfigMap");
        assert_eq!(request.namespace.as_deref(), Some("webhook-ns"));
        assert_eq!(request.name, "cm");
    }

    #[test]
    fn test_request_for_requires_namespace() {
        let registry = ResourceTypeRegistry::with_builtins();
        let result = registry.request_for(
            Operation::Create,
            json!({ "apiVersion": "v1", "kind": "Pod", "metadata": { "name": "p" } }),
        );
        match result {
            Err(Error::ConfigError(message)) => {
                assert_eq!(message, "Pod p must specify a namespace")
            }
            other => panic!("expected a missing namespace error, got {other:?}"),
        }
    }

    #[test]
    fn test_request_for_cluster_scoped_object_drops_namespace() {
        let registry = ResourceTypeRegistry::with_builtins();
        let request = registry
            .request_for(
                Operation::Create,
                json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": "ns", "namespace": "x" } }),
            )
            .unwrap();
        assert!(request.namespace.is_none());
    }

    #[test]
    fn test_split_api_version() {
        assert_eq!(split_api_version("v1"), ("", "v1"));
        assert_eq!(split_api_version("apps/v1"), ("apps", "v1"));
    }
}
