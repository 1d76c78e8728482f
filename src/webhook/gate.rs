//! Admission gate
//!
//! Writes to an `ObjectStore` only after the pipeline admits them. Updates and
//! merge patches are retried on optimistic-concurrency conflicts, with a fresh
//! read and a fresh admission decision on every attempt.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::pipeline::AdmissionPipeline;
use super::registry::ResourceTypeRegistry;
use super::types::{AdmissionRequest, GroupVersionResource, Operation};
use crate::error::{Error, Result};

/// Default number of attempts for a conflicting update
pub const DEFAULT_MAX_CONFLICT_RETRIES: usize = 5;

/// Identity of a stored object
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub resource: GroupVersionResource,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(resource: GroupVersionResource, namespace: Option<&str>, name: &str) -> Self {
        Self {
            resource,
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn for_request(request: &AdmissionRequest) -> Self {
        Self {
            resource: request.resource.clone(),
            namespace: request.namespace.clone(),
            name: request.name.clone(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.resource, ns, self.name),
            None => write!(f, "{} {}", self.resource, self.name),
        }
    }
}

/// An object as persisted, with its concurrency token
#[derive(Clone, Debug, PartialEq)]
pub struct StoredObject {
    pub object: Value,
    pub resource_version: u64,
}

/// Persistence collaborator guarded by the gate
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<StoredObject>>;

    /// Persist a new object; `AlreadyExists` if the key is taken
    async fn create(&self, key: &ObjectKey, object: Value) -> Result<StoredObject>;

    /// Replace an object; `Conflict` if `resource_version` is stale
    async fn update(&self, key: &ObjectKey, object: Value, resource_version: u64)
        -> Result<StoredObject>;
}

/// Apply a JSON merge patch (RFC 7386)
pub fn apply_merge_patch(target: &Value, patch: &Value) -> Value {
    match patch {
        Value::Object(fields) => {
            let mut merged = match target {
                Value::Object(existing) => existing.clone(),
                _ => Map::new(),
            };
            for (key, value) in fields {
                if value.is_null() {
                    merged.remove(key);
                } else {
                    let current = merged.get(key).unwrap_or(&Value::Null);
                    let next = apply_merge_patch(current, value);
                    merged.insert(key.clone(), next);
                }
            }
            Value::Object(merged)
        }
        other => other.clone(),
    }
}

/// Gates object writes on an admission decision
pub struct AdmissionGate {
    pipeline: Arc<AdmissionPipeline>,
    registry: Arc<ResourceTypeRegistry>,
    objects: Arc<dyn ObjectStore>,
    max_attempts: usize,
}

impl AdmissionGate {
    pub fn new(
        pipeline: Arc<AdmissionPipeline>,
        registry: Arc<ResourceTypeRegistry>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            pipeline,
            registry,
            objects,
            max_attempts: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    async fn admit(&self, request: AdmissionRequest) -> Result<()> {
        let warnings = self.pipeline.admit(request).await.into_result()?;
        for warning in warnings {
            warn!("Admission warning: {}", warning);
        }
        Ok(())
    }

    /// Create `object` if admitted
    pub async fn create(&self, object: Value) -> Result<StoredObject> {
        let request = self.registry.request_for(Operation::Create, object.clone())?;
        let key = ObjectKey::for_request(&request);

        self.admit(request).await?;
        let stored = self.objects.create(&key, object).await?;
        info!("Created {}", key);
        Ok(stored)
    }

    /// Replace the stored object with `object` if admitted
    pub async fn replace(&self, object: Value) -> Result<StoredObject> {
        let request = self.registry.request_for(Operation::Update, object.clone())?;
        let key = ObjectKey::for_request(&request);
        self.update_with(&key, |_| Ok(object.clone())).await
    }

    /// Merge-patch the stored object if the result is admitted
    pub async fn merge_patch(
        &self,
        resource: &GroupVersionResource,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<StoredObject> {
        let key = ObjectKey::new(resource.clone(), namespace, name);
        self.update_with(&key, |current| Ok(apply_merge_patch(current, patch)))
            .await
    }

    /// Read, mutate, admit and write, retrying on conflict
    pub async fn update_with<F>(&self, key: &ObjectKey, mutate: F) -> Result<StoredObject>
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let current = self
                .objects
                .get(key)
                .await?
                .ok_or_else(|| Error::NotFound(key.to_string()))?;
            let desired = mutate(&current.object)?;

            let request = self
                .registry
                .request_for(Operation::Update, desired.clone())?
                .with_old_object(current.object.clone());
            if ObjectKey::for_request(&request) != *key {
                return Err(Error::ConfigError(format!(
                    "update of {key} changes the object's identity"
                )));
            }

            self.admit(request).await?;

            match self
                .objects
                .update(key, desired, current.resource_version)
                .await
            {
                Ok(stored) => {
                    info!("Updated {}", key);
                    return Ok(stored);
                }
                Err(e) if e.is_conflict() && attempt < self.max_attempts => {
                    debug!(
                        "Conflict updating {} (attempt {}/{}), retrying",
                        key, attempt, self.max_attempts
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}
