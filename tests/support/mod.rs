//! Shared harness for the admission integration tests: a sample webhook
//! served over TLS, an in-memory object store, and a dispatcher wired to both.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use admission_dispatch::tls::ServingCertificate;
use admission_dispatch::webhook::{
    AdmissionGate, AdmissionPipeline, AdmissionResponse, AdmissionReview,
    DispatchMode, HttpsWebhookCaller, InMemoryConfigurationStore, ObjectKey, ObjectStore,
    ResourceScope, ResourceType, ResourceTypeRegistry, SnapshotStore, StaticNamespaceLabels,
    StaticServiceResolver, StoredObject, WebhookConfiguration,
};
use admission_dispatch::{Error, Result};
use async_trait::async_trait;
use axum::{routing::post, Json, Router};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

pub const WEBHOOK_NAMESPACE: &str = "webhook-ns";
pub const SERVICE_NAME: &str = "e2e-test-webhook";
pub const SKIPPED_NAMESPACE: &str = "exempted-namespace";
pub const FAIL_CLOSED_NAMESPACE: &str = "fail-closed-namespace";

pub const SKIP_LABEL_KEY: &str = "skip-webhook-admission";
pub const FAIL_CLOSED_LABEL_KEY: &str = "fail-closed-webhook";

pub const CRD_GROUP: &str = "webhook-crd-test.k8s.io";
pub const CRD_VERSION: &str = "v1";
pub const CRD_KIND: &str = "E2e-test-webhook-crd";
pub const CRD_PLURAL: &str = "e2e-test-webhook-crds";

const DISALLOWED: &str = "webhook-disallow";

fn review_response(review: AdmissionReview, deny: Vec<&str>) -> Json<AdmissionReview> {
    let uid = review
        .request
        .map(|request| request.uid)
        .unwrap_or_default();
    let response = if deny.is_empty() {
        AdmissionResponse::allowed(uid)
    } else {
        AdmissionResponse::denied(uid, deny.join("; "))
    };
    Json(AdmissionReview::for_response(response))
}

fn object_of(review: &AdmissionReview) -> Value {
    review
        .request
        .as_ref()
        .map(|request| request.object.clone())
        .unwrap_or(Value::Null)
}

async fn admit_pod(Json(review): Json<AdmissionReview>) -> Json<AdmissionReview> {
    let pod = object_of(&review);
    let mut reasons = Vec::new();

    let disallowed_container = pod
        .pointer("/spec/containers")
        .and_then(Value::as_array)
        .is_some_and(|containers| {
            containers
                .iter()
                .any(|c| c.get("name") == Some(&json!(DISALLOWED)))
        });
    if disallowed_container {
        reasons.push("the pod contains unwanted container name");
    }
    if pod.pointer("/metadata/labels/webhook-e2e-test") == Some(&json!(DISALLOWED)) {
        reasons.push("the pod contains unwanted label");
    }

    review_response(review, reasons)
}

async fn admit_configmap(Json(review): Json<AdmissionReview>) -> Json<AdmissionReview> {
    let configmap = object_of(&review);
    let mut reasons = Vec::new();
    if configmap.pointer("/data/webhook-e2e-test") == Some(&json!(DISALLOWED)) {
        reasons.push("the configmap contains unwanted key and value");
    }
    review_response(review, reasons)
}

async fn admit_custom_resource(Json(review): Json<AdmissionReview>) -> Json<AdmissionReview> {
    let resource = object_of(&review);
    let mut reasons = Vec::new();
    if resource.pointer("/data/webhook-e2e-test") == Some(&json!(DISALLOWED)) {
        reasons.push("the custom resource contains unwanted data");
    }
    review_response(review, reasons)
}

/// The sample policy webhook, served over TLS on a loopback port
pub struct SampleWebhook {
    pub addr: SocketAddr,
    pub ca_bundle: Vec<u8>,
    handle: axum_server::Handle,
    task: JoinHandle<()>,
}

impl SampleWebhook {
    pub async fn start() -> Self {
        let certificate =
            ServingCertificate::self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                .unwrap();
        let rustls_config = certificate.rustls_config().unwrap();

        let app = Router::new()
            .route("/pods", post(admit_pod))
            .route("/configmaps", post(admit_configmap))
            .route("/crd", post(admit_custom_resource));

        let handle = axum_server::Handle::new();
        let server_handle = handle.clone();
        let task = tokio::spawn(async move {
            axum_server::bind_rustls(SocketAddr::from(([127, 0, 0, 1], 0)), rustls_config)
                .handle(server_handle)
                .serve(app.into_make_service())
                .await
                .unwrap();
        });

        let addr = handle
            .listening()
            .await
            .expect("sample webhook failed to bind");

        Self {
            addr,
            ca_bundle: certificate.cert_pem,
            handle,
            task,
        }
    }

    pub fn base_url(&self) -> String {
        format!("https://127.0.0.1:{}", self.addr.port())
    }
}

impl Drop for SampleWebhook {
    fn drop(&mut self) {
        self.handle.shutdown();
        self.task.abort();
    }
}

/// Object store double with optimistic concurrency
#[derive(Default)]
pub struct MemoryObjects {
    objects: Mutex<HashMap<ObjectKey, StoredObject>>,
    pub writes: AtomicUsize,
}

impl MemoryObjects {
    pub fn stored(&self, key: &ObjectKey) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjects {
    async fn get(&self, key: &ObjectKey) -> Result<Option<StoredObject>> {
        Ok(self.stored(key))
    }

    async fn create(&self, key: &ObjectKey, object: Value) -> Result<StoredObject> {
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(key) {
            return Err(Error::AlreadyExists(key.to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let stored = StoredObject {
            object,
            resource_version: 1,
        };
        objects.insert(key.clone(), stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        key: &ObjectKey,
        object: Value,
        resource_version: u64,
    ) -> Result<StoredObject> {
        let mut objects = self.objects.lock().unwrap();
        let current = objects
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        if current.resource_version != resource_version {
            return Err(Error::Conflict(key.to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        current.object = object;
        current.resource_version += 1;
        Ok(current.clone())
    }
}

/// A dispatcher wired to the sample webhook and an in-memory object store
pub struct Harness {
    pub webhook: SampleWebhook,
    pub snapshots: Arc<SnapshotStore>,
    pub namespaces: Arc<StaticNamespaceLabels>,
    pub registry: Arc<ResourceTypeRegistry>,
    pub objects: Arc<MemoryObjects>,
    pub gate: AdmissionGate,
    refresher: JoinHandle<()>,
}

impl Harness {
    pub async fn start(mode: DispatchMode) -> Self {
        let webhook = SampleWebhook::start().await;

        let resolver =
            StaticServiceResolver::new().with_service(WEBHOOK_NAMESPACE, SERVICE_NAME, webhook.base_url());
        let caller = Arc::new(HttpsWebhookCaller::with_resolver(Arc::new(resolver)));

        let snapshots = Arc::new(SnapshotStore::new(Arc::new(
            InMemoryConfigurationStore::new(),
        )));
        snapshots.refresh().await.unwrap();
        let refresher = Arc::clone(&snapshots).spawn_refresh(Duration::from_millis(50));

        let namespaces = Arc::new(StaticNamespaceLabels::new());
        for ns in [WEBHOOK_NAMESPACE, SKIPPED_NAMESPACE, FAIL_CLOSED_NAMESPACE] {
            namespaces.set_labels(ns, BTreeMap::new());
        }

        let pipeline = Arc::new(
            AdmissionPipeline::new(Arc::clone(&snapshots), caller)
                .with_mode(mode)
                .with_namespace_labels(namespaces.clone()),
        );

        let registry = Arc::new(ResourceTypeRegistry::with_builtins());
        registry
            .register(ResourceType::new(
                CRD_GROUP,
                CRD_VERSION,
                CRD_KIND,
                CRD_PLURAL,
                ResourceScope::Namespaced,
            ))
            .unwrap();

        let objects = Arc::new(MemoryObjects::default());
        let gate = AdmissionGate::new(pipeline, registry.clone(), objects.clone());

        Self {
            webhook,
            snapshots,
            namespaces,
            registry,
            objects,
            gate,
            refresher,
        }
    }

    pub fn label_namespace(&self, namespace: &str, key: &str, value: &str) {
        self.namespaces
            .set_labels(namespace, BTreeMap::from([(key.to_string(), value.to_string())]));
    }

    /// Register a configuration and wait for the background refresh to publish it
    pub async fn register(&self, configuration: WebhookConfiguration) {
        let name = configuration.name.clone();
        self.snapshots
            .store()
            .create(configuration)
            .await
            .unwrap();
        self.snapshots
            .wait_until(|s| s.contains(&name), Duration::from_secs(5))
            .await
            .unwrap();
    }

    pub async fn unregister(&self, name: &str) {
        self.snapshots.store().delete(name).await.unwrap();
        self.snapshots
            .wait_until(|s| !s.contains(name), Duration::from_secs(5))
            .await
            .unwrap();
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.refresher.abort();
    }
}
