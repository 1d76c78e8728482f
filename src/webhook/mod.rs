//! Webhook Module
//!
//! Dynamic admission control: externally registered webhooks are matched
//! against each write request, invoked over HTTPS, and their verdicts
//! combined into one admit/deny decision.
//!
//! # Components
//!
//! - **Rules and selectors**: pure predicates deciding which webhooks apply
//! - **Invoker**: one HTTPS call per applicable webhook, bounded by its timeout
//! - **Aggregator**: per-webhook outcomes reduced to a single decision
//! - **Snapshots**: the registered configurations, refreshed from a store
//! - **Pipeline**: the per-request state machine tying these together
//! - **Gate**: admission in front of an object store's writes
//!
//! # Example
//!
//! ```rust,ignore
//! use admission_dispatch::webhook::{
//!     AdmissionPipeline, HttpsWebhookCaller, InMemoryConfigurationStore, SnapshotStore,
//! };
//!
//! let snapshots = Arc::new(SnapshotStore::new(Arc::new(InMemoryConfigurationStore::new())));
//! snapshots.store().create(configuration).await?;
//! snapshots.refresh().await?;
//!
//! let pipeline = AdmissionPipeline::new(snapshots, Arc::new(HttpsWebhookCaller::new()));
//! pipeline.admit(request).await.into_result()?;
//! ```

pub mod aggregate;
pub mod gate;
pub mod invoker;
pub mod kube_store;
pub mod namespaces;
pub mod pipeline;
pub mod registry;
pub mod rules;
pub mod selector;
#[cfg(feature = "server")]
pub mod server;
pub mod snapshot;
pub mod store;
pub mod types;

pub use aggregate::{Decision, DenyKind, Outcome, WebhookOutcome};
pub use gate::{apply_merge_patch, AdmissionGate, ObjectKey, ObjectStore, StoredObject};
pub use invoker::{
    ClusterServiceResolver, HttpsWebhookCaller, InvocationError, InvocationResult,
    ServiceResolver, StaticServiceResolver, WebhookCaller,
};
pub use kube_store::KubeConfigurationStore;
pub use namespaces::{KubeNamespaceLabels, NamespaceLabels, StaticNamespaceLabels};
pub use pipeline::{AdmissionPipeline, DispatchMode, Evaluation};
pub use registry::{ResourceScope, ResourceType, ResourceTypeRegistry};
#[cfg(feature = "server")]
pub use server::AdmissionServer;
pub use snapshot::{ConfigurationSnapshot, SnapshotStore};
pub use store::{ConfigurationStore, FileConfigurationStore, InMemoryConfigurationStore};
pub use types::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, ClientEndpoint, FailurePolicy,
    GroupVersionKind, GroupVersionResource, MatchRule, NamespaceSelector, Operation,
    OperationType, Scope, SelectorOperator, SelectorRequirement, ServiceReference,
    WebhookConfiguration, WebhookRule,
};
