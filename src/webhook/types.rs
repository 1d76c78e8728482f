//! Webhook Configuration and Admission Types
//!
//! This module defines the registered webhook configurations, the admission
//! request the engine evaluates, and the `admission.k8s.io/v1` review envelope
//! exchanged with webhooks.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// API version of the review envelope sent to webhooks
pub const ADMISSION_REVIEW_API_VERSION: &str = "admission.k8s.io/v1";

/// Kind of the review envelope sent to webhooks
pub const ADMISSION_REVIEW_KIND: &str = "AdmissionReview";

/// Wildcard accepted in every match dimension
pub const WILDCARD: &str = "*";

/// Default per-webhook call timeout
pub const DEFAULT_TIMEOUT_SECONDS: u32 = 10;

/// Upper bound on a per-webhook call timeout
pub const MAX_TIMEOUT_SECONDS: u32 = 30;

/// Operation being admitted
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Create => write!(f, "CREATE"),
            Operation::Update => write!(f, "UPDATE"),
            Operation::Delete => write!(f, "DELETE"),
            Operation::Connect => write!(f, "CONNECT"),
        }
    }
}

/// One entry of a match rule's operation set
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum OperationType {
    #[serde(rename = "*")]
    All,
    #[serde(rename = "CREATE")]
    Create,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "CONNECT")]
    Connect,
}

impl OperationType {
    /// Check if this entry covers the given operation
    pub fn matches(self, operation: Operation) -> bool {
        match self {
            OperationType::All => true,
            OperationType::Create => operation == Operation::Create,
            OperationType::Update => operation == Operation::Update,
            OperationType::Delete => operation == Operation::Delete,
            OperationType::Connect => operation == Operation::Connect,
        }
    }
}

impl From<Operation> for OperationType {
    fn from(operation: Operation) -> Self {
        match operation {
            Operation::Create => OperationType::Create,
            Operation::Update => OperationType::Update,
            Operation::Delete => OperationType::Delete,
            Operation::Connect => OperationType::Connect,
        }
    }
}

/// Resource scope a match rule is restricted to
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum Scope {
    Cluster,
    Namespaced,
    #[default]
    #[serde(rename = "*")]
    All,
}

/// Operations on resources a webhook rule cares about
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MatchRule {
    /// Operations covered (`*` for all)
    pub operations: Vec<OperationType>,

    /// API groups; the core group is the empty string
    #[serde(default)]
    pub api_groups: Vec<String>,

    /// API versions
    #[serde(default)]
    pub api_versions: Vec<String>,

    /// Resources, optionally with a `/subresource` suffix
    #[serde(default)]
    pub resources: Vec<String>,

    #[serde(default)]
    pub scope: Scope,
}

impl MatchRule {
    pub fn new(
        operations: Vec<OperationType>,
        api_groups: &[&str],
        api_versions: &[&str],
        resources: &[&str],
    ) -> Self {
        Self {
            operations,
            api_groups: api_groups.iter().map(|s| s.to_string()).collect(),
            api_versions: api_versions.iter().map(|s| s.to_string()).collect(),
            resources: resources.iter().map(|s| s.to_string()).collect(),
            scope: Scope::All,
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }
}

/// Selector requirement operator
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A single label requirement
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl SelectorRequirement {
    pub fn new(key: impl Into<String>, operator: SelectorOperator, values: &[&str]) -> Self {
        Self {
            key: key.into(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// Label predicate restricting which namespaces a webhook rule applies to
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<SelectorRequirement>,
}

impl NamespaceSelector {
    pub fn from_expressions(match_expressions: Vec<SelectorRequirement>) -> Self {
        Self {
            match_labels: BTreeMap::new(),
            match_expressions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }
}

/// How an unreachable webhook affects the decision
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Treat the failure as if the webhook had not matched
    Ignore,
    /// Reject the request with an internal error
    #[default]
    Fail,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::Ignore => write!(f, "Ignore"),
            FailurePolicy::Fail => write!(f, "Fail"),
        }
    }
}

/// Reference to the service fronting a webhook
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReference {
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default = "default_service_port")]
    pub port: u16,
}

fn default_service_port() -> u16 {
    443
}

impl ServiceReference {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, path: &str) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            path: Some(path.to_string()),
            port: default_service_port(),
        }
    }
}

/// Where and how to reach a webhook
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientEndpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceReference>,

    /// Explicit `https://` location, used instead of a service reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// PEM bundle trusted for the webhook's serving certificate
    #[serde(default, with = "base64_serde", skip_serializing_if = "Vec::is_empty")]
    pub ca_bundle: Vec<u8>,
}

impl ClientEndpoint {
    pub fn service(reference: ServiceReference, ca_bundle: Vec<u8>) -> Self {
        Self {
            service: Some(reference),
            url: None,
            ca_bundle,
        }
    }

    pub fn url(url: impl Into<String>, ca_bundle: Vec<u8>) -> Self {
        Self {
            service: None,
            url: Some(url.into()),
            ca_bundle,
        }
    }
}

/// A single webhook: what it matches, where it lives, and how failures resolve
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRule {
    /// Name, unique within its configuration
    pub name: String,

    /// Match rules; the webhook applies when any of them matches
    pub rules: Vec<MatchRule>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<NamespaceSelector>,

    pub client_config: ClientEndpoint,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u32,
}

fn default_timeout_seconds() -> u32 {
    DEFAULT_TIMEOUT_SECONDS
}

impl WebhookRule {
    pub fn new(name: impl Into<String>, rules: Vec<MatchRule>, client_config: ClientEndpoint) -> Self {
        Self {
            name: name.into(),
            rules,
            namespace_selector: None,
            client_config,
            failure_policy: FailurePolicy::default(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }

    pub fn with_namespace_selector(mut self, selector: NamespaceSelector) -> Self {
        self.namespace_selector = Some(selector);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u32) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Call timeout, clamped to the accepted range
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.clamp(1, MAX_TIMEOUT_SECONDS) as u64)
    }
}

/// A named, registered set of webhook rules
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfiguration {
    pub name: String,

    #[serde(default)]
    pub webhooks: Vec<WebhookRule>,
}

impl WebhookConfiguration {
    pub fn new(name: impl Into<String>, webhooks: Vec<WebhookRule>) -> Self {
        Self {
            name: name.into(),
            webhooks,
        }
    }

    /// Validate a configuration before it is registered
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name: must not be empty".to_string());
        }
        if self.webhooks.is_empty() {
            errors.push("webhooks: at least one webhook is required".to_string());
        }

        let mut seen = BTreeSet::new();
        for (i, hook) in self.webhooks.iter().enumerate() {
            let field = format!("webhooks[{i}]");
            if hook.name.trim().is_empty() {
                errors.push(format!("{field}.name: must not be empty"));
            } else if !seen.insert(hook.name.as_str()) {
                errors.push(format!("{field}.name: duplicate webhook name {}", hook.name));
            }

            if hook.rules.is_empty() {
                errors.push(format!("{field}.rules: at least one rule is required"));
            }
            for (j, rule) in hook.rules.iter().enumerate() {
                let rule_field = format!("{field}.rules[{j}]");
                if rule.operations.is_empty() {
                    errors.push(format!("{rule_field}.operations: must not be empty"));
                }
                if rule.api_groups.is_empty() {
                    errors.push(format!("{rule_field}.apiGroups: must not be empty"));
                }
                if rule.api_versions.is_empty() {
                    errors.push(format!("{rule_field}.apiVersions: must not be empty"));
                }
                if rule.resources.is_empty() {
                    errors.push(format!("{rule_field}.resources: must not be empty"));
                }
            }

            if let Some(selector) = &hook.namespace_selector {
                for (j, expr) in selector.match_expressions.iter().enumerate() {
                    let expr_field = format!("{field}.namespaceSelector.matchExpressions[{j}]");
                    match expr.operator {
                        SelectorOperator::In | SelectorOperator::NotIn
                            if expr.values.is_empty() =>
                        {
                            errors.push(format!(
                                "{expr_field}.values: must be non-empty for {:?}",
                                expr.operator
                            ));
                        }
                        SelectorOperator::Exists | SelectorOperator::DoesNotExist
                            if !expr.values.is_empty() =>
                        {
                            errors.push(format!(
                                "{expr_field}.values: must be empty for {:?}",
                                expr.operator
                            ));
                        }
                        _ => {}
                    }
                }
            }

            let endpoint = &hook.client_config;
            match (&endpoint.service, &endpoint.url) {
                (None, None) => errors.push(format!(
                    "{field}.clientConfig: exactly one of service or url is required"
                )),
                (Some(_), Some(_)) => errors.push(format!(
                    "{field}.clientConfig: service and url are mutually exclusive"
                )),
                (Some(service), None) => {
                    if service.name.is_empty() || service.namespace.is_empty() {
                        errors.push(format!(
                            "{field}.clientConfig.service: name and namespace are required"
                        ));
                    }
                }
                (None, Some(url)) => {
                    if !url.starts_with("https://") {
                        errors.push(format!("{field}.clientConfig.url: must use https"));
                    }
                }
            }

            if hook.timeout_seconds == 0 || hook.timeout_seconds > MAX_TIMEOUT_SECONDS {
                errors.push(format!(
                    "{field}.timeoutSeconds: must be between 1 and {MAX_TIMEOUT_SECONDS}"
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidConfiguration {
                name: self.name.clone(),
                errors,
            })
        }
    }
}

/// Fully-qualified resource being requested
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct GroupVersionResource {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GroupVersionResource {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
        }
    }
}

impl std::fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// Fully-qualified type of the submitted object
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }
}

/// A write request awaiting an admission decision
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    /// Identifier echoed back by every webhook response
    #[serde(default)]
    pub uid: String,

    #[serde(default)]
    pub kind: GroupVersionKind,

    pub resource: GroupVersionResource,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_resource: Option<String>,

    #[serde(default)]
    pub name: String,

    /// Target namespace; absent for cluster-scoped resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    pub operation: Operation,

    #[serde(default)]
    pub object: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_object: Option<serde_json::Value>,

    #[serde(default)]
    pub dry_run: bool,

    /// Current labels of the target namespace; never sent to webhooks
    #[serde(default, skip_serializing)]
    pub namespace_labels: BTreeMap<String, String>,
}

impl AdmissionRequest {
    pub fn new(operation: Operation, resource: GroupVersionResource, object: serde_json::Value) -> Self {
        let name = object
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        Self {
            uid: new_uid(),
            kind: GroupVersionKind::default(),
            resource,
            sub_resource: None,
            name,
            namespace: None,
            operation,
            object,
            old_object: None,
            dry_run: false,
            namespace_labels: BTreeMap::new(),
        }
    }

    pub fn in_namespace(
        mut self,
        namespace: impl Into<String>,
        labels: BTreeMap<String, String>,
    ) -> Self {
        self.namespace = Some(namespace.into());
        self.namespace_labels = labels;
        self
    }

    pub fn with_kind(mut self, kind: GroupVersionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_old_object(mut self, old_object: serde_json::Value) -> Self {
        self.old_object = Some(old_object);
        self
    }

    pub fn with_sub_resource(mut self, sub_resource: impl Into<String>) -> Self {
        self.sub_resource = Some(sub_resource.into());
        self
    }

    /// Assign a uid if the caller did not provide one
    pub fn ensure_uid(&mut self) {
        if self.uid.is_empty() {
            self.uid = new_uid();
        }
    }
}

/// Generate a request uid unique within this process
pub fn new_uid() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    format!(
        "{:08x}-{:04x}-4{:03x}-8{:03x}-{:012x}",
        (nanos >> 32) as u32,
        (nanos >> 16) as u16,
        (nanos & 0x0fff) as u16,
        (seq >> 48) as u16 & 0x0fff,
        seq & 0xffff_ffff_ffff
    )
}

/// Status detail attached to a webhook response
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A webhook's verdict on one admission request
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    #[serde(default)]
    pub uid: String,

    pub allowed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResponseStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl AdmissionResponse {
    /// Create an allowed response
    pub fn allowed(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            allowed: true,
            status: None,
            warnings: Vec::new(),
        }
    }

    /// Create a denied response
    pub fn denied(uid: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            allowed: false,
            status: Some(ResponseStatus {
                code: Some(403),
                message: Some(message.into()),
                reason: Some("Forbidden".to_string()),
            }),
            warnings: Vec::new(),
        }
    }

    /// Human-readable reason, present on denials
    pub fn message(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.message.as_deref())
            .filter(|m| !m.is_empty())
    }
}

/// The `admission.k8s.io/v1` envelope exchanged with webhooks
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    #[serde(default = "default_review_api_version")]
    pub api_version: String,

    #[serde(default = "default_review_kind")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

fn default_review_api_version() -> String {
    ADMISSION_REVIEW_API_VERSION.to_string()
}

fn default_review_kind() -> String {
    ADMISSION_REVIEW_KIND.to_string()
}

impl AdmissionReview {
    pub fn for_request(request: AdmissionRequest) -> Self {
        Self {
            api_version: default_review_api_version(),
            kind: default_review_kind(),
            request: Some(request),
            response: None,
        }
    }

    pub fn for_response(response: AdmissionResponse) -> Self {
        Self {
            api_version: default_review_api_version(),
            kind: default_review_kind(),
            request: None,
            response: Some(response),
        }
    }
}

// Base64 serde helper for CA bundles
mod base64_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD.decode(s.trim()).map_err(serde::de::Error::custom)
    }
}
