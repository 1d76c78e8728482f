//! Kubernetes-backed configuration store
//!
//! Registers configurations as `admissionregistration.k8s.io/v1`
//! `ValidatingWebhookConfiguration` objects. A 404 on list means the API group
//! is not served, which the snapshot store treats as dynamic admission being off.

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1 as admissionregistration;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta,
};
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client};
use tracing::{info, warn};

use super::store::ConfigurationStore;
use super::types::{
    ClientEndpoint, FailurePolicy, MatchRule, NamespaceSelector, OperationType, Scope,
    SelectorOperator, SelectorRequirement, ServiceReference, WebhookConfiguration, WebhookRule,
    DEFAULT_TIMEOUT_SECONDS,
};
use crate::error::{Error, Result};

/// Configuration store over the Kubernetes API
pub struct KubeConfigurationStore {
    api: Api<admissionregistration::ValidatingWebhookConfiguration>,
}

impl KubeConfigurationStore {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

fn api_error_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

#[async_trait]
impl ConfigurationStore for KubeConfigurationStore {
    async fn create(&self, config: WebhookConfiguration) -> Result<WebhookConfiguration> {
        config.validate()?;
        let object = to_kube(&config);
        match self.api.create(&PostParams::default(), &object).await {
            Ok(created) => {
                info!("Created ValidatingWebhookConfiguration {}", config.name);
                from_kube(&created)
            }
            Err(e) if api_error_code(&e) == Some(409) => Err(Error::AlreadyExists(config.name)),
            Err(e) if api_error_code(&e) == Some(404) => Err(Error::FeatureDisabled(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!("Deleted ValidatingWebhookConfiguration {}", name);
                Ok(())
            }
            Err(e) if api_error_code(&e) == Some(404) => {
                Err(Error::NotFound(format!("webhook configuration {name}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<WebhookConfiguration>> {
        let list = match self.api.list(&ListParams::default()).await {
            Ok(list) => list,
            Err(e) if api_error_code(&e) == Some(404) => {
                return Err(Error::FeatureDisabled(e.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        from_kube_list(&list.items)
    }
}

/// Convert every listed object; one unreadable object fails the whole list
/// so the previous snapshot stays in force.
pub fn from_kube_list(
    objects: &[admissionregistration::ValidatingWebhookConfiguration],
) -> Result<Vec<WebhookConfiguration>> {
    objects
        .iter()
        .map(|object| {
            from_kube(object).map_err(|e| {
                let name = object.metadata.name.as_deref().unwrap_or("<unnamed>");
                warn!("Cannot read ValidatingWebhookConfiguration {}: {}", name, e);
                Error::ConfigError(format!("ValidatingWebhookConfiguration {name}: {e}"))
            })
        })
        .collect()
}

/// Convert to the Kubernetes object
pub fn to_kube(
    config: &WebhookConfiguration,
) -> admissionregistration::ValidatingWebhookConfiguration {
    admissionregistration::ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(config.name.clone()),
            ..Default::default()
        },
        webhooks: Some(config.webhooks.iter().map(webhook_to_kube).collect()),
    }
}

fn webhook_to_kube(hook: &WebhookRule) -> admissionregistration::ValidatingWebhook {
    let endpoint = &hook.client_config;
    admissionregistration::ValidatingWebhook {
        name: hook.name.clone(),
        admission_review_versions: vec!["v1".to_string()],
        side_effects: "None".to_string(),
        failure_policy: Some(hook.failure_policy.to_string()),
        timeout_seconds: Some(hook.timeout_seconds as i32),
        rules: Some(
            hook.rules
                .iter()
                .map(|rule| admissionregistration::RuleWithOperations {
                    operations: Some(rule.operations.iter().map(operation_name).collect()),
                    api_groups: Some(rule.api_groups.clone()),
                    api_versions: Some(rule.api_versions.clone()),
                    resources: Some(rule.resources.clone()),
                    scope: Some(scope_name(rule.scope).to_string()),
                })
                .collect(),
        ),
        namespace_selector: hook.namespace_selector.as_ref().map(|selector| LabelSelector {
            match_labels: (!selector.match_labels.is_empty())
                .then(|| selector.match_labels.clone()),
            match_expressions: (!selector.match_expressions.is_empty()).then(|| {
                selector
                    .match_expressions
                    .iter()
                    .map(|expr| LabelSelectorRequirement {
                        key: expr.key.clone(),
                        operator: format!("{:?}", expr.operator),
                        values: (!expr.values.is_empty()).then(|| expr.values.clone()),
                    })
                    .collect()
            }),
        }),
        client_config: admissionregistration::WebhookClientConfig {
            ca_bundle: (!endpoint.ca_bundle.is_empty())
                .then(|| ByteString(endpoint.ca_bundle.clone())),
            service: endpoint
                .service
                .as_ref()
                .map(|svc| admissionregistration::ServiceReference {
                    name: svc.name.clone(),
                    namespace: svc.namespace.clone(),
                    path: svc.path.clone(),
                    port: Some(svc.port as i32),
                }),
            url: endpoint.url.clone(),
        },
        ..Default::default()
    }
}

/// Convert from the Kubernetes object
pub fn from_kube(
    object: &admissionregistration::ValidatingWebhookConfiguration,
) -> Result<WebhookConfiguration> {
    let name = object
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::ConfigError("ValidatingWebhookConfiguration has no name".into()))?;

    let webhooks = object
        .webhooks
        .iter()
        .flatten()
        .map(webhook_from_kube)
        .collect::<Result<Vec<_>>>()?;

    Ok(WebhookConfiguration { name, webhooks })
}

fn webhook_from_kube(hook: &admissionregistration::ValidatingWebhook) -> Result<WebhookRule> {
    let rules = hook
        .rules
        .iter()
        .flatten()
        .map(|rule| {
            Ok(MatchRule {
                operations: rule
                    .operations
                    .iter()
                    .flatten()
                    .map(|op| parse_operation(op))
                    .collect::<Result<Vec<_>>>()?,
                api_groups: rule.api_groups.clone().unwrap_or_default(),
                api_versions: rule.api_versions.clone().unwrap_or_default(),
                resources: rule.resources.clone().unwrap_or_default(),
                scope: parse_scope(rule.scope.as_deref())?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let namespace_selector = hook
        .namespace_selector
        .as_ref()
        .map(|selector| -> Result<NamespaceSelector> {
            Ok(NamespaceSelector {
                match_labels: selector.match_labels.clone().unwrap_or_default(),
                match_expressions: selector
                    .match_expressions
                    .iter()
                    .flatten()
                    .map(|expr| {
                        Ok(SelectorRequirement {
                            key: expr.key.clone(),
                            operator: parse_selector_operator(&expr.operator)?,
                            values: expr.values.clone().unwrap_or_default(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
            })
        })
        .transpose()?;

    let client = &hook.client_config;
    let client_config = ClientEndpoint {
        service: client.service.as_ref().map(|svc| ServiceReference {
            namespace: svc.namespace.clone(),
            name: svc.name.clone(),
            path: svc.path.clone(),
            port: svc.port.and_then(|p| u16::try_from(p).ok()).unwrap_or(443),
        }),
        url: client.url.clone(),
        ca_bundle: client
            .ca_bundle
            .as_ref()
            .map(|b| b.0.clone())
            .unwrap_or_default(),
    };

    let failure_policy = match hook.failure_policy.as_deref() {
        None | Some("Fail") => FailurePolicy::Fail,
        Some("Ignore") => FailurePolicy::Ignore,
        Some(other) => {
            return Err(Error::ConfigError(format!(
                "unknown failure policy {other} on webhook {}",
                hook.name
            )))
        }
    };

    Ok(WebhookRule {
        name: hook.name.clone(),
        rules,
        namespace_selector,
        client_config,
        failure_policy,
        timeout_seconds: hook
            .timeout_seconds
            .and_then(|t| u32::try_from(t).ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS),
    })
}

fn operation_name(op: &OperationType) -> String {
    match op {
        OperationType::All => "*",
        OperationType::Create => "CREATE",
        OperationType::Update => "UPDATE",
        OperationType::Delete => "DELETE",
        OperationType::Connect => "CONNECT",
    }
    .to_string()
}

fn parse_operation(op: &str) -> Result<OperationType> {
    match op {
        "*" => Ok(OperationType::All),
        "CREATE" => Ok(OperationType::Create),
        "UPDATE" => Ok(OperationType::Update),
        "DELETE" => Ok(OperationType::Delete),
        "CONNECT" => Ok(OperationType::Connect),
        other => Err(Error::ConfigError(format!("unknown operation {other}"))),
    }
}

fn scope_name(scope: Scope) -> &'static str {
    match scope {
        Scope::Cluster => "Cluster",
        Scope::Namespaced => "Namespaced",
        Scope::All => "*",
    }
}

fn parse_scope(scope: Option<&str>) -> Result<Scope> {
    match scope {
        None | Some("*") => Ok(Scope::All),
        Some("Cluster") => Ok(Scope::Cluster),
        Some("Namespaced") => Ok(Scope::Namespaced),
        Some(other) => Err(Error::ConfigError(format!("unknown scope {other}"))),
    }
}

fn parse_selector_operator(op: &str) -> Result<SelectorOperator> {
    match op {
        "In" => Ok(SelectorOperator::In),
        "NotIn" => Ok(SelectorOperator::NotIn),
        "Exists" => Ok(SelectorOperator::Exists),
        "DoesNotExist" => Ok(SelectorOperator::DoesNotExist),
        other => Err(Error::ConfigError(format!(
            "unknown selector operator {other}"
        ))),
    }
}
