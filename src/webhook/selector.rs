//! Namespace selector evaluation

use std::collections::BTreeMap;

use super::types::{AdmissionRequest, NamespaceSelector, SelectorOperator, WebhookRule};

impl NamespaceSelector {
    /// Check if the selector matches the given labels. All requirements are ANDed.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let labels_match = self
            .match_labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value));

        labels_match
            && self.match_expressions.iter().all(|expr| {
                let value = labels.get(&expr.key);
                match expr.operator {
                    SelectorOperator::In => value.is_some_and(|v| expr.values.contains(v)),
                    SelectorOperator::NotIn => value.map_or(true, |v| !expr.values.contains(v)),
                    SelectorOperator::Exists => value.is_some(),
                    SelectorOperator::DoesNotExist => value.is_none(),
                }
            })
    }
}

/// Evaluate an optional selector; an absent selector includes every namespace
pub fn selector_matches(
    selector: Option<&NamespaceSelector>,
    labels: &BTreeMap<String, String>,
) -> bool {
    selector.map_or(true, |s| s.matches(labels))
}

impl WebhookRule {
    /// Whether the request's namespace is in scope for this webhook.
    ///
    /// Cluster-scoped requests are always in scope, except a Namespace object
    /// itself, which is judged by its own labels.
    pub fn selects_namespace(&self, request: &AdmissionRequest) -> bool {
        let Some(selector) = self.namespace_selector.as_ref() else {
            return true;
        };

        if request.namespace.as_deref().is_some_and(|ns| !ns.is_empty()) {
            return selector.matches(&request.namespace_labels);
        }

        if is_namespace_object(request) {
            return selector.matches(&object_labels(&request.object));
        }

        true
    }
}

fn is_namespace_object(request: &AdmissionRequest) -> bool {
    request.resource.group.is_empty()
        && request.resource.resource == "namespaces"
        && request.sub_resource.is_none()
}

fn object_labels(object: &serde_json::Value) -> BTreeMap<String, String> {
    object
        .pointer("/metadata/labels")
        .and_then(|labels| labels.as_object())
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::types::{
        ClientEndpoint, GroupVersionResource, MatchRule, Operation, OperationType,
        SelectorRequirement, ServiceReference,
    };
    use serde_json::json;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn skip_selector() -> NamespaceSelector {
        NamespaceSelector::from_expressions(vec![SelectorRequirement::new(
            "skip-webhook-admission",
            SelectorOperator::NotIn,
            &["yes"],
        )])
    }

    #[test]
    fn test_absent_selector_matches_everything() {
        assert!(selector_matches(None, &BTreeMap::new()));
        assert!(selector_matches(None, &labels(&[("a", "b")])));
        assert!(NamespaceSelector::default().matches(&labels(&[("a", "b")])));
    }

    #[test]
    fn test_not_in_is_satisfied_by_absent_key() {
        let selector = skip_selector();
        assert!(selector.matches(&BTreeMap::new()));
        assert!(selector.matches(&labels(&[("skip-webhook-admission", "no")])));
        assert!(!selector.matches(&labels(&[("skip-webhook-admission", "yes")])));
    }

    #[test]
    fn test_in_requires_present_key() {
        let selector = NamespaceSelector::from_expressions(vec![SelectorRequirement::new(
            "fail-closed-webhook",
            SelectorOperator::In,
            &["yes"],
        )]);
        assert!(!selector.matches(&BTreeMap::new()));
        assert!(selector.matches(&labels(&[("fail-closed-webhook", "yes")])));
        assert!(!selector.matches(&labels(&[("fail-closed-webhook", "no")])));
    }

    #[test]
    fn test_exists_and_does_not_exist() {
        let exists = NamespaceSelector::from_expressions(vec![SelectorRequirement::new(
            "team",
            SelectorOperator::Exists,
            &[],
        )]);
        let absent = NamespaceSelector::from_expressions(vec![SelectorRequirement::new(
            "team",
            SelectorOperator::DoesNotExist,
            &[],
        )]);
        let tagged = labels(&[("team", "payments")]);

        assert!(exists.matches(&tagged) && !exists.matches(&BTreeMap::new()));
        assert!(!absent.matches(&tagged) && absent.matches(&BTreeMap::new()));
    }

    #[test]
    fn test_match_labels_and_expressions_are_anded() {
        let mut selector = skip_selector();
        selector
            .match_labels
            .insert("env".to_string(), "test".to_string());

        assert!(selector.matches(&labels(&[("env", "test")])));
        assert!(!selector.matches(&labels(&[("env", "prod")])));
        assert!(!selector.matches(&labels(&[
            ("env", "test"),
            ("skip-webhook-admission", "yes")
        ])));
    }

    fn hook_with_selector(selector: NamespaceSelector) -> WebhookRule {
        WebhookRule::new(
            "hook",
            vec![MatchRule::new(vec![OperationType::All], &["*"], &["*"], &["*"])],
            ClientEndpoint::service(ServiceReference::new("ns", "svc", "/"), Vec::new()),
        )
        .with_namespace_selector(selector)
    }

    #[test]
    fn test_cluster_scoped_requests_are_in_scope() {
        let hook = hook_with_selector(NamespaceSelector::from_expressions(vec![
            SelectorRequirement::new("fail-closed-webhook", SelectorOperator::In, &["yes"]),
        ]));
        let node = AdmissionRequest::new(
            Operation::Create,
            GroupVersionResource::new("", "v1", "nodes"),
            json!({}),
        );
        assert!(hook.selects_namespace(&node));
    }

    #[test]
    fn test_namespace_object_uses_its_own_labels() {
        let hook = hook_with_selector(skip_selector());
        let exempt = AdmissionRequest::new(
            Operation::Create,
            GroupVersionResource::new("", "v1", "namespaces"),
            json!({ "metadata": { "name": "exempt", "labels": { "skip-webhook-admission": "yes" } } }),
        );
        let plain = AdmissionRequest::new(
            Operation::Create,
            GroupVersionResource::new("", "v1", "namespaces"),
            json!({ "metadata": { "name": "plain" } }),
        );
        assert!(!hook.selects_namespace(&exempt));
        assert!(hook.selects_namespace(&plain));
    }

    #[test]
    fn test_namespaced_request_uses_namespace_labels() {
        let hook = hook_with_selector(skip_selector());
        let request = AdmissionRequest::new(
            Operation::Create,
            GroupVersionResource::new("", "v1", "configmaps"),
            json!({}),
        );
        let skipped = request
            .clone()
            .in_namespace("exempted", labels(&[("skip-webhook-admission", "yes")]));
        let covered = request.in_namespace("covered", BTreeMap::new());

        assert!(!hook.selects_namespace(&skipped));
        assert!(hook.selects_namespace(&covered));
    }
}
