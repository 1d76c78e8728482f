//! Rule matching
//!
//! Decides whether a webhook rule applies to an admission request by its
//! operation, API group, API version, resource (with subresource) and scope.

use super::types::{AdmissionRequest, MatchRule, Scope, WebhookRule, WILDCARD};

impl MatchRule {
    /// Check if this rule matches the request. Every dimension must match.
    pub fn matches(&self, request: &AdmissionRequest) -> bool {
        self.operations.iter().any(|op| op.matches(request.operation))
            && matches_any(&self.api_groups, &request.resource.group)
            && matches_any(&self.api_versions, &request.resource.version)
            && self.matches_resource(&request.resource.resource, request.sub_resource.as_deref())
            && self.matches_scope(request.namespace.as_deref())
    }

    fn matches_resource(&self, resource: &str, sub_resource: Option<&str>) -> bool {
        let sub_resource = sub_resource.filter(|s| !s.is_empty());
        self.resources
            .iter()
            .any(|pattern| resource_pattern_matches(pattern, resource, sub_resource))
    }

    fn matches_scope(&self, namespace: Option<&str>) -> bool {
        let namespaced = namespace.is_some_and(|ns| !ns.is_empty());
        match self.scope {
            Scope::All => true,
            Scope::Namespaced => namespaced,
            Scope::Cluster => !namespaced,
        }
    }
}

impl WebhookRule {
    /// Check if any of this webhook's match rules applies to the request
    pub fn matches(&self, request: &AdmissionRequest) -> bool {
        self.rules.iter().any(|rule| rule.matches(request))
    }
}

fn matches_any(allowed: &[String], value: &str) -> bool {
    allowed.iter().any(|a| a == WILDCARD || a == value)
}

// `pods` is the main resource only, `pods/status` one subresource,
// `pods/*` any subresource of pods, `*/status` that subresource anywhere,
// `*/*` everything and `*` every main resource.
fn resource_pattern_matches(pattern: &str, resource: &str, sub_resource: Option<&str>) -> bool {
    match pattern.split_once('/') {
        None => sub_resource.is_none() && (pattern == WILDCARD || pattern == resource),
        Some((WILDCARD, WILDCARD)) => true,
        Some((res, sub)) => match sub_resource {
            Some(requested) => {
                (res == WILDCARD || res == resource) && (sub == WILDCARD || sub == requested)
            }
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::types::{
        ClientEndpoint, GroupVersionResource, Operation, OperationType, ServiceReference,
    };
    use serde_json::json;

    fn request(op: Operation, group: &str, version: &str, resource: &str) -> AdmissionRequest {
        AdmissionRequest::new(op, GroupVersionResource::new(group, version, resource), json!({}))
            .in_namespace("default", Default::default())
    }

    #[test]
    fn test_exact_rule_matches() {
        let rule = MatchRule::new(vec![OperationType::Create], &[""], &["v1"], &["pods"]);
        assert!(rule.matches(&request(Operation::Create, "", "v1", "pods")));
        assert!(!rule.matches(&request(Operation::Update, "", "v1", "pods")));
        assert!(!rule.matches(&request(Operation::Create, "apps", "v1", "pods")));
        assert!(!rule.matches(&request(Operation::Create, "", "v2", "pods")));
        assert!(!rule.matches(&request(Operation::Create, "", "v1", "configmaps")));
    }

    #[test]
    fn test_wildcards_match_every_value() {
        let rule = MatchRule::new(vec![OperationType::All], &["*"], &["*"], &["*"]);
        assert!(rule.matches(&request(Operation::Delete, "apps", "v1", "deployments")));
        assert!(rule.matches(&request(
            Operation::Connect,
            "webhook-crd-test.k8s.io",
            "v1",
            "e2e-test-webhook-crds"
        )));
    }

    #[test]
    fn test_empty_dimension_matches_nothing() {
        let rule = MatchRule::new(vec![OperationType::Create], &[], &["v1"], &["pods"]);
        assert!(!rule.matches(&request(Operation::Create, "", "v1", "pods")));

        let no_ops = MatchRule::new(vec![], &[""], &["v1"], &["pods"]);
        assert!(!no_ops.matches(&request(Operation::Create, "", "v1", "pods")));
    }

    #[test]
    fn test_subresource_semantics() {
        let status = request(Operation::Update, "", "v1", "pods").with_sub_resource("status");
        let main = request(Operation::Update, "", "v1", "pods");
        let rule = |resources: &[&str]| {
            MatchRule::new(vec![OperationType::Update], &[""], &["v1"], resources)
        };

        assert!(rule(&["pods"]).matches(&main));
        assert!(!rule(&["pods"]).matches(&status));
        assert!(rule(&["pods/status"]).matches(&status));
        assert!(!rule(&["pods/status"]).matches(&main));
        assert!(rule(&["pods/*"]).matches(&status));
        assert!(!rule(&["pods/*"]).matches(&main));
        assert!(rule(&["*/status"]).matches(&status));
        assert!(!rule(&["*/log"]).matches(&status));
        assert!(rule(&["*/*"]).matches(&status));
        assert!(rule(&["*/*"]).matches(&main));
        assert!(rule(&["*"]).matches(&main));
        assert!(!rule(&["*"]).matches(&status));
    }

    #[test]
    fn test_scope() {
        let namespaced = request(Operation::Create, "", "v1", "configmaps");
        let cluster = AdmissionRequest::new(
            Operation::Create,
            GroupVersionResource::new("", "v1", "namespaces"),
            json!({}),
        );

        let any = MatchRule::new(vec![OperationType::All], &["*"], &["*"], &["*"]);
        let ns_only = any.clone().with_scope(Scope::Namespaced);
        let cluster_only = any.clone().with_scope(Scope::Cluster);

        assert!(any.matches(&namespaced) && any.matches(&cluster));
        assert!(ns_only.matches(&namespaced) && !ns_only.matches(&cluster));
        assert!(!cluster_only.matches(&namespaced) && cluster_only.matches(&cluster));
    }

    #[test]
    fn test_webhook_matches_if_any_rule_matches() {
        let hook = WebhookRule::new(
            "deny-unwanted-pod-container-name-and-label.k8s.io",
            vec![
                MatchRule::new(vec![OperationType::Create], &[""], &["v1"], &["pods"]),
                MatchRule::new(vec![OperationType::Create], &[""], &["v1"], &["configmaps"]),
            ],
            ClientEndpoint::service(ServiceReference::new("ns", "svc", "/pods"), Vec::new()),
        );
        assert!(hook.matches(&request(Operation::Create, "", "v1", "configmaps")));
        assert!(!hook.matches(&request(Operation::Create, "", "v1", "secrets")));
    }
}
