//! Policy aggregation
//!
//! Reduces per-webhook outcomes, in snapshot order, into one decision.

use serde::{Deserialize, Serialize};

use super::invoker::InvocationResult;
use super::types::FailurePolicy;
use crate::error::{Error, Result};

/// Substituted when a denying webhook gives no message
pub const NO_REASON_GIVEN: &str = "the webhook denied the request without giving a reason";

/// What consulting one webhook amounted to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum Outcome {
    Allowed { warnings: Vec<String> },
    Denied { message: String },
    /// The webhook failed and its policy is Ignore
    Ignored { reason: String },
    /// The webhook failed and its policy is Fail
    Fatal { reason: String },
}

impl Outcome {
    /// Resolve an invocation result under the webhook's failure policy
    pub fn resolve(result: InvocationResult, policy: FailurePolicy) -> Self {
        match result {
            Ok(response) if response.allowed => Outcome::Allowed {
                warnings: response.warnings,
            },
            Ok(response) => Outcome::Denied {
                message: response
                    .message()
                    .map(str::to_string)
                    .unwrap_or_else(|| NO_REASON_GIVEN.to_string()),
            },
            Err(err) => match policy {
                FailurePolicy::Ignore => Outcome::Ignored {
                    reason: err.to_string(),
                },
                FailurePolicy::Fail => Outcome::Fatal {
                    reason: err.to_string(),
                },
            },
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Allowed { .. } => "allowed",
            Outcome::Denied { .. } => "denied",
            Outcome::Ignored { .. } => "ignored",
            Outcome::Fatal { .. } => "fatal",
        }
    }
}

/// Outcome of one named webhook
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookOutcome {
    pub webhook: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl WebhookOutcome {
    pub fn new(webhook: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            webhook: webhook.into(),
            outcome,
        }
    }
}

/// Class of a denial
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenyKind {
    /// A webhook rejected the request
    PolicyDeny,
    /// A fail-closed webhook could not be consulted
    InternalError,
}

/// Final admission decision
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "camelCase")]
pub enum Decision {
    Admit { warnings: Vec<String> },
    Deny { kind: DenyKind, message: String },
}

impl Decision {
    pub fn admit() -> Self {
        Decision::Admit {
            warnings: Vec::new(),
        }
    }

    /// Reduce outcomes listed in snapshot order.
    ///
    /// Any denial wins and every denial message is reported; otherwise the
    /// first fatal failure denies with an internal error; otherwise admit.
    pub fn aggregate(outcomes: &[WebhookOutcome]) -> Self {
        let denials: Vec<String> = outcomes
            .iter()
            .filter_map(|o| match &o.outcome {
                Outcome::Denied { message } => Some(format!(
                    "admission webhook \"{}\" denied the request: {}",
                    o.webhook, message
                )),
                _ => None,
            })
            .collect();

        if !denials.is_empty() {
            return Decision::Deny {
                kind: DenyKind::PolicyDeny,
                message: denials.join("; "),
            };
        }

        let fatal = outcomes.iter().find_map(|o| match &o.outcome {
            Outcome::Fatal { reason } => Some(format!(
                "failed calling webhook \"{}\": {}",
                o.webhook, reason
            )),
            _ => None,
        });
        if let Some(message) = fatal {
            return Decision::Deny {
                kind: DenyKind::InternalError,
                message,
            };
        }

        Decision::Admit {
            warnings: outcomes
                .iter()
                .flat_map(|o| match &o.outcome {
                    Outcome::Allowed { warnings } => warnings.clone(),
                    _ => Vec::new(),
                })
                .collect(),
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admit { .. })
    }

    /// HTTP status a caller should surface
    pub fn status_code(&self) -> u16 {
        match self {
            Decision::Admit { .. } => 200,
            Decision::Deny {
                kind: DenyKind::PolicyDeny,
                ..
            } => 403,
            Decision::Deny {
                kind: DenyKind::InternalError,
                ..
            } => 500,
        }
    }

    /// Status reason for denials
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Decision::Admit { .. } => None,
            Decision::Deny {
                kind: DenyKind::PolicyDeny,
                ..
            } => Some("Forbidden"),
            Decision::Deny {
                kind: DenyKind::InternalError,
                ..
            } => Some("InternalError"),
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Decision::Admit { .. } => None,
            Decision::Deny { message, .. } => Some(message),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Decision::Admit { .. } => "admit",
            Decision::Deny {
                kind: DenyKind::PolicyDeny,
                ..
            } => "deny",
            Decision::Deny {
                kind: DenyKind::InternalError,
                ..
            } => "error",
        }
    }

    /// Convert into a library result carrying the admit warnings
    pub fn into_result(self) -> Result<Vec<String>> {
        match self {
            Decision::Admit { warnings } => Ok(warnings),
            Decision::Deny {
                kind: DenyKind::PolicyDeny,
                message,
            } => Err(Error::Denied(message)),
            Decision::Deny {
                kind: DenyKind::InternalError,
                message,
            } => Err(Error::AdmissionInternal(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::invoker::InvocationError;
    use crate::webhook::types::AdmissionResponse;

    fn allowed(name: &str) -> WebhookOutcome {
        WebhookOutcome::new(name, Outcome::Allowed { warnings: vec![] })
    }

    fn denied(name: &str, message: &str) -> WebhookOutcome {
        WebhookOutcome::new(
            name,
            Outcome::Denied {
                message: message.to_string(),
            },
        )
    }

    fn fatal(name: &str) -> WebhookOutcome {
        WebhookOutcome::new(
            name,
            Outcome::Fatal {
                reason: "failed to connect: connection refused".to_string(),
            },
        )
    }

    #[test]
    fn test_no_outcomes_admits() {
        assert_eq!(Decision::aggregate(&[]), Decision::admit());
    }

    #[test]
    fn test_deny_wins_over_allow_and_fatal() {
        let decision = Decision::aggregate(&[
            allowed("a"),
            fatal("b"),
            denied("c", "the pod contains unwanted label"),
        ]);
        assert_eq!(decision.status_code(), 403);
        assert_eq!(decision.reason(), Some("Forbidden"));
        assert_eq!(
            decision.message(),
            Some("admission webhook \"c\" denied the request: the pod contains unwanted label")
        );
    }

    #[test]
    fn test_every_denial_is_reported_in_order() {
        let decision = Decision::aggregate(&[
            denied("first", "the pod contains unwanted container name"),
            allowed("middle"),
            denied("second", "the pod contains unwanted label"),
        ]);
        let message = decision.message().unwrap();
        assert_eq!(
            message,
            "admission webhook \"first\" denied the request: the pod contains unwanted container name; \
             admission webhook \"second\" denied the request: the pod contains unwanted label"
        );
    }

    #[test]
    fn test_fatal_denies_with_internal_error() {
        let decision = Decision::aggregate(&[allowed("a"), fatal("fail-closed.k8s.io"), fatal("z")]);
        assert_eq!(decision.status_code(), 500);
        assert_eq!(decision.reason(), Some("InternalError"));
        assert!(decision
            .message()
            .unwrap()
            .starts_with("failed calling webhook \"fail-closed.k8s.io\""));
        assert!(matches!(
            decision.into_result(),
            Err(Error::AdmissionInternal(_))
        ));
    }

    #[test]
    fn test_ignored_failures_admit() {
        let decision = Decision::aggregate(&[WebhookOutcome::new(
            "fail-open",
            Outcome::Ignored {
                reason: "request timed out".to_string(),
            },
        )]);
        assert!(decision.is_admitted());
    }

    #[test]
    fn test_warnings_are_collected_on_admit() {
        let decision = Decision::aggregate(&[
            WebhookOutcome::new("a", Outcome::Allowed { warnings: vec!["w1".into()] }),
            WebhookOutcome::new("b", Outcome::Allowed { warnings: vec!["w2".into()] }),
        ]);
        assert_eq!(decision.into_result().unwrap(), vec!["w1", "w2"]);
    }

    #[test]
    fn test_resolve_applies_failure_policy() {
        let failure = || Err(InvocationError::EmptyCaBundle);
        assert!(matches!(
            Outcome::resolve(failure(), FailurePolicy::Ignore),
            Outcome::Ignored { .. }
        ));
        assert!(matches!(
            Outcome::resolve(failure(), FailurePolicy::Fail),
            Outcome::Fatal { .. }
        ));
    }

    #[test]
    fn test_resolve_fills_missing_denial_message() {
        let mut response = AdmissionResponse::denied("uid", "");
        response.status = None;
        assert_eq!(
            Outcome::resolve(Ok(response), FailurePolicy::Fail),
            Outcome::Denied {
                message: NO_REASON_GIVEN.to_string()
            }
        );
    }

    #[test]
    fn test_denial_is_never_softened_by_ignore_policy() {
        let response = AdmissionResponse::denied("uid", "the configmap contains unwanted key and value");
        assert_eq!(
            Outcome::resolve(Ok(response), FailurePolicy::Ignore).label(),
            "denied"
        );
    }
}
