//! Admission Pipeline
//!
//! Evaluates one admission request against one configuration snapshot:
//! `Received -> Matching -> Invoking -> Aggregating -> Decided`. No state is
//! kept between requests.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::aggregate::{Decision, DenyKind, Outcome, WebhookOutcome};
use super::invoker::{InvocationError, WebhookCaller};
use super::namespaces::NamespaceLabels;
use super::snapshot::{ConfigurationSnapshot, SnapshotStore};
use super::types::{AdmissionRequest, WebhookRule};
use crate::error::Error;

/// How surviving webhooks are invoked
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// All at once; every call is awaited
    #[default]
    Parallel,
    /// One at a time in snapshot order, stopping at the first denial
    Sequential,
}

impl FromStr for DispatchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "parallel" => Ok(DispatchMode::Parallel),
            "sequential" => Ok(DispatchMode::Sequential),
            other => Err(Error::ConfigError(format!(
                "unknown dispatch mode {other}, expected parallel or sequential"
            ))),
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMode::Parallel => write!(f, "parallel"),
            DispatchMode::Sequential => write!(f, "sequential"),
        }
    }
}

/// Pipeline stage, for tracing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Received,
    Matching,
    Invoking,
    Aggregating,
    Decided,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Full result of evaluating one request
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub uid: String,
    pub decision: Decision,
    /// Outcomes of the webhooks that were invoked, in snapshot order
    pub outcomes: Vec<WebhookOutcome>,
    /// Revision of the snapshot the request was evaluated against
    pub revision: String,
}

/// Stateless evaluator of admission requests
pub struct AdmissionPipeline {
    snapshots: Arc<SnapshotStore>,
    caller: Arc<dyn WebhookCaller>,
    namespaces: Option<Arc<dyn NamespaceLabels>>,
    mode: DispatchMode,
}

impl AdmissionPipeline {
    pub fn new(snapshots: Arc<SnapshotStore>, caller: Arc<dyn WebhookCaller>) -> Self {
        Self {
            snapshots,
            caller,
            namespaces: None,
            mode: DispatchMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Look namespace labels up from `source` instead of trusting the request
    pub fn with_namespace_labels(mut self, source: Arc<dyn NamespaceLabels>) -> Self {
        self.namespaces = Some(source);
        self
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    /// Decide a request
    pub async fn admit(&self, request: AdmissionRequest) -> Decision {
        self.evaluate(request).await.decision
    }

    /// Decide a request and report every webhook outcome
    #[instrument(skip(self, request), fields(uid = tracing::field::Empty, resource = %request.resource, operation = %request.operation))]
    pub async fn evaluate(&self, mut request: AdmissionRequest) -> Evaluation {
        request.ensure_uid();
        tracing::Span::current().record("uid", request.uid.as_str());
        debug!(stage = %Stage::Received, name = %request.name, "Admission request received");

        // One snapshot for the whole request.
        let snapshot = self.snapshots.current();

        if !self.snapshots.feature_enabled() {
            debug!("Dynamic admission disabled, admitting");
            return self.decided(request.uid, Decision::admit(), Vec::new(), &snapshot);
        }

        if let Some(source) = &self.namespaces {
            let namespace = request
                .namespace
                .clone()
                .filter(|ns| !ns.is_empty() && needs_namespace_labels(&snapshot, &request));
            if let Some(namespace) = namespace {
                match source.labels(&namespace).await {
                    Ok(labels) => request.namespace_labels = labels,
                    Err(e) => {
                        error!("Failed to look up labels of namespace {}: {}", namespace, e);
                        let decision = Decision::Deny {
                            kind: DenyKind::InternalError,
                            message: format!("failed to look up namespace {namespace}: {e}"),
                        };
                        return self.decided(request.uid, decision, Vec::new(), &snapshot);
                    }
                }
            }
        }

        debug!(stage = %Stage::Matching, revision = %&snapshot.revision()[..12], "Matching webhooks");
        let hooks = matching_webhooks(&snapshot, &request);
        if hooks.is_empty() {
            debug!("No webhooks apply");
            return self.decided(request.uid, Decision::admit(), Vec::new(), &snapshot);
        }

        debug!(stage = %Stage::Invoking, webhooks = hooks.len(), mode = %self.mode, "Invoking webhooks");
        let outcomes = match self.mode {
            DispatchMode::Parallel => {
                join_all(hooks.iter().map(|hook| self.invoke(hook, &request))).await
            }
            DispatchMode::Sequential => {
                let mut outcomes = Vec::with_capacity(hooks.len());
                for hook in &hooks {
                    let outcome = self.invoke(hook, &request).await;
                    let denied = matches!(outcome.outcome, Outcome::Denied { .. });
                    outcomes.push(outcome);
                    if denied {
                        break;
                    }
                }
                outcomes
            }
        };

        debug!(stage = %Stage::Aggregating, "Aggregating {} outcome(s)", outcomes.len());
        let decision = Decision::aggregate(&outcomes);
        self.decided(request.uid, decision, outcomes, &snapshot)
    }

    fn decided(
        &self,
        uid: String,
        decision: Decision,
        outcomes: Vec<WebhookOutcome>,
        snapshot: &ConfigurationSnapshot,
    ) -> Evaluation {
        match &decision {
            Decision::Admit { .. } => {
                debug!(stage = %Stage::Decided, "Admitted")
            }
            Decision::Deny { kind, message } => {
                info!(stage = %Stage::Decided, ?kind, "Denied: {}", message)
            }
        }

        #[cfg(feature = "metrics")]
        crate::metrics::inc_decision(decision.label());

        Evaluation {
            uid,
            decision,
            outcomes,
            revision: snapshot.revision().to_string(),
        }
    }

    async fn invoke(&self, hook: &WebhookRule, request: &AdmissionRequest) -> WebhookOutcome {
        let started = Instant::now();
        let timeout = hook.timeout();
        let result = tokio::time::timeout(timeout, self.caller.call(hook, request))
            .await
            .unwrap_or(Err(InvocationError::Timeout(timeout)));
        let outcome = Outcome::resolve(result, hook.failure_policy);
        let elapsed = started.elapsed();

        match &outcome {
            Outcome::Ignored { reason } => warn!(
                "Failed calling webhook {}, failing open: {}",
                hook.name, reason
            ),
            Outcome::Fatal { reason } => warn!(
                "Failed calling webhook {}, failing closed: {}",
                hook.name, reason
            ),
            _ => debug!(
                "Webhook {} returned {} in {:?}",
                hook.name,
                outcome.label(),
                elapsed
            ),
        }

        #[cfg(feature = "metrics")]
        crate::metrics::observe_webhook_invocation(&hook.name, outcome.label(), elapsed.as_secs_f64());

        WebhookOutcome::new(hook.name.clone(), outcome)
    }
}

/// Whether a webhook that matches `request` narrows by namespace labels
fn needs_namespace_labels(snapshot: &ConfigurationSnapshot, request: &AdmissionRequest) -> bool {
    snapshot.webhooks().any(|(_, hook)| {
        hook.namespace_selector
            .as_ref()
            .is_some_and(|selector| !selector.is_empty())
            && hook.matches(request)
    })
}

/// Webhooks of `snapshot` that apply to `request`, in snapshot order
pub fn matching_webhooks<'a>(
    snapshot: &'a ConfigurationSnapshot,
    request: &AdmissionRequest,
) -> Vec<&'a WebhookRule> {
    snapshot
        .webhooks()
        .filter_map(|(config, hook)| {
            if !hook.matches(request) {
                return None;
            }
            if !hook.selects_namespace(request) {
                debug!(
                    "Webhook {} of {} skipped by namespace selector",
                    hook.name, config.name
                );
                return None;
            }
            Some(hook)
        })
        .collect()
}
