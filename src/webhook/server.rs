//! Admission HTTP Server
//!
//! Exposes the admission pipeline and the configuration registration
//! interface over HTTP(S).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use kube::core::admission::{
    AdmissionRequest as KubeAdmissionRequest, AdmissionResponse as KubeAdmissionResponse,
    AdmissionReview as KubeAdmissionReview, Operation as KubeOperation,
};
use kube::core::DynamicObject;
use opentelemetry::{global, propagation::Extractor};
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::aggregate::{Decision, WebhookOutcome};
use super::pipeline::AdmissionPipeline;
use super::types::{
    AdmissionRequest, GroupVersionKind, GroupVersionResource, Operation, ResponseStatus,
    WebhookConfiguration,
};
use crate::error::{Error, Result};
use crate::tls::ServingCertificate;

struct HeaderExtractor<'a>(&'a HeaderMap);

impl<'a> Extractor for HeaderExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v: &HeaderValue| v.to_str().ok())
    }
    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k: &HeaderName| k.as_str()).collect()
    }
}

async fn extract_trace_context(request: Request, next: Next) -> Response {
    let parent_cx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(request.headers()))
    });
    tracing::Span::current().set_parent(parent_cx);
    next.run(request).await
}

/// Admission server state
pub struct AdmissionServer {
    pipeline: Arc<AdmissionPipeline>,

    /// Serving certificate; plain HTTP when absent
    tls: Option<ServingCertificate>,
}

/// Health check response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub configurations: usize,
    pub revision: String,
    pub dynamic_admission: bool,
}

/// Decision returned by `/admit`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmitResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ResponseStatus>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub outcomes: Vec<WebhookOutcome>,
    pub revision: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl AdmissionServer {
    pub fn new(pipeline: Arc<AdmissionPipeline>) -> Self {
        Self {
            pipeline,
            tls: None,
        }
    }

    /// Serve HTTPS with the given certificate
    pub fn with_tls(mut self, certificate: ServingCertificate) -> Self {
        self.tls = Some(certificate);
        self
    }

    pub fn pipeline(&self) -> &Arc<AdmissionPipeline> {
        &self.pipeline
    }

    /// Build the router
    pub fn router(self: Arc<Self>) -> Router {
        let router = Router::new()
            .route("/healthz", get(health_handler))
            .route("/readyz", get(ready_handler))
            .route("/admit", post(admit_handler))
            .route("/validate", post(validate_handler))
            .route(
                "/configurations",
                get(list_configurations_handler).post(create_configuration_handler),
            )
            .route(
                "/configurations/{name}",
                delete(delete_configuration_handler),
            );

        #[cfg(feature = "metrics")]
        let router = router.route("/metrics", get(metrics_handler));

        router
            .layer(middleware::from_fn(extract_trace_context))
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(self)
    }

    /// Start the server
    pub async fn start(self, addr: SocketAddr) -> Result<()> {
        self.serve(addr, axum_server::Handle::new()).await
    }

    /// Start the server, controlled through `handle`
    pub async fn serve(self, addr: SocketAddr, handle: axum_server::Handle) -> Result<()> {
        let tls = self.tls.clone();
        let app = Arc::new(self).router();

        match tls {
            Some(certificate) => {
                let rustls_config = certificate.rustls_config()?;
                info!("Admission server listening on {} (https)", addr);
                axum_server::bind_rustls(addr, rustls_config)
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await
                    .map_err(|e| Error::ConfigError(format!("Server error: {e}")))?;
            }
            None => {
                warn!("Admission server listening on {} (insecure)", addr);
                axum_server::bind(addr)
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await
                    .map_err(|e| Error::ConfigError(format!("Server error: {e}")))?;
            }
        }

        Ok(())
    }
}

fn error_status(err: &Error) -> StatusCode {
    match err {
        Error::AlreadyExists(_) | Error::Conflict(_) => StatusCode::CONFLICT,
        Error::NotFound(_) | Error::FeatureDisabled(_) => StatusCode::NOT_FOUND,
        Error::InvalidConfiguration { .. } | Error::ConfigError(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        Error::Denied(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: Error) -> Response {
    let status = error_status(&err);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

// HTTP Handlers

async fn health_handler(State(state): State<Arc<AdmissionServer>>) -> impl IntoResponse {
    let snapshots = state.pipeline.snapshots();
    let snapshot = snapshots.current();
    Json(HealthResponse {
        status: "healthy".to_string(),
        configurations: snapshot.len(),
        revision: snapshot.revision().to_string(),
        dynamic_admission: snapshots.feature_enabled(),
    })
}

async fn ready_handler(State(state): State<Arc<AdmissionServer>>) -> impl IntoResponse {
    let snapshots = state.pipeline.snapshots();
    let snapshot = snapshots.current();
    let (code, status) = if snapshots.is_loaded() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "configuration snapshot not loaded")
    };
    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            configurations: snapshot.len(),
            revision: snapshot.revision().to_string(),
            dynamic_admission: snapshots.feature_enabled(),
        }),
    )
}

#[cfg(feature = "metrics")]
async fn metrics_handler() -> Response {
    match crate::metrics::encode() {
        Ok(body) => (
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[instrument(skip(state, request))]
async fn admit_handler(
    State(state): State<Arc<AdmissionServer>>,
    Json(request): Json<AdmissionRequest>,
) -> impl IntoResponse {
    let evaluation = state.pipeline.evaluate(request).await;
    let decision = &evaluation.decision;
    let code = StatusCode::from_u16(decision.status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let status = decision.reason().map(|reason| ResponseStatus {
        code: Some(decision.status_code()),
        message: decision.message().map(str::to_string),
        reason: Some(reason.to_string()),
    });
    let warnings = match decision {
        Decision::Admit { warnings } => warnings.clone(),
        Decision::Deny { .. } => Vec::new(),
    };

    (
        code,
        Json(AdmitResponse {
            uid: evaluation.uid.clone(),
            allowed: decision.is_admitted(),
            status,
            warnings,
            outcomes: evaluation.outcomes,
            revision: evaluation.revision,
        }),
    )
}

#[instrument(skip(state, review))]
async fn validate_handler(
    State(state): State<Arc<AdmissionServer>>,
    Json(review): Json<KubeAdmissionReview<DynamicObject>>,
) -> impl IntoResponse {
    let req: KubeAdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!("Failed to parse admission request: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(
                    KubeAdmissionResponse::invalid(format!("Invalid admission request: {e}"))
                        .into_review(),
                ),
            );
        }
    };

    let request = match engine_request(&req) {
        Ok(request) => request,
        Err(e) => {
            error!("Failed to convert admission request: {}", e);
            return (
                StatusCode::OK,
                Json(
                    internal_error(&req, format!("Internal error occurred: {e}")).into_review(),
                ),
            );
        }
    };

    let decision = state.pipeline.admit(request).await;
    let response = match &decision {
        Decision::Admit { warnings } => {
            let mut response = KubeAdmissionResponse::from(&req);
            if !warnings.is_empty() {
                response.warnings = Some(warnings.clone());
            }
            response
        }
        Decision::Deny { message, .. } => {
            let mut response = KubeAdmissionResponse::from(&req).deny(message);
            response.result.code = decision.status_code();
            response.result.reason = decision.reason().unwrap_or_default().to_string();
            response
        }
    };

    (StatusCode::OK, Json(response.into_review()))
}

fn internal_error(
    req: &KubeAdmissionRequest<DynamicObject>,
    message: String,
) -> KubeAdmissionResponse {
    let mut response = KubeAdmissionResponse::from(req).deny(message);
    response.result.code = StatusCode::INTERNAL_SERVER_ERROR.as_u16();
    response.result.reason = "InternalError".to_string();
    response
}

fn engine_request(req: &KubeAdmissionRequest<DynamicObject>) -> Result<AdmissionRequest> {
    let operation = match req.operation {
        KubeOperation::Create => Operation::Create,
        KubeOperation::Update => Operation::Update,
        KubeOperation::Delete => Operation::Delete,
        KubeOperation::Connect => Operation::Connect,
    };

    let object = req
        .object
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?
        .unwrap_or(serde_json::Value::Null);
    let old_object = req
        .old_object
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;

    Ok(AdmissionRequest {
        uid: req.uid.clone(),
        kind: GroupVersionKind::new(&req.kind.group, &req.kind.version, &req.kind.kind),
        resource: GroupVersionResource::new(
            &req.resource.group,
            &req.resource.version,
            &req.resource.resource,
        ),
        sub_resource: req.sub_resource.clone().filter(|s| !s.is_empty()),
        name: req.name.clone(),
        namespace: req.namespace.clone().filter(|ns| !ns.is_empty()),
        operation,
        object,
        old_object,
        dry_run: req.dry_run,
        namespace_labels: BTreeMap::new(),
    })
}

async fn list_configurations_handler(State(state): State<Arc<AdmissionServer>>) -> Response {
    match state.pipeline.snapshots().store().list().await {
        Ok(configs) => Json(configs).into_response(),
        Err(e) => error_response(e),
    }
}

#[instrument(skip(state, config), fields(configuration = %config.name))]
async fn create_configuration_handler(
    State(state): State<Arc<AdmissionServer>>,
    Json(config): Json<WebhookConfiguration>,
) -> Response {
    let snapshots = state.pipeline.snapshots();
    match snapshots.store().create(config).await {
        Ok(created) => {
            if let Err(e) = snapshots.refresh().await {
                warn!("Failed to refresh snapshot after registration: {}", e);
            }
            (StatusCode::CREATED, Json(created)).into_response()
        }
        Err(e) => error_response(e),
    }
}

#[instrument(skip(state))]
async fn delete_configuration_handler(
    State(state): State<Arc<AdmissionServer>>,
    Path(name): Path<String>,
) -> Response {
    let snapshots = state.pipeline.snapshots();
    match snapshots.store().delete(&name).await {
        Ok(()) => {
            if let Err(e) = snapshots.refresh().await {
                warn!("Failed to refresh snapshot after removal: {}", e);
            }
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => error_response(e),
    }
}
