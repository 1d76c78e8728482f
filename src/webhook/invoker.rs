//! Webhook Invoker
//!
//! Sends one `AdmissionReview` to one webhook over HTTPS, trusting only the
//! webhook's CA bundle, and returns its verdict or the reason the call failed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, instrument};

use super::types::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, ClientEndpoint, ServiceReference,
    WebhookRule,
};

/// Why a webhook could not be consulted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    #[error("no CA bundle configured for the webhook endpoint")]
    EmptyCaBundle,

    #[error("invalid CA bundle: {0}")]
    InvalidCaBundle(String),

    #[error("invalid webhook endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("webhook returned HTTP status {0}")]
    Status(u16),

    #[error("malformed webhook response: {0}")]
    MalformedBody(String),

    #[error("webhook response has no response field")]
    MissingResponse,

    #[error("webhook response uid {actual:?} does not match request uid {expected:?}")]
    UidMismatch { expected: String, actual: String },
}

pub type InvocationResult = std::result::Result<AdmissionResponse, InvocationError>;

/// Transport used to consult one webhook
#[async_trait]
pub trait WebhookCaller: Send + Sync {
    async fn call(&self, hook: &WebhookRule, request: &AdmissionRequest) -> InvocationResult;
}

/// Maps a service reference to a base URL (scheme, host and port)
pub trait ServiceResolver: Send + Sync {
    fn base_url(&self, service: &ServiceReference) -> String;
}

/// Resolves services through cluster DNS
#[derive(Debug, Default, Clone)]
pub struct ClusterServiceResolver;

impl ServiceResolver for ClusterServiceResolver {
    fn base_url(&self, service: &ServiceReference) -> String {
        format!(
            "https://{}.{}.svc:{}",
            service.name, service.namespace, service.port
        )
    }
}

/// Resolves selected services to fixed base URLs, falling back to cluster DNS
#[derive(Debug, Default, Clone)]
pub struct StaticServiceResolver {
    overrides: HashMap<(String, String), String>,
}

impl StaticServiceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(
        mut self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        self.overrides
            .insert((namespace.into(), name.into()), base_url.into());
        self
    }
}

impl ServiceResolver for StaticServiceResolver {
    fn base_url(&self, service: &ServiceReference) -> String {
        self.overrides
            .get(&(service.namespace.clone(), service.name.clone()))
            .map(|base| base.trim_end_matches('/').to_string())
            .unwrap_or_else(|| ClusterServiceResolver.base_url(service))
    }
}

/// HTTPS webhook caller with one client per distinct CA bundle
pub struct HttpsWebhookCaller {
    resolver: Arc<dyn ServiceResolver>,
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl Default for HttpsWebhookCaller {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpsWebhookCaller {
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(ClusterServiceResolver))
    }

    pub fn with_resolver(resolver: Arc<dyn ServiceResolver>) -> Self {
        Self {
            resolver,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Full URL the review is posted to
    pub fn endpoint_url(&self, endpoint: &ClientEndpoint) -> Result<String, InvocationError> {
        match (&endpoint.service, &endpoint.url) {
            (Some(service), None) => {
                let path = service.path.as_deref().unwrap_or("/");
                let path = if path.starts_with('/') {
                    path.to_string()
                } else {
                    format!("/{path}")
                };
                Ok(format!("{}{}", self.resolver.base_url(service), path))
            }
            (None, Some(url)) if url.starts_with("https://") => Ok(url.clone()),
            (None, Some(url)) => Err(InvocationError::InvalidEndpoint(format!(
                "{url} is not an https URL"
            ))),
            _ => Err(InvocationError::InvalidEndpoint(
                "exactly one of service or url must be set".to_string(),
            )),
        }
    }

    /// Number of distinct clients built so far
    pub fn cached_clients(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or_default()
    }

    fn client_for(&self, ca_bundle: &[u8]) -> Result<reqwest::Client, InvocationError> {
        if ca_bundle.iter().all(u8::is_ascii_whitespace) {
            return Err(InvocationError::EmptyCaBundle);
        }

        let fingerprint = hex::encode(Sha256::digest(ca_bundle));
        if let Some(client) = self
            .clients
            .lock()
            .ok()
            .and_then(|clients| clients.get(&fingerprint).cloned())
        {
            return Ok(client);
        }

        let certs = reqwest::Certificate::from_pem_bundle(ca_bundle)
            .map_err(|e| InvocationError::InvalidCaBundle(e.to_string()))?;
        if certs.is_empty() {
            return Err(InvocationError::InvalidCaBundle(
                "no PEM certificates found".to_string(),
            ));
        }

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .https_only(true);
        for cert in certs {
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| InvocationError::InvalidCaBundle(e.to_string()))?;

        debug!("Built webhook client for CA bundle {}", &fingerprint[..12]);
        if let Ok(mut clients) = self.clients.lock() {
            clients.insert(fingerprint, client.clone());
        }
        Ok(client)
    }
}

#[async_trait]
impl WebhookCaller for HttpsWebhookCaller {
    #[instrument(skip(self, hook, request), fields(webhook = %hook.name, uid = %request.uid))]
    async fn call(&self, hook: &WebhookRule, request: &AdmissionRequest) -> InvocationResult {
        let client = self.client_for(&hook.client_config.ca_bundle)?;
        let url = self.endpoint_url(&hook.client_config)?;
        let timeout = hook.timeout();

        debug!("Calling webhook at {}", url);

        let review = AdmissionReview::for_request(request.clone());
        let response = client
            .post(&url)
            .timeout(timeout)
            .json(&review)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(InvocationError::Status(status.as_u16()));
        }

        let body = response.bytes().await.map_err(|e| classify(e, timeout))?;
        let review: AdmissionReview = serde_json::from_slice(&body)
            .map_err(|e| InvocationError::MalformedBody(e.to_string()))?;
        let verdict = review.response.ok_or(InvocationError::MissingResponse)?;

        if verdict.uid != request.uid {
            return Err(InvocationError::UidMismatch {
                expected: request.uid.clone(),
                actual: verdict.uid,
            });
        }

        Ok(verdict)
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> InvocationError {
    if err.is_timeout() {
        InvocationError::Timeout(timeout)
    } else {
        let mut message = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            message = format!("{message}: {cause}");
            source = cause.source();
        }
        InvocationError::Connect(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::types::{
        GroupVersionResource, MatchRule, Operation, OperationType,
    };
    use serde_json::json;

    fn self_signed_pem() -> Vec<u8> {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        certified.cert.pem().into_bytes()
    }

    fn hook(endpoint: ClientEndpoint) -> WebhookRule {
        WebhookRule::new(
            "deny-unwanted-configmap-data.k8s.io",
            vec![MatchRule::new(vec![OperationType::Create], &[""], &["v1"], &["configmaps"])],
            endpoint,
        )
        .with_timeout_seconds(2)
    }

    fn request() -> AdmissionRequest {
        AdmissionRequest::new(
            Operation::Create,
            GroupVersionResource::new("", "v1", "configmaps"),
            json!({ "metadata": { "name": "cm" } }),
        )
    }

    #[test]
    fn test_service_url_uses_cluster_dns() {
        let caller = HttpsWebhookCaller::new();
        let endpoint = ClientEndpoint::service(
            ServiceReference::new("webhook-ns", "e2e-test-webhook", "/configmaps"),
            Vec::new(),
        );
        assert_eq!(
            caller.endpoint_url(&endpoint).unwrap(),
            "https://e2e-test-webhook.webhook-ns.svc:443/configmaps"
        );
    }

    #[test]
    fn test_static_resolver_overrides_service() {
        let resolver = StaticServiceResolver::new().with_service(
            "webhook-ns",
            "e2e-test-webhook",
            "https://localhost:8443/",
        );
        let caller = HttpsWebhookCaller::with_resolver(Arc::new(resolver));
        let endpoint = ClientEndpoint::service(
            ServiceReference::new("webhook-ns", "e2e-test-webhook", "pods"),
            Vec::new(),
        );
        assert_eq!(
            caller.endpoint_url(&endpoint).unwrap(),
            "https://localhost:8443/pods"
        );
    }

    #[test]
    fn test_plain_http_url_is_rejected() {
        let caller = HttpsWebhookCaller::new();
        let endpoint = ClientEndpoint::url("http://localhost:8080/", Vec::new());
        assert!(matches!(
            caller.endpoint_url(&endpoint),
            Err(InvocationError::InvalidEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_ca_bundle_fails_every_call() {
        let caller = HttpsWebhookCaller::new();
        let result = caller
            .call(
                &hook(ClientEndpoint::url("https://localhost:1/", Vec::new())),
                &request(),
            )
            .await;
        assert_eq!(result, Err(InvocationError::EmptyCaBundle));
    }

    #[tokio::test]
    async fn test_unparsable_ca_bundle_fails() {
        let caller = HttpsWebhookCaller::new();
        let result = caller
            .call(
                &hook(ClientEndpoint::url(
                    "https://localhost:1/",
                    b"not a certificate".to_vec(),
                )),
                &request(),
            )
            .await;
        assert!(matches!(result, Err(InvocationError::InvalidCaBundle(_))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connect_failure() {
        let caller = HttpsWebhookCaller::new();
        let result = caller
            .call(
                &hook(ClientEndpoint::url("https://127.0.0.1:1/", self_signed_pem())),
                &request(),
            )
            .await;
        assert!(matches!(
            result,
            Err(InvocationError::Connect(_)) | Err(InvocationError::Timeout(_))
        ));
    }

    #[test]
    fn test_clients_are_cached_per_bundle() {
        let caller = HttpsWebhookCaller::new();
        let first = self_signed_pem();
        let second = self_signed_pem();

        caller.client_for(&first).unwrap();
        caller.client_for(&first).unwrap();
        assert_eq!(caller.cached_clients(), 1);

        caller.client_for(&second).unwrap();
        assert_eq!(caller.cached_clients(), 2);
    }

    #[cfg(feature = "server")]
    mod misbehaving_webhooks {
        use super::*;
        use crate::tls::ServingCertificate;
        use axum::{http::StatusCode, routing::post, Json, Router};
        use std::net::SocketAddr;

        async fn wrong_uid(Json(_): Json<AdmissionReview>) -> Json<AdmissionReview> {
            Json(AdmissionReview::for_response(AdmissionResponse::allowed("other")))
        }

        async fn server_error() -> StatusCode {
            StatusCode::INTERNAL_SERVER_ERROR
        }

        async fn not_json() -> &'static str {
            "this is not an admission review"
        }

        async fn slow(Json(review): Json<AdmissionReview>) -> Json<AdmissionReview> {
            tokio::time::sleep(Duration::from_secs(3)).await;
            let uid = review.request.map(|r| r.uid).unwrap_or_default();
            Json(AdmissionReview::for_response(AdmissionResponse::allowed(uid)))
        }

        /// Serve the misbehaving endpoints over TLS; returns the base URL and CA bundle
        async fn start() -> (String, Vec<u8>, axum_server::Handle) {
            let certificate = ServingCertificate::self_signed(vec![
                "localhost".to_string(),
                "127.0.0.1".to_string(),
            ])
            .unwrap();
            let rustls_config = certificate.rustls_config().unwrap();

            let app = Router::new()
                .route("/wrong-uid", post(wrong_uid))
                .route("/server-error", post(server_error))
                .route("/not-json", post(not_json))
                .route("/slow", post(slow));

            let handle = axum_server::Handle::new();
            let server_handle = handle.clone();
            tokio::spawn(async move {
                axum_server::bind_rustls(SocketAddr::from(([127, 0, 0, 1], 0)), rustls_config)
                    .handle(server_handle)
                    .serve(app.into_make_service())
                    .await
                    .unwrap();
            });
            let addr = handle.listening().await.unwrap();

            (
                format!("https://127.0.0.1:{}", addr.port()),
                certificate.cert_pem,
                handle,
            )
        }

        async fn call_path(path: &str, timeout_seconds: u32) -> InvocationResult {
            let (base_url, ca_bundle, handle) = start().await;
            let caller = HttpsWebhookCaller::new();
            let result = caller
                .call(
                    &hook(ClientEndpoint::url(format!("{base_url}{path}"), ca_bundle))
                        .with_timeout_seconds(timeout_seconds),
                    &request(),
                )
                .await;
            handle.shutdown();
            result
        }

        #[tokio::test]
        async fn test_mismatched_uid_is_rejected() {
            match call_path("/wrong-uid", 2).await {
                Err(InvocationError::UidMismatch { actual, .. }) => assert_eq!(actual, "other"),
                other => panic!("expected a uid mismatch, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_non_success_status_is_rejected() {
            assert_eq!(
                call_path("/server-error", 2).await,
                Err(InvocationError::Status(500))
            );
        }

        #[tokio::test]
        async fn test_malformed_body_is_rejected() {
            assert!(matches!(
                call_path("/not-json", 2).await,
                Err(InvocationError::MalformedBody(_))
            ));
        }

        #[tokio::test]
        async fn test_slow_webhook_times_out() {
            let started = std::time::Instant::now();
            assert_eq!(
                call_path("/slow", 1).await,
                Err(InvocationError::Timeout(Duration::from_secs(1)))
            );
            assert!(started.elapsed() < Duration::from_secs(3));
        }
    }
}
