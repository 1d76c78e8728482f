//! TLS material for the dispatcher's HTTP surface

use std::path::Path;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tracing::info;

use crate::error::{Error, Result};

/// Install the process-wide rustls crypto provider. Safe to call repeatedly.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// PEM-encoded serving certificate chain and private key
#[derive(Clone)]
pub struct ServingCertificate {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl std::fmt::Debug for ServingCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServingCertificate")
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

impl ServingCertificate {
    /// Read a certificate chain and key from disk
    pub async fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = tokio::fs::read(cert_path).await.map_err(|e| {
            Error::TlsError(format!("Failed to read {}: {e}", cert_path.display()))
        })?;
        let key_pem = tokio::fs::read(key_path).await.map_err(|e| {
            Error::TlsError(format!("Failed to read {}: {e}", key_path.display()))
        })?;
        Ok(Self { cert_pem, key_pem })
    }

    /// Generate an ephemeral self-signed certificate for development
    pub fn self_signed(subject_alt_names: Vec<String>) -> Result<Self> {
        let certified = rcgen::generate_simple_self_signed(subject_alt_names.clone())
            .map_err(|e| Error::TlsError(format!("Failed to generate certificate: {e}")))?;
        info!(
            "Generated self-signed serving certificate for {}",
            subject_alt_names.join(", ")
        );
        Ok(Self {
            cert_pem: certified.cert.pem().into_bytes(),
            key_pem: certified.key_pair.serialize_pem().into_bytes(),
        })
    }

    /// Build a rustls server configuration without client authentication
    pub fn server_config(&self) -> Result<rustls::ServerConfig> {
        install_crypto_provider();

        let certs = CertificateDer::pem_slice_iter(&self.cert_pem)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::TlsError(format!("Failed to parse certificates: {e}")))?;
        if certs.is_empty() {
            return Err(Error::TlsError("No certificates found".to_string()));
        }

        let key = PrivateKeyDer::from_pem_slice(&self.key_pem)
            .map_err(|e| Error::TlsError(format!("Failed to parse private key: {e}")))?;

        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::TlsError(format!("Failed to create server config: {e}")))
    }

    pub fn rustls_config(&self) -> Result<RustlsConfig> {
        let mut config = self.server_config()?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(RustlsConfig::from_config(Arc::new(config)))
    }
}
