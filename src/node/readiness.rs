//! Kubernetes API readiness
//!
//! The node hands out an admin kubeconfig as soon as it has generated one,
//! well before the API server behind it answers. [`ApiReadiness`] checks the
//! API server itself using the credentials from that kubeconfig.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use tracing::debug;

use super::kubeconfig::KubernetesClientConfig;
use super::tls::error_chain;
use super::NodeError;

/// Per-request timeout of the readiness check
const READYZ_TIMEOUT: Duration = Duration::from_secs(5);

/// Decides whether the Kubernetes API behind a kubeconfig is serving
#[async_trait]
pub trait ApiReadiness: Send + Sync {
    /// `Ok` once the API is ready, [`NodeError::DownstreamUnavailable`]
    /// while it isn't
    async fn check(&self, client: &KubernetesClientConfig) -> Result<(), NodeError>;
}

/// Asks the API server's `/readyz` endpoint over mutual TLS
#[derive(Clone, Debug)]
pub struct HttpsReadiness {
    timeout: Duration,
}

impl HttpsReadiness {
    /// Checker with the default request timeout
    pub fn new() -> Self {
        Self {
            timeout: READYZ_TIMEOUT,
        }
    }

    /// Override the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for HttpsReadiness {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApiReadiness for HttpsReadiness {
    async fn check(&self, client: &KubernetesClientConfig) -> Result<(), NodeError> {
        let url = readyz_url(&client.host);
        let http = reqwest::Client::builder()
            .use_preconfigured_tls(tls_config(client)?)
            .timeout(self.timeout)
            .build()
            .map_err(|e| NodeError::Decode(format!("kubernetes client: {}", error_chain(&e))))?;

        let response = http.get(&url).send().await.map_err(|e| {
            NodeError::DownstreamUnavailable(format!("{url}: {}", error_chain(&e)))
        })?;

        let status = response.status();
        debug!(url = %url, status = %status, "Kubernetes API readiness");
        if status.is_success() {
            Ok(())
        } else {
            Err(NodeError::DownstreamUnavailable(format!(
                "{url} answered {status}"
            )))
        }
    }
}

fn readyz_url(host: &str) -> String {
    format!("{}/readyz", host.trim_end_matches('/'))
}

/// Client TLS from the kubeconfig's CA and admin certificate
///
/// The credentials come from the node, so a broken set is reported as an
/// undecodable response.
fn tls_config(client: &KubernetesClientConfig) -> Result<ClientConfig, NodeError> {
    let invalid = |what: &str, e: &dyn std::fmt::Display| {
        NodeError::Decode(format!("kubeconfig {what}: {e}"))
    };

    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(&client.ca_certificate) {
        let cert = cert.map_err(|e| invalid("CA certificate", &e))?;
        roots.add(cert).map_err(|e| invalid("CA certificate", &e))?;
    }
    if roots.is_empty() {
        return Err(NodeError::Decode(
            "kubeconfig CA certificate is empty".to_string(),
        ));
    }

    let certs = CertificateDer::pem_slice_iter(&client.client_certificate)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid("client certificate", &e))?;
    let key = PrivateKeyDer::from_pem_slice(&client.client_key)
        .map_err(|e| invalid("client key", &e))?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| invalid("TLS versions", &e))?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| invalid("client certificate", &e))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}
