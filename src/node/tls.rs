//! TLS client configuration for the node API
//!
//! Builds the rustls client configuration for each [`TlsVerification`] mode and
//! recognizes handshake failures caused by the node rejecting our credentials.

use std::error::Error as StdError;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{
    verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{AlertDescription, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::debug;

use super::{NodeError, TlsVerification};
use crate::secrets::ClientIdentity;

/// Message fragments that mean the peer refused our TLS credentials
///
/// Only consulted when no structured rustls error is available.
const STALE_TLS_MESSAGES: [&str; 2] = [
    "bad certificate",
    "connection closed before server preface received",
];

/// Server certificate verifier that accepts any certificate
///
/// Used for the first connection to a node, which may still be serving a
/// self-signed certificate. Handshake signatures are still checked.
#[derive(Debug)]
pub struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    /// Verifier using `provider`'s signature algorithms
    pub fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        debug!("Accepting node certificate without verification");
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Build the client configuration for `verification`
///
/// Failures here mean the local identity is unusable, so they surface as
/// [`NodeError::Identity`].
pub fn client_config(
    identity: &ClientIdentity,
    verification: TlsVerification,
) -> Result<ClientConfig, NodeError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| NodeError::Identity(format!("unsupported protocol versions: {e}")))?;

    let mut config = match verification {
        TlsVerification::Disabled => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new(&provider)))
            .with_no_client_auth(),
        TlsVerification::Enabled => {
            let roots = root_store(identity)?;
            let (certs, key) = client_auth(identity)?;
            builder
                .with_root_certificates(roots)
                .with_client_auth_cert(certs, key)
                .map_err(|e| NodeError::Identity(format!("client certificate rejected: {e}")))?
        }
    };

    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(config)
}

fn root_store(identity: &ClientIdentity) -> Result<RootCertStore, NodeError> {
    let ca_pem = identity
        .ca_pem()
        .map_err(|e| NodeError::Identity(format!("CA certificate: {e}")))?;

    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(ca_pem.as_bytes()) {
        let cert = cert.map_err(|e| NodeError::Identity(format!("CA certificate: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| NodeError::Identity(format!("CA certificate: {e}")))?;
    }

    if roots.is_empty() {
        return Err(NodeError::Identity("CA certificate bundle is empty".to_string()));
    }
    Ok(roots)
}

fn client_auth(
    identity: &ClientIdentity,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), NodeError> {
    let cert_pem = identity
        .certificate_pem()
        .map_err(|e| NodeError::Identity(format!("client certificate: {e}")))?;
    let key_pem = identity
        .key_pem()
        .map_err(|e| NodeError::Identity(format!("client key: {e}")))?;

    let certs = CertificateDer::pem_slice_iter(cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| NodeError::Identity(format!("client certificate: {e}")))?;
    if certs.is_empty() {
        return Err(NodeError::Identity("client certificate is empty".to_string()));
    }

    let key = PrivateKeyDer::from_pem_slice(key_pem.as_bytes())
        .map_err(|e| NodeError::Identity(format!("client key: {e}")))?;

    Ok((certs, key))
}

/// Whether `err` (or anything in its source chain) is the peer refusing our
/// TLS credentials
///
/// Structured rustls errors are checked first; the rendered chain is matched
/// against known messages only when none is found.
pub fn is_stale_tls_error(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    let mut rendered = Vec::new();

    while let Some(e) = current {
        if let Some(tls) = e.downcast_ref::<rustls::Error>() {
            return is_credential_rejection(tls);
        }
        if let Some(tls) = e
            .downcast_ref::<std::io::Error>()
            .and_then(|io| io.get_ref())
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            return is_credential_rejection(tls);
        }
        rendered.push(e.to_string());
        current = e.source();
    }

    is_stale_tls_message(&rendered.join(": "))
}

/// Message-only fallback for errors that lost their structure
pub fn is_stale_tls_message(message: &str) -> bool {
    let message = message.to_lowercase();
    STALE_TLS_MESSAGES.iter().any(|needle| message.contains(needle))
}

fn is_credential_rejection(err: &rustls::Error) -> bool {
    matches!(
        err,
        rustls::Error::AlertReceived(
            AlertDescription::BadCertificate
                | AlertDescription::UnknownCA
                | AlertDescription::CertificateRequired
        ) | rustls::Error::InvalidCertificate(_)
    )
}

/// Render an error with its source chain
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(e) = current {
        let text = e.to_string();
        if parts.last() != Some(&text) {
            parts.push(text);
        }
        current = e.source();
    }
    parts.join(": ")
}
