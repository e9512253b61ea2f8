//! Certificate authority operations
//!
//! Every cluster role (etcd, Kubernetes, aggregator, OS) gets its own
//! self-signed CA. Client certificates for the node API are signed by the OS CA
//! and only ever leave this module as PEM text.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SignatureAlgorithm,
};
use thiserror::Error;
use ::time::OffsetDateTime;
use x509_parser::prelude::*;

/// Validity of generated CAs and client certificates (10 years)
pub const CERTIFICATE_VALIDITY: ::time::Duration = ::time::Duration::days(3650);

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Random source failed
    #[error("random generation failed: {0}")]
    RandomGenerationFailed(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Key algorithm used for a CA and everything it signs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// ECDSA over P-256 with SHA-256
    EcdsaP256,
    /// Ed25519
    Ed25519,
}

impl KeyAlgorithm {
    fn signature_algorithm(self) -> &'static SignatureAlgorithm {
        match self {
            Self::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            Self::Ed25519 => &rcgen::PKCS_ED25519,
        }
    }
}

/// Generate a PKCS#8 private key and return it as PEM
pub fn generate_private_key_pem(algorithm: KeyAlgorithm) -> Result<String> {
    Ok(generate_key_pair(algorithm)?.serialize_pem())
}

fn generate_key_pair(algorithm: KeyAlgorithm) -> Result<KeyPair> {
    KeyPair::generate_for(algorithm.signature_algorithm())
        .map_err(|e| PkiError::KeyGenerationFailed(format!("{algorithm:?}: {e}")))
}

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Relabel `ED25519 PRIVATE KEY` blocks as plain PKCS#8 `PRIVATE KEY`
///
/// Bundles written by older tooling label Ed25519 PKCS#8 keys with the
/// algorithm name; the DER contents are identical.
pub fn normalize_private_key_pem(key_pem: &str) -> Result<String> {
    let parsed = ::pem::parse(key_pem.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse key PEM: {}", e)))?;
    if parsed.tag() != "ED25519 PRIVATE KEY" {
        return Ok(key_pem.to_string());
    }
    Ok(::pem::encode(&::pem::Pem::new(
        "PRIVATE KEY",
        parsed.contents().to_vec(),
    )))
}

fn distinguished_name(organization: Option<&str>, common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    if let Some(org) = organization {
        dn.push(DnType::OrganizationName, DnValue::Utf8String(org.to_string()));
    }
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn
}

/// Self-signed certificate authority
#[derive(Clone)]
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA valid for ten years from `not_before`
    pub fn generate(
        algorithm: KeyAlgorithm,
        organization: Option<&str>,
        common_name: &str,
        not_before: OffsetDateTime,
    ) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(organization, common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.not_before = not_before;
        params.not_after = not_before + CERTIFICATE_VALIDITY;

        let key_pair = generate_key_pair(algorithm)?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Load a CA from PEM text, validating both halves parse
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key_pem = normalize_private_key_pem(key_pem)?;
        let _ = KeyPair::from_pem(&key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        let _ = parse_pem(cert_pem)?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem,
        })
    }

    /// CA certificate in PEM format
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// CA private key in PEM format
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Issue a client certificate and return `(cert_pem, key_pem)`
    ///
    /// The client key uses the same algorithm as the CA key.
    pub fn issue_client_certificate(
        &self,
        organization: &str,
        common_name: &str,
        not_before: OffsetDateTime,
    ) -> Result<(String, String)> {
        let ca_key = self.load_key_pair()?;
        let algorithm = if ca_key.algorithm() == &rcgen::PKCS_ED25519 {
            KeyAlgorithm::Ed25519
        } else {
            KeyAlgorithm::EcdsaP256
        };

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(Some(organization), common_name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.not_before = not_before;
        params.not_after = not_before + CERTIFICATE_VALIDITY;

        let client_key = generate_key_pair(algorithm)?;

        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&client_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
        })?;

        Ok((cert.pem(), client_key.serialize_pem()))
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't expose the key in debug output
        f.debug_struct("CertificateAuthority").finish_non_exhaustive()
    }
}

/// Subject fields of a certificate, for inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSubject {
    /// Organization, if present
    pub organization: Option<String>,
    /// Common name, if present
    pub common_name: Option<String>,
    /// Start of validity as a unix timestamp
    pub not_before: i64,
}

/// Read the subject and validity of a PEM certificate
pub fn inspect_certificate(cert_pem: &str) -> Result<CertificateSubject> {
    let der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

    let subject = CertificateSubject {
        organization: cert
            .subject()
            .iter_organization()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_string),
        common_name: cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_string),
        not_before: cert.validity().not_before.timestamp(),
    };
    Ok(subject)
}

/// Check that `cert_pem` was signed by the CA in `ca_cert_pem`
pub fn verify_signed_by(cert_pem: &str, ca_cert_pem: &str) -> Result<bool> {
    let cert_der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

    let ca_der = parse_pem(ca_cert_pem)?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

    if cert.issuer().as_raw() != ca_cert.subject().as_raw() {
        return Ok(false);
    }

    Ok(cert.verify_signature(Some(ca_cert.public_key())).is_ok())
}
