//! Cluster secrets bundle
//!
//! A secrets bundle is everything needed to operate and authenticate against a
//! cluster: identity, shared secrets, the trustd token and one CA per role.
//! It is generated once per cluster and treated as an opaque credential set by
//! everything downstream. Certificate material crosses the crate boundary as
//! base64 of the PEM text, never as live key objects.
//!
//! # Encryption secrets
//!
//! `secretboxencryptionsecret` is always generated. Contracts older than v1.3
//! additionally get `aescbcencryptionsecret`, which is how the import path
//! recognizes bundles created for those releases.

mod identity;
mod pki;
mod token;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::contract::VersionContract;
use crate::{Error, Result};

pub use identity::{ClientConfiguration, ClientContext, ClientIdentity};
pub use pki::{
    inspect_certificate, normalize_private_key_pem, verify_signed_by, CertificateAuthority,
    CertificateSubject, KeyAlgorithm, PkiError, CERTIFICATE_VALIDITY,
};
pub use token::{generate_token, is_valid_token};

/// Source of the current time for certificate validity
///
/// Tests pin it with [`FixedClock`] so generated bundles are reproducible in
/// everything but their random material.
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> OffsetDateTime;
}

/// Wall clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock pinned to a single instant
#[derive(Clone, Copy, Debug)]
pub struct FixedClock(pub OffsetDateTime);

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        self.0
    }
}

/// Cluster identity
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterIdentity {
    /// Random cluster ID
    pub id: String,
    /// Shared secret used by cluster discovery
    pub secret: String,
}

/// Shared secrets
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SharedSecrets {
    /// Kubernetes bootstrap token
    #[serde(rename = "bootstraptoken")]
    pub bootstrap_token: String,
    /// Secretbox encryption key for secrets at rest
    #[serde(rename = "secretboxencryptionsecret", default)]
    pub secretbox_encryption_secret: String,
    /// AES-CBC encryption key, only for pre-v1.3 contracts
    #[serde(
        rename = "aescbcencryptionsecret",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub aescbc_encryption_secret: Option<String>,
}

/// trustd join token
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrustdInfo {
    /// Token machines use to join the OS PKI
    pub token: String,
}

/// Certificate and key pair, each base64 of the PEM text
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertificateAndKey {
    /// Certificate
    pub crt: String,
    /// Private key
    pub key: String,
}

/// Private key only, base64 of the PEM text
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyOnly {
    /// Private key
    pub key: String,
}

/// Per-role certificate authorities
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Certificates {
    /// etcd CA
    pub etcd: CertificateAndKey,
    /// Kubernetes CA
    #[serde(rename = "k8s")]
    pub kubernetes: CertificateAndKey,
    /// Kubernetes API aggregation layer CA
    #[serde(rename = "k8saggregator")]
    pub kubernetes_aggregator: CertificateAndKey,
    /// Service account signing key
    #[serde(rename = "k8sserviceaccount")]
    pub kubernetes_service_account: KeyOnly,
    /// Talos API (apid) CA
    pub os: CertificateAndKey,
}

/// Full secrets bundle
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretsBundle {
    /// Cluster identity
    pub cluster: ClusterIdentity,
    /// Shared secrets
    pub secrets: SharedSecrets,
    /// trustd token
    #[serde(rename = "trustdinfo")]
    pub trustd_info: TrustdInfo,
    /// Certificate authorities
    pub certs: Certificates,
}

impl SecretsBundle {
    /// Generate a fresh bundle for `contract` (defaults to the running version)
    pub fn generate(clock: &dyn Clock, contract: Option<&VersionContract>) -> Result<Self> {
        let contract = contract.copied().unwrap_or_else(VersionContract::current);
        let now = clock.now();

        let aescbc_encryption_secret = if contract.secretbox_encryption_supported() {
            None
        } else {
            Some(token::random_secret()?)
        };

        let etcd =
            CertificateAuthority::generate(KeyAlgorithm::EcdsaP256, Some("etcd"), "etcd", now)?;
        let kubernetes = CertificateAuthority::generate(
            KeyAlgorithm::EcdsaP256,
            Some("kubernetes"),
            "kubernetes",
            now,
        )?;
        let aggregator =
            CertificateAuthority::generate(KeyAlgorithm::EcdsaP256, None, "front-proxy", now)?;
        let service_account = pki::generate_private_key_pem(KeyAlgorithm::EcdsaP256)?;
        let os =
            CertificateAuthority::generate(KeyAlgorithm::Ed25519, Some("talos"), "talos", now)?;

        let bundle = Self {
            cluster: ClusterIdentity {
                id: token::random_secret()?,
                secret: token::random_secret()?,
            },
            secrets: SharedSecrets {
                bootstrap_token: token::generate_token()?,
                secretbox_encryption_secret: token::random_secret()?,
                aescbc_encryption_secret,
            },
            trustd_info: TrustdInfo {
                token: token::generate_token()?,
            },
            certs: Certificates {
                etcd: encode_ca(&etcd),
                kubernetes: encode_ca(&kubernetes),
                kubernetes_aggregator: encode_ca(&aggregator),
                kubernetes_service_account: KeyOnly {
                    key: STANDARD.encode(service_account),
                },
                os: encode_ca(&os),
            },
        };

        info!(
            contract = %contract,
            aescbc = bundle.secrets.aescbc_encryption_secret.is_some(),
            "Generated secrets bundle"
        );

        Ok(bundle)
    }

    /// Reconstruct a bundle from a previously serialized document
    ///
    /// Decoding is lenient: fields this crate doesn't know are ignored. The
    /// returned contract is a best-effort guess used only for defaults: bundles
    /// that carry an aescbc secret were generated for a pre-v1.3 contract.
    pub fn import_legacy(raw: &[u8]) -> Result<(Self, Option<VersionContract>)> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| Error::parse("secrets bundle", format!("not valid UTF-8: {e}")))?;
        let bundle: Self = serde_yaml::from_str(text)
            .map_err(|e| Error::parse("secrets bundle", e.to_string()))?;

        bundle.validate()?;

        let inferred = bundle
            .secrets
            .aescbc_encryption_secret
            .as_ref()
            .filter(|s| !s.is_empty())
            .map(|_| VersionContract::V1_2);

        debug!(inferred_contract = ?inferred, "Imported secrets bundle");

        Ok((bundle, inferred))
    }

    /// Serialize in the same format [`SecretsBundle::import_legacy`] reads
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check every field is populated and certificate material decodes
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Error::parse("secrets bundle", msg);

        for (name, value) in [
            ("cluster.id", &self.cluster.id),
            ("cluster.secret", &self.cluster.secret),
            ("secrets.bootstraptoken", &self.secrets.bootstrap_token),
            ("trustdinfo.token", &self.trustd_info.token),
        ] {
            if value.is_empty() {
                return Err(invalid(format!("{name} is empty")));
            }
        }

        let has_aescbc = self
            .secrets
            .aescbc_encryption_secret
            .as_ref()
            .is_some_and(|s| !s.is_empty());
        if self.secrets.secretbox_encryption_secret.is_empty() && !has_aescbc {
            return Err(invalid(
                "neither secretboxencryptionsecret nor aescbcencryptionsecret is set".to_string(),
            ));
        }

        for (name, pair) in [
            ("certs.etcd", &self.certs.etcd),
            ("certs.k8s", &self.certs.kubernetes),
            ("certs.k8saggregator", &self.certs.kubernetes_aggregator),
            ("certs.os", &self.certs.os),
        ] {
            decode_pem(&pair.crt).map_err(|e| invalid(format!("{name}.crt: {e}")))?;
            decode_pem(&pair.key).map_err(|e| invalid(format!("{name}.key: {e}")))?;
        }
        decode_pem(&self.certs.kubernetes_service_account.key)
            .map_err(|e| invalid(format!("certs.k8sserviceaccount.key: {e}")))?;

        Ok(())
    }

    /// OS certificate authority, loaded for signing
    pub fn os_ca(&self) -> Result<CertificateAuthority> {
        let cert = decode_pem(&self.certs.os.crt)?;
        let key = decode_pem(&self.certs.os.key)?;
        Ok(CertificateAuthority::from_pem(&cert, &key)?)
    }

    /// Derive an admin client identity signed by the bundle's OS CA
    ///
    /// Each call signs a new certificate, so the bytes differ between calls,
    /// but every identity chains to the same CA and authenticates against the
    /// same nodes.
    pub fn client_identity(&self, clock: &dyn Clock) -> Result<ClientIdentity> {
        let ca = self.os_ca()?;
        let (cert_pem, key_pem) = ca.issue_client_certificate(
            identity::ADMIN_ORGANIZATION,
            identity::ADMIN_COMMON_NAME,
            clock.now(),
        )?;

        Ok(ClientIdentity {
            ca_certificate: self.certs.os.crt.clone(),
            client_certificate: STANDARD.encode(cert_pem),
            client_key: STANDARD.encode(key_pem),
        })
    }
}

fn encode_ca(ca: &CertificateAuthority) -> CertificateAndKey {
    CertificateAndKey {
        crt: STANDARD.encode(ca.cert_pem()),
        key: STANDARD.encode(ca.key_pem()),
    }
}

/// Decode base64 PEM text, checking it really is PEM
pub fn decode_pem(encoded: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::parse("certificate material", format!("invalid base64: {e}")))?;
    let text = String::from_utf8(bytes)
        .map_err(|e| Error::parse("certificate material", format!("not UTF-8: {e}")))?;
    pki::parse_pem(&text)
        .map_err(|e| Error::parse("certificate material", e.to_string()))?;
    Ok(text)
}
