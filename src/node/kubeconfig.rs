//! Kubeconfig extraction
//!
//! The node streams the admin kubeconfig as a gzipped tar archive holding a
//! single `kubeconfig` entry.

use std::io::Read;

use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::read::GzDecoder;
use serde::Deserialize;

use crate::{Error, Result};

const KUBECONFIG_ENTRY: &str = "kubeconfig";

/// Connection details for the Kubernetes API, read from a kubeconfig
#[derive(Clone, PartialEq, Eq)]
pub struct KubernetesClientConfig {
    /// API server URL
    pub host: String,
    /// Cluster CA certificate (PEM)
    pub ca_certificate: Vec<u8>,
    /// Client certificate (PEM)
    pub client_certificate: Vec<u8>,
    /// Client key (PEM)
    pub client_key: Vec<u8>,
}

impl std::fmt::Debug for KubernetesClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesClientConfig")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

/// Pull the `kubeconfig` entry out of a gzipped tar archive
pub fn extract_from_archive(archive: &[u8]) -> Result<Vec<u8>> {
    let mut tar = tar::Archive::new(GzDecoder::new(archive));
    let entries = tar
        .entries()
        .map_err(|e| Error::parse("kubeconfig archive", e.to_string()))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| Error::parse("kubeconfig archive", e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| Error::parse("kubeconfig archive", e.to_string()))?;
        if path.file_name().and_then(|n| n.to_str()) != Some(KUBECONFIG_ENTRY) {
            continue;
        }

        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(|e| Error::parse("kubeconfig archive", e.to_string()))?;
        return Ok(contents);
    }

    Err(Error::parse(
        "kubeconfig archive",
        format!("no {KUBECONFIG_ENTRY} entry"),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig {
    #[serde(default)]
    current_context: String,
    #[serde(default)]
    clusters: Vec<Named<ClusterEntry>>,
    #[serde(default)]
    contexts: Vec<Named<ContextEntry>>,
    #[serde(default)]
    users: Vec<Named<UserEntry>>,
}

#[derive(Deserialize)]
struct Named<T> {
    name: String,
    #[serde(alias = "cluster", alias = "context", alias = "user")]
    value: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    #[serde(default)]
    certificate_authority_data: String,
}

#[derive(Deserialize)]
struct ContextEntry {
    cluster: String,
    user: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    #[serde(default)]
    client_certificate_data: String,
    #[serde(default)]
    client_key_data: String,
}

impl KubernetesClientConfig {
    /// Parse the current context of a kubeconfig document
    pub fn from_kubeconfig(raw: &[u8]) -> Result<Self> {
        let invalid = |msg: String| Error::parse("kubeconfig", msg);

        let config: Kubeconfig =
            serde_yaml::from_slice(raw).map_err(|e| invalid(e.to_string()))?;

        let context = config
            .contexts
            .iter()
            .find(|c| c.name == config.current_context)
            .or_else(|| config.contexts.first())
            .ok_or_else(|| invalid("no contexts".to_string()))?;

        let cluster = config
            .clusters
            .iter()
            .find(|c| c.name == context.value.cluster)
            .ok_or_else(|| invalid(format!("cluster {:?} not found", context.value.cluster)))?;
        let user = config
            .users
            .iter()
            .find(|u| u.name == context.value.user)
            .ok_or_else(|| invalid(format!("user {:?} not found", context.value.user)))?;

        let decode = |field: &str, value: &str| {
            STANDARD
                .decode(value.trim())
                .map_err(|e| invalid(format!("{field}: {e}")))
        };

        Ok(Self {
            host: cluster.value.server.clone(),
            ca_certificate: decode(
                "certificate-authority-data",
                &cluster.value.certificate_authority_data,
            )?,
            client_certificate: decode(
                "client-certificate-data",
                &user.value.client_certificate_data,
            )?,
            client_key: decode("client-key-data", &user.value.client_key_data)?,
        })
    }
}
