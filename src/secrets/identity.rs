//! Client identity for the node API

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{decode_pem, pki, SecretsBundle};
use crate::Result;

pub(super) const ADMIN_ORGANIZATION: &str = "os:admin";
pub(super) const ADMIN_COMMON_NAME: &str = "admin";

/// CA certificate plus a client certificate/key, each base64 of the PEM text
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientIdentity {
    /// CA certificate the node's API certificate chains to
    pub ca_certificate: String,
    /// Client certificate
    pub client_certificate: String,
    /// Client private key
    pub client_key: String,
}

impl ClientIdentity {
    /// CA certificate as PEM text
    pub fn ca_pem(&self) -> Result<String> {
        decode_pem(&self.ca_certificate)
    }

    /// Client certificate as PEM text
    pub fn certificate_pem(&self) -> Result<String> {
        decode_pem(&self.client_certificate)
    }

    /// Client key as PKCS#8 PEM text
    pub fn key_pem(&self) -> Result<String> {
        let key = decode_pem(&self.client_key)?;
        Ok(pki::normalize_private_key_pem(&key)?)
    }

    /// Returns true if the client certificate was signed by `bundle`'s OS CA
    pub fn verify_against(&self, bundle: &SecretsBundle) -> Result<bool> {
        let ca = decode_pem(&bundle.certs.os.crt)?;
        Ok(pki::verify_signed_by(&self.certificate_pem()?, &ca)?)
    }

    /// Render a client configuration document for this identity
    pub fn to_talosconfig(
        &self,
        context: &str,
        endpoints: &[String],
        nodes: &[String],
    ) -> Result<String> {
        let config = ClientConfiguration {
            context: context.to_string(),
            contexts: BTreeMap::from([(
                context.to_string(),
                ClientContext {
                    endpoints: endpoints.to_vec(),
                    nodes: nodes.to_vec(),
                    ca: self.ca_certificate.clone(),
                    crt: self.client_certificate.clone(),
                    key: self.client_key.clone(),
                },
            )]),
        };
        Ok(serde_yaml::to_string(&config)?)
    }
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't expose the key in debug output
        f.debug_struct("ClientIdentity")
            .field("ca_certificate", &self.ca_certificate)
            .field("client_certificate", &self.client_certificate)
            .finish_non_exhaustive()
    }
}

/// Client configuration document (talosconfig)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfiguration {
    /// Active context
    pub context: String,
    /// Named contexts
    pub contexts: BTreeMap<String, ClientContext>,
}

/// One client context
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientContext {
    /// Node API endpoints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<String>,
    /// Default target nodes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
    /// CA certificate
    pub ca: String,
    /// Client certificate
    pub crt: String,
    /// Client key
    pub key: String,
}
