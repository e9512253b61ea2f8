//! Node API access
//!
//! The [`NodeConnector`] / [`NodeClient`] traits are the seam between the
//! executor and the wire. [`GrpcConnector`] talks to the real node API over
//! gRPC with mutual TLS; tests substitute fakes.
//!
//! # TLS modes
//!
//! A node that hasn't been configured yet serves a self-signed certificate and
//! doesn't ask for a client certificate, so the first connection is made with
//! [`TlsVerification::Disabled`]. A configured node rejects that connection
//! with a certificate alert; the executor then reconnects with
//! [`TlsVerification::Enabled`], presenting the client identity and checking
//! the node against the cluster CA.

mod grpc;
pub mod kubeconfig;
pub mod proto;
pub mod readiness;
pub mod tls;

use async_trait::async_trait;
use thiserror::Error;

use crate::disk::DiskRecord;
use crate::secrets::ClientIdentity;
use crate::{Error, Result, DEFAULT_APID_PORT};

pub use grpc::GrpcConnector;
#[cfg(test)]
pub(crate) use grpc::status_error;
pub use kubeconfig::KubernetesClientConfig;
pub use readiness::{ApiReadiness, HttpsReadiness};

/// Errors returned by a node connection
#[derive(Debug, Error)]
pub enum NodeError {
    /// Connection, handshake or stream failure
    #[error("transport error: {message}")]
    Transport {
        /// Error text, including its source chain
        message: String,
        /// The peer rejected our TLS credentials
        stale_tls: bool,
    },

    /// The node answered with an error status
    #[error("node returned {code:?}: {message}")]
    Rpc {
        /// gRPC status code
        code: tonic::Code,
        /// Status message
        message: String,
    },

    /// Nothing in a fetched result matched what was asked for
    #[error("not found: {0}")]
    NotFound(String),

    /// A service the operation depends on isn't ready yet
    #[error("downstream service unavailable: {0}")]
    DownstreamUnavailable(String),

    /// The local client identity can't be used
    #[error("invalid client identity: {0}")]
    Identity(String),

    /// The node sent something we couldn't decode
    #[error("invalid response: {0}")]
    Decode(String),
}

impl NodeError {
    /// Transport failure that isn't a TLS credential rejection
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            stale_tls: false,
        }
    }

    /// Transport failure caused by the peer rejecting our TLS credentials
    pub fn stale_tls(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            stale_tls: true,
        }
    }

    /// Whether a reconnect with verification enabled may succeed
    pub fn is_stale_tls(&self) -> bool {
        match self {
            Self::Transport { stale_tls, message } => {
                *stale_tls || tls::is_stale_tls_message(message)
            }
            _ => false,
        }
    }
}

/// Whether the client checks the node's certificate and presents its own
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsVerification {
    /// Accept any server certificate, present no client certificate
    Disabled,
    /// Mutual TLS against the cluster CA
    Enabled,
}

/// Where to send a request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeTarget {
    /// Node API endpoint, `host` or `host:port`
    pub endpoint: String,
    /// Node the endpoint should proxy the request to
    pub node: Option<String>,
}

impl NodeTarget {
    /// Target `endpoint` directly
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            node: None,
        }
    }

    /// Proxy through the endpoint to `node`
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Host and port, defaulting to the node API port
    pub fn host_port(&self) -> Result<(String, u16)> {
        let endpoint = self.endpoint.trim();
        let endpoint = endpoint
            .split_once("://")
            .map_or(endpoint, |(_, rest)| rest)
            .trim_end_matches('/');
        if endpoint.is_empty() {
            return Err(Error::validation("node endpoint must not be empty"));
        }

        let invalid_port = |port: &str| {
            Error::validation(format!("invalid port {port:?} in endpoint {endpoint:?}"))
        };

        // [v6]:port or [v6]
        if let Some(rest) = endpoint.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| Error::validation(format!("invalid endpoint {endpoint:?}")))?;
            let port = match after.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid_port(port))?,
                None if after.is_empty() => DEFAULT_APID_PORT,
                None => return Err(Error::validation(format!("invalid endpoint {endpoint:?}"))),
            };
            return Ok((host.to_string(), port));
        }

        // Bare IPv6 address without a port
        if endpoint.matches(':').count() > 1 {
            return Ok((endpoint.to_string(), DEFAULT_APID_PORT));
        }

        match endpoint.split_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| invalid_port(port))?;
                Ok((host.to_string(), port))
            }
            None => Ok((endpoint.to_string(), DEFAULT_APID_PORT)),
        }
    }
}

impl std::fmt::Display for NodeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.node {
            Some(node) => write!(f, "{} (node {node})", self.endpoint),
            None => write!(f, "{}", self.endpoint),
        }
    }
}

/// How a configuration is applied
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ApplyMode {
    /// Let the node decide whether a reboot is needed
    #[default]
    Auto,
    /// Apply and reboot
    Reboot,
    /// Apply without a reboot; fails if one would be required
    NoReboot,
    /// Stage for the next reboot
    Staged,
    /// Apply temporarily and roll back unless confirmed
    Try,
}

impl std::str::FromStr for ApplyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "reboot" => Ok(Self::Reboot),
            "no-reboot" => Ok(Self::NoReboot),
            "staged" => Ok(Self::Staged),
            "try" => Ok(Self::Try),
            _ => Err(Error::validation(format!(
                "invalid apply mode: {s}, expected one of: auto, reboot, no-reboot, staged, try"
            ))),
        }
    }
}

impl std::fmt::Display for ApplyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Auto => "auto",
            Self::Reboot => "reboot",
            Self::NoReboot => "no-reboot",
            Self::Staged => "staged",
            Self::Try => "try",
        };
        f.write_str(name)
    }
}

/// What the node reported after applying a configuration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Mode the node actually used
    pub mode: ApplyMode,
    /// Human readable description of what happened
    pub mode_details: String,
    /// Non-fatal problems with the configuration
    pub warnings: Vec<String>,
}

/// Opens connections to a node
#[async_trait]
pub trait NodeConnector: Send + Sync {
    /// Connect to `target` in the given TLS mode
    async fn connect(
        &self,
        target: &NodeTarget,
        identity: &ClientIdentity,
        verification: TlsVerification,
    ) -> std::result::Result<Box<dyn NodeClient>, NodeError>;
}

/// An open connection to a node
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Disk inventory
    async fn disks(&self) -> std::result::Result<Vec<DiskRecord>, NodeError>;

    /// Bootstrap etcd on this node
    async fn bootstrap(&self) -> std::result::Result<(), NodeError>;

    /// Raw kubeconfig archive (gzipped tar)
    async fn kubeconfig(&self) -> std::result::Result<Vec<u8>, NodeError>;

    /// Push a machine configuration
    async fn apply_configuration(
        &self,
        data: &[u8],
        mode: ApplyMode,
        dry_run: bool,
    ) -> std::result::Result<ApplyOutcome, NodeError>;

    /// Release the connection
    async fn close(self: Box<Self>);
}
