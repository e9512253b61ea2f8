//! Error types for talos-provisioner
//!
//! Errors carry enough context for the caller to act on them: a corrected
//! endpoint, the list of offending patch keys, the incompatible version pair,
//! or the last transport failure seen before a deadline expired.

use std::time::Duration;

use thiserror::Error;

use crate::node::NodeError;
use crate::secrets::PkiError;

/// Main error type for provisioning operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Request failed validation before any work was attempted
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid, including a suggested fix when one exists
        message: String,
    },

    /// Input could not be parsed
    #[error("failed to parse {what}: {message}")]
    Parse {
        /// What was being parsed (e.g. "version", "patch #2")
        what: String,
        /// Underlying parser message
        message: String,
    },

    /// Connection, handshake or transport failure talking to a node
    #[error("transport error: {message}")]
    Transport {
        /// Description of the failure
        message: String,
    },

    /// The node explicitly rejected the request as invalid
    #[error("node rejected {operation}: {message}")]
    NodeRejected {
        /// Operation that was rejected
        operation: String,
        /// Message returned by the node
        message: String,
    },

    /// No inventory record matched the request
    #[error("not found: {message}")]
    NotFound {
        /// What was being looked up
        message: String,
    },

    /// The operation kept failing until its deadline elapsed
    #[error("{operation} did not succeed within {timeout:?}: {last_error}")]
    DeadlineExceeded {
        /// Operation that timed out
        operation: String,
        /// Configured timeout
        timeout: Duration,
        /// Last error observed before the deadline
        last_error: String,
    },

    /// The caller cancelled the operation
    #[error("{operation} was cancelled")]
    Cancelled {
        /// Operation that was cancelled
        operation: String,
    },

    /// Key or certificate generation failed
    #[error("pki error: {source}")]
    Pki {
        /// The underlying PKI error
        #[from]
        source: PkiError,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Filesystem error
    #[error("io error: {source}")]
    Io {
        /// The underlying IO error
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a parse error for the named input
    pub fn parse(what: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Parse {
            what: what.into(),
            message: msg.into(),
        }
    }

    /// Create a transport error with the given message
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
        }
    }

    /// Create a not-found error with the given message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Map a terminal node error for `operation` into the crate error
    pub fn from_node(operation: &str, err: NodeError) -> Self {
        match err {
            NodeError::Rpc { code, message } if code == tonic::Code::InvalidArgument => {
                Self::NodeRejected {
                    operation: operation.to_string(),
                    message,
                }
            }
            NodeError::NotFound(message) => Self::NotFound { message },
            other => Self::Transport {
                message: format!("{operation}: {other}"),
            },
        }
    }

    /// Returns true for errors raised before any remote work happened
    pub fn is_user_error(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::Parse { .. })
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_keeps_suggestion() {
        let err = Error::validation(
            "cluster endpoint \"cluster.local\" is invalid, try \"https://cluster.local:6443\"",
        );
        let msg = err.to_string();
        assert!(msg.starts_with("validation error:"));
        assert!(msg.contains("https://cluster.local:6443"));
        assert!(err.is_user_error());
    }

    #[test]
    fn deadline_error_wraps_last_cause() {
        let err = Error::DeadlineExceeded {
            operation: "kubeconfig".to_string(),
            timeout: Duration::from_secs(600),
            last_error: "kubernetes API is not ready".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("kubeconfig"));
        assert!(msg.contains("600s"));
        assert!(msg.contains("kubernetes API is not ready"));
        assert!(!err.is_user_error());
    }

    #[test]
    fn invalid_argument_maps_to_node_rejected() {
        let err = Error::from_node(
            "apply configuration",
            NodeError::Rpc {
                code: tonic::Code::InvalidArgument,
                message: "unknown keys found during decoding".to_string(),
            },
        );
        assert!(matches!(err, Error::NodeRejected { .. }));
        assert!(err.to_string().contains("unknown keys"));
    }

    #[test]
    fn not_found_sentinel_is_distinct_from_transport() {
        let err = Error::from_node("disks", NodeError::NotFound("no disk matched".into()));
        assert!(matches!(err, Error::NotFound { .. }));

        let err = Error::from_node("disks", NodeError::transport("connection refused"));
        assert!(matches!(err, Error::Transport { .. }));
    }
}
