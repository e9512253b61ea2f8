//! talos-provisioner - secrets, machine configuration and node operations for Talos clusters
//!
//! The crate covers two coupled subsystems:
//!
//! - a configuration generation engine that derives a versioned secrets bundle,
//!   resolves the target version contract, merges user patches onto a generated
//!   machine configuration and renders it deterministically;
//! - a resilient remote operation executor that connects to nodes over mTLS gRPC,
//!   falls back to verified TLS when a first-contact handshake is stale, and
//!   retries transient failures until a deadline.
//!
//! # Modules
//!
//! - [`contract`] - Version contract parsing and feature gates
//! - [`secrets`] - Secrets bundle generation, client identity, legacy import
//! - [`patch`] - Strategic merge and JSON-6902 patch loading/application
//! - [`config`] - Machine configuration compiler and annotated encoder
//! - [`disk`] - Disk inventory filters
//! - [`node`] - Node transport (gRPC client, TLS, wire messages)
//! - [`retry`] - Backoff and deadline handling
//! - [`executor`] - Connect/probe/execute state machine with retries
//! - [`operations`] - Bootstrap, inventory, kubeconfig and apply calls
//! - [`error`] - Error types

pub mod config;
pub mod contract;
pub mod disk;
pub mod error;
pub mod executor;
pub mod node;
pub mod operations;
pub mod patch;
pub mod retry;
pub mod secrets;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Talos version this build targets when the caller does not pick one
pub const DEFAULT_TALOS_VERSION: &str = "v1.8.3";

/// Kubernetes version generated configurations use when none is requested
pub const DEFAULT_KUBERNETES_VERSION: &str = "1.31.2";

/// Port suggested for cluster endpoints that omit one
pub const DEFAULT_KUBERNETES_API_PORT: u16 = 6443;

/// Port of the node API (apid)
pub const DEFAULT_APID_PORT: u16 = 50000;

/// Default Kubernetes DNS domain
pub const DEFAULT_DNS_DOMAIN: &str = "cluster.local";

/// Default install disk
pub const DEFAULT_INSTALL_DISK: &str = "/dev/sda";

/// Registry path of the installer image (tagged with the Talos version)
pub const INSTALLER_IMAGE: &str = "ghcr.io/siderolabs/installer";

/// Timeout applied to node operations when the caller does not set one
pub const DEFAULT_OPERATION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10 * 60);
