//! Node operations
//!
//! Each public function wraps one node API call in a [`NodeOperation`] and
//! runs it through the [`Executor`], so every call gets the same connection
//! fallback, retry policy and deadline.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{encode, parse_document, EncoderOptions};
use crate::disk::{select_all, select_first, DiskFilter, DiskRecord};
use crate::executor::{ExecuteOptions, Executor, NodeOperation};
use crate::node::kubeconfig::{extract_from_archive, KubernetesClientConfig};
use crate::node::{ApiReadiness, ApplyMode, ApplyOutcome, NodeClient, NodeError, NodeTarget};
use crate::patch::{self, PatchMode, PatchSource};
use crate::secrets::ClientIdentity;
use crate::{Error, Result};

/// Which matches [`find_disks`] returns
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DiskSelection {
    /// The first match in inventory order; none is a not-found error
    #[default]
    FirstMatch,
    /// Every match, possibly none
    AllMatches,
}

/// Admin credentials for the cluster's Kubernetes API
#[derive(Clone, Debug)]
pub struct ClusterCredentials {
    /// Kubeconfig document as served by the node
    pub kubeconfig: Vec<u8>,
    /// Connection details parsed from the kubeconfig
    pub client: KubernetesClientConfig,
}

/// Options for [`apply_configuration`]
#[derive(Clone, Debug, Default)]
pub struct ApplyConfigurationOptions {
    /// How the node should apply the configuration
    pub mode: ApplyMode,
    /// Validate on the node without applying
    pub dry_run: bool,
    /// Patches applied, strictly, before the document is sent; without any
    /// the document is sent exactly as given
    pub patches: Vec<PatchSource>,
}

struct Bootstrap;

#[async_trait]
impl NodeOperation for Bootstrap {
    type Output = ();

    fn name(&self) -> &str {
        "bootstrap"
    }

    async fn run(&self, client: &dyn NodeClient) -> std::result::Result<(), NodeError> {
        client.bootstrap().await
    }
}

struct FindDisks<'a> {
    filter: &'a DiskFilter,
    selection: DiskSelection,
}

#[async_trait]
impl NodeOperation for FindDisks<'_> {
    type Output = Vec<DiskRecord>;

    fn name(&self) -> &str {
        "disks"
    }

    async fn run(&self, client: &dyn NodeClient) -> std::result::Result<Vec<DiskRecord>, NodeError> {
        let disks = client.disks().await?;

        match self.selection {
            DiskSelection::FirstMatch => select_first(&disks, self.filter)
                .map(|disk| vec![disk.clone()])
                .map_err(|e| NodeError::NotFound(e.to_string())),
            DiskSelection::AllMatches => Ok(select_all(&disks, self.filter)
                .into_iter()
                .cloned()
                .collect()),
        }
    }
}

struct Kubeconfig<'a> {
    readiness: Option<&'a dyn ApiReadiness>,
}

#[async_trait]
impl NodeOperation for Kubeconfig<'_> {
    type Output = Vec<u8>;

    fn name(&self) -> &str {
        "kubeconfig"
    }

    async fn run(&self, client: &dyn NodeClient) -> std::result::Result<Vec<u8>, NodeError> {
        let archive = client.kubeconfig().await?;

        if let Some(readiness) = self.readiness {
            // A malformed archive is reported once the call returns.
            match credentials_from_archive(&archive) {
                Ok(credentials) => readiness.check(&credentials.client).await?,
                Err(e) => debug!(error = %e, "Skipping readiness check"),
            }
        }
        Ok(archive)
    }
}

fn credentials_from_archive(archive: &[u8]) -> Result<ClusterCredentials> {
    let kubeconfig = extract_from_archive(archive)?;
    let client = KubernetesClientConfig::from_kubeconfig(&kubeconfig)?;
    Ok(ClusterCredentials { kubeconfig, client })
}

struct ApplyConfiguration {
    data: Vec<u8>,
    mode: ApplyMode,
    dry_run: bool,
}

#[async_trait]
impl NodeOperation for ApplyConfiguration {
    type Output = ApplyOutcome;

    fn name(&self) -> &str {
        "apply configuration"
    }

    async fn run(&self, client: &dyn NodeClient) -> std::result::Result<ApplyOutcome, NodeError> {
        client
            .apply_configuration(&self.data, self.mode, self.dry_run)
            .await
    }
}

/// Bootstrap etcd on the target node
pub async fn bootstrap(
    executor: &Executor,
    target: &NodeTarget,
    identity: &ClientIdentity,
    options: &ExecuteOptions,
) -> Result<()> {
    executor.execute(target, identity, &Bootstrap, options).await
}

/// Full disk inventory of the target node
pub async fn read_inventory(
    executor: &Executor,
    target: &NodeTarget,
    identity: &ClientIdentity,
    options: &ExecuteOptions,
) -> Result<Vec<DiskRecord>> {
    find_disks(
        executor,
        target,
        identity,
        &DiskFilter::default(),
        DiskSelection::AllMatches,
        options,
    )
    .await
}

/// Disks of the target node matching `filter`
///
/// With [`DiskSelection::FirstMatch`] an inventory with no match fails with
/// [`Error::NotFound`] without retrying.
pub async fn find_disks(
    executor: &Executor,
    target: &NodeTarget,
    identity: &ClientIdentity,
    filter: &DiskFilter,
    selection: DiskSelection,
    options: &ExecuteOptions,
) -> Result<Vec<DiskRecord>> {
    let operation = FindDisks { filter, selection };
    executor.execute(target, identity, &operation, options).await
}

/// Admin kubeconfig of the cluster the target node belongs to
///
/// With `wait`, the kubeconfig is only returned once `wait` reports the
/// Kubernetes API behind it as ready; until then the call is retried up to
/// the deadline.
pub async fn retrieve_cluster_credentials(
    executor: &Executor,
    target: &NodeTarget,
    identity: &ClientIdentity,
    wait: Option<&dyn ApiReadiness>,
    options: &ExecuteOptions,
) -> Result<ClusterCredentials> {
    let operation = Kubeconfig { readiness: wait };
    let archive = executor.execute(target, identity, &operation, options).await?;

    let credentials = credentials_from_archive(&archive)?;
    info!(host = %credentials.client.host, "Retrieved cluster credentials");
    Ok(credentials)
}

/// Push a machine configuration document to the target node
///
/// Without patches the document is only checked to be YAML mappings and is
/// sent byte for byte. With patches it is parsed, patched strictly and
/// re-rendered. Either way local problems fail before a connection is made.
pub async fn apply_configuration(
    executor: &Executor,
    target: &NodeTarget,
    identity: &ClientIdentity,
    document: &str,
    apply: &ApplyConfigurationOptions,
    options: &ExecuteOptions,
) -> Result<ApplyOutcome> {
    let data = if apply.patches.is_empty() {
        check_mappings(document)?;
        document.as_bytes().to_vec()
    } else {
        let config = parse_document(document)?;
        let patches = patch::load_patches(&apply.patches)?;
        let config = patch::apply(&config, &patches, PatchMode::Strict)?;
        encode(&config, EncoderOptions::plain())?.into_bytes()
    };

    let operation = ApplyConfiguration {
        data,
        mode: apply.mode,
        dry_run: apply.dry_run,
    };
    let outcome = executor.execute(target, identity, &operation, options).await?;

    for warning in &outcome.warnings {
        warn!(endpoint = %target, warning = %warning, "Configuration applied with warning");
    }
    info!(
        endpoint = %target,
        mode = %outcome.mode,
        dry_run = apply.dry_run,
        details = %outcome.mode_details,
        "Configuration applied"
    );
    Ok(outcome)
}

/// Every document in a (possibly multi-document) YAML stream is a mapping
fn check_mappings(document: &str) -> Result<()> {
    let invalid = |msg: String| Error::parse("machine configuration", msg);

    let mut documents = 0;
    for (index, doc) in serde_yaml::Deserializer::from_str(document).enumerate() {
        let value = serde_yaml::Value::deserialize(doc).map_err(|e| invalid(e.to_string()))?;
        match value {
            serde_yaml::Value::Mapping(_) => documents += 1,
            serde_yaml::Value::Null => {}
            _ => return Err(invalid(format!("document {} is not a mapping", index + 1))),
        }
    }

    if documents == 0 {
        return Err(invalid("document is empty".to_string()));
    }
    Ok(())
}
