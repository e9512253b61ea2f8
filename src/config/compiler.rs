//! Machine configuration compiler
//!
//! Turns a [`MachineConfigGenerationRequest`] into a rendered document.
//!
//! # Pipeline
//!
//! 1. Validate the control plane endpoint (`https`, explicit port)
//! 2. Resolve the version contract
//! 3. Check the Kubernetes version against the contract, before any generation
//! 4. Build the base document for the machine type
//! 5. Apply request patches in strict mode
//! 6. Encode with the requested annotations

use tracing::{debug, info};

use super::encoder::{self, EncoderOptions};
use super::endpoint::validate_endpoint;
use super::generate::{self, GenerationOptions};
use super::types::{MachineConfig, MachineType, CONFIG_VERSION};
use crate::contract::{check_kubernetes_compatibility, parse_kubernetes_version, VersionContract};
use crate::patch::{self, PatchMode, PatchSource};
use crate::secrets::SecretsBundle;
use crate::{
    Error, Result, DEFAULT_DNS_DOMAIN, DEFAULT_INSTALL_DISK, DEFAULT_KUBERNETES_VERSION,
    DEFAULT_TALOS_VERSION, INSTALLER_IMAGE,
};

/// Values the compiler falls back to when a request leaves them unset
///
/// Carries the running system's own version explicitly so nothing reads it
/// from global state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationDefaults {
    /// Talos version used when the request names none
    pub talos_version: String,
    /// Kubernetes version used when the request names none
    pub kubernetes_version: String,
    /// Kubernetes DNS domain
    pub dns_domain: String,
    /// Install disk
    pub install_disk: String,
    /// Installer image repository, tagged with the Talos version
    pub installer_image: String,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            talos_version: DEFAULT_TALOS_VERSION.to_string(),
            kubernetes_version: DEFAULT_KUBERNETES_VERSION.to_string(),
            dns_domain: DEFAULT_DNS_DOMAIN.to_string(),
            install_disk: DEFAULT_INSTALL_DISK.to_string(),
            installer_image: INSTALLER_IMAGE.to_string(),
        }
    }
}

/// Everything needed to produce one machine configuration
#[derive(Clone, Debug)]
pub struct MachineConfigGenerationRequest {
    /// Machine role
    pub machine_type: MachineType,
    /// Cluster name
    pub cluster_name: String,
    /// Control plane endpoint, `https://<host>:<port>`
    pub endpoint: String,
    /// Cluster secrets
    pub secrets: SecretsBundle,
    /// Patches applied in order after base generation
    pub patches: Vec<PatchSource>,
    /// Kubernetes version (defaults to [`GenerationDefaults::kubernetes_version`])
    pub kubernetes_version: Option<String>,
    /// Talos version the configuration targets
    pub talos_version: Option<String>,
    /// Emit field documentation
    pub docs: bool,
    /// Emit commented examples
    pub examples: bool,
    /// Install disk override
    pub install_disk: Option<String>,
    /// Installer image override
    pub install_image: Option<String>,
    /// Extra API server certificate SANs
    pub additional_sans: Vec<String>,
}

impl MachineConfigGenerationRequest {
    /// Request with every optional field unset
    pub fn new(
        machine_type: MachineType,
        cluster_name: impl Into<String>,
        endpoint: impl Into<String>,
        secrets: SecretsBundle,
    ) -> Self {
        Self {
            machine_type,
            cluster_name: cluster_name.into(),
            endpoint: endpoint.into(),
            secrets,
            patches: Vec::new(),
            kubernetes_version: None,
            talos_version: None,
            docs: false,
            examples: false,
            install_disk: None,
            install_image: None,
            additional_sans: Vec::new(),
        }
    }
}

/// Compiled machine configuration
#[derive(Clone, Debug)]
pub struct CompiledConfig {
    /// Typed document after patches
    pub config: MachineConfig,
    /// Encoded YAML
    pub rendered: String,
    /// Contract the document was generated for
    pub contract: VersionContract,
}

/// Compile a machine configuration
pub fn compile(
    request: &MachineConfigGenerationRequest,
    defaults: &GenerationDefaults,
) -> Result<CompiledConfig> {
    if request.cluster_name.trim().is_empty() {
        return Err(Error::validation("cluster name must not be empty"));
    }

    let endpoint = validate_endpoint(&request.endpoint)?;

    let talos_version = request
        .talos_version
        .as_deref()
        .unwrap_or(&defaults.talos_version);
    let contract = VersionContract::parse(talos_version)?;

    let kubernetes = parse_kubernetes_version(
        request
            .kubernetes_version
            .as_deref()
            .unwrap_or(&defaults.kubernetes_version),
    )?;
    check_kubernetes_compatibility(&kubernetes, &contract)?;

    let options = GenerationOptions {
        contract,
        kubernetes_version: kubernetes.to_string(),
        cluster_name: request.cluster_name.clone(),
        endpoint: request.endpoint.trim().to_string(),
        dns_domain: defaults.dns_domain.clone(),
        install_disk: request
            .install_disk
            .clone()
            .unwrap_or_else(|| defaults.install_disk.clone()),
        install_image: request
            .install_image
            .clone()
            .unwrap_or_else(|| installer_image(&defaults.installer_image, talos_version)),
        persist: true,
        discovery_enabled: true,
        additional_sans: request.additional_sans.clone(),
    };

    debug!(
        machine_type = %request.machine_type,
        contract = %contract,
        kubernetes = %kubernetes,
        endpoint = %endpoint,
        "Generating base machine configuration"
    );

    let base = generate::build(request.machine_type, &options, &request.secrets);

    let patches = patch::load_patches(&request.patches)?;
    let config = patch::apply(&base, &patches, PatchMode::Strict)?;
    if config.version != CONFIG_VERSION {
        return Err(Error::validation(format!(
            "unsupported config version {:?}, only {CONFIG_VERSION} is supported",
            config.version
        )));
    }

    let rendered = encoder::encode(
        &config,
        EncoderOptions {
            docs: request.docs,
            examples: request.examples,
        },
    )?;

    info!(
        machine_type = %request.machine_type,
        cluster = %request.cluster_name,
        patches = patches.len(),
        "Compiled machine configuration"
    );

    Ok(CompiledConfig {
        config,
        rendered,
        contract,
    })
}

/// Installer image tagged with the Talos version, `v` prefixed
fn installer_image(repository: &str, talos_version: &str) -> String {
    let version = talos_version.trim();
    if version.starts_with('v') {
        format!("{repository}:{version}")
    } else {
        format!("{repository}:v{version}")
    }
}
