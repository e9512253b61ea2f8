//! Machine configuration schema (`v1alpha1`)
//!
//! These types are the schema patches are validated against: any key a patch
//! introduces that doesn't round-trip through them is unknown.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Declared schema version of every generated document
pub const CONFIG_VERSION: &str = "v1alpha1";

/// Role of a machine in the cluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MachineType {
    /// Runs etcd and the Kubernetes control plane
    #[default]
    Controlplane,
    /// Runs workloads only
    Worker,
}

impl std::str::FromStr for MachineType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "controlplane" | "control-plane" => Ok(Self::Controlplane),
            "worker" => Ok(Self::Worker),
            _ => Err(crate::Error::validation(format!(
                "invalid machine type: {s}, expected one of: controlplane, worker"
            ))),
        }
    }
}

impl std::fmt::Display for MachineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Controlplane => write!(f, "controlplane"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Root of the machine configuration document
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct MachineConfig {
    /// Schema version, always [`CONFIG_VERSION`]
    pub version: String,
    /// Enable verbose logging to the console
    pub debug: bool,
    /// Persist the configuration to disk
    pub persist: bool,
    /// Machine-specific configuration
    pub machine: MachineSection,
    /// Cluster-wide configuration
    pub cluster: ClusterSection,
}

/// PEM certificate and key, base64 encoded
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct CertificateAndKey {
    /// Certificate
    pub crt: String,
    /// Private key (empty on machines that must not hold it)
    pub key: String,
}

/// Private key only
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct KeyOnly {
    /// Private key
    pub key: String,
}

// =============================================================================
// machine
// =============================================================================

/// `machine` section
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineSection {
    /// Machine role
    #[serde(rename = "type")]
    pub machine_type: MachineType,
    /// Token used to join the OS PKI
    pub token: String,
    /// OS certificate authority
    pub ca: CertificateAndKey,
    /// Extra SANs for the machine's API certificate
    #[serde(default)]
    pub cert_sans: Vec<String>,
    /// Kubelet settings
    pub kubelet: KubeletConfig,
    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,
    /// Install settings
    pub install: InstallConfig,
    /// Registry mirrors and auth
    #[serde(default)]
    pub registries: RegistriesConfig,
    /// Feature flags
    #[serde(default)]
    pub features: FeaturesConfig,
    /// Labels applied to the Kubernetes node
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_labels: BTreeMap<String, String>,
    /// Kernel parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sysctls: BTreeMap<String, String>,
    /// Environment variables for system services
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// `machine.kubelet`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeletConfig {
    /// Kubelet image
    pub image: String,
    /// Run containers with the runtime default seccomp profile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_runtime_seccomp_profile_enabled: Option<bool>,
    /// Disable the static pod manifests directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_manifests_directory: Option<bool>,
    /// Extra kubelet flags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_args: BTreeMap<String, String>,
    /// Subnets to pick the node IP from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ip: Option<KubeletNodeIp>,
}

/// `machine.kubelet.nodeIP`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeletNodeIp {
    /// Subnets (CIDR) the node IP is chosen from
    #[serde(default)]
    pub valid_subnets: Vec<String>,
}

/// `machine.network`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Static hostname
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Interface configuration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<NetworkInterface>,
    /// DNS servers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
}

/// `machine.network.interfaces[]`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    /// Interface name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Static addresses (CIDR)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    /// Use DHCP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp: Option<bool>,
    /// MTU
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    /// Static routes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<NetworkRoute>,
}

/// `machine.network.interfaces[].routes[]`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRoute {
    /// Destination network
    pub network: String,
    /// Gateway address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    /// Route metric
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<u32>,
}

/// `machine.install`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstallConfig {
    /// Disk to install to
    pub disk: String,
    /// Installer image
    pub image: String,
    /// Wipe the disk before installing
    pub wipe: bool,
    /// Extra kernel arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_kernel_args: Vec<String>,
}

/// `machine.registries`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistriesConfig {
    /// Mirrors keyed by registry name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mirrors: BTreeMap<String, RegistryMirror>,
}

/// `machine.registries.mirrors.<name>`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryMirror {
    /// Mirror endpoints
    #[serde(default)]
    pub endpoints: Vec<String>,
}

/// `machine.features`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeaturesConfig {
    /// Enable role-based access control for the node API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rbac: Option<bool>,
    /// Generate stable default hostnames
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable_hostname: Option<bool>,
    /// Check extended key usage of client certificates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apid_check_ext_key_usage: Option<bool>,
    /// Mount EPHEMERAL with project quota support
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_quota_support: Option<bool>,
    /// KubePrism local API server load balancer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_prism: Option<KubePrism>,
    /// Host DNS caching resolver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde(rename = "hostDNS")]
    pub host_dns: Option<HostDns>,
}

/// `machine.features.kubePrism`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubePrism {
    /// Enable KubePrism
    pub enabled: bool,
    /// Local port
    pub port: u16,
}

/// `machine.features.hostDNS`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostDns {
    /// Enable the host resolver
    pub enabled: bool,
    /// Forward Kubernetes DNS to the host resolver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde(rename = "forwardKubeDNSToHost")]
    pub forward_kube_dns_to_host: Option<bool>,
}

// =============================================================================
// cluster
// =============================================================================

/// `cluster` section
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSection {
    /// Cluster ID
    pub id: String,
    /// Shared cluster secret
    pub secret: String,
    /// Control plane endpoint
    pub control_plane: ControlPlaneConfig,
    /// Cluster name
    pub cluster_name: String,
    /// Cluster networking
    pub network: ClusterNetworkConfig,
    /// Kubernetes bootstrap token
    pub token: String,
    /// Secretbox key for secrets at rest (control plane only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secretbox_encryption_secret: Option<String>,
    /// AES-CBC key for secrets at rest (control plane only, pre-v1.3)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aescbc_encryption_secret: Option<String>,
    /// Kubernetes CA
    pub ca: CertificateAndKey,
    /// Aggregation layer CA (control plane only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde(rename = "aggregatorCA")]
    pub aggregator_ca: Option<CertificateAndKey>,
    /// Service account signing key (control plane only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<KeyOnly>,
    /// API server settings (control plane only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server: Option<ApiServerConfig>,
    /// Controller manager settings (control plane only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_manager: Option<ImageConfig>,
    /// kube-proxy settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    /// Scheduler settings (control plane only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<ImageConfig>,
    /// Cluster member discovery
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// etcd settings (control plane only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd: Option<EtcdConfig>,
    /// Manifests fetched and applied at bootstrap
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_manifests: Vec<String>,
    /// Manifests embedded in the configuration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inline_manifests: Vec<InlineManifest>,
    /// Allow workloads on control plane nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_scheduling_on_control_planes: Option<bool>,
}

/// `cluster.controlPlane`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneConfig {
    /// Kubernetes API endpoint
    pub endpoint: String,
}

/// `cluster.network`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetworkConfig {
    /// Kubernetes DNS domain
    pub dns_domain: String,
    /// Pod CIDRs
    pub pod_subnets: Vec<String>,
    /// Service CIDRs
    pub service_subnets: Vec<String>,
    /// CNI selection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cni: Option<CniConfig>,
}

/// `cluster.network.cni`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CniConfig {
    /// `flannel`, `custom` or `none`
    pub name: String,
    /// Manifests for `custom`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

/// `cluster.apiServer`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiServerConfig {
    /// API server image
    pub image: String,
    /// Extra SANs for the API server certificate
    #[serde(default)]
    pub cert_sans: Vec<String>,
    /// Disable the PodSecurityPolicy admission plugin
    #[serde(default)]
    pub disable_pod_security_policy: bool,
    /// Admission plugin configuration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub admission_control: Vec<AdmissionPlugin>,
    /// Extra API server flags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_args: BTreeMap<String, String>,
}

/// `cluster.apiServer.admissionControl[]`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionPlugin {
    /// Plugin name
    pub name: String,
    /// Plugin configuration
    pub configuration: serde_json::Value,
}

/// Component that only needs an image (controller manager, scheduler)
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    /// Component image
    pub image: String,
    /// Extra flags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_args: BTreeMap<String, String>,
}

/// `cluster.proxy`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// kube-proxy image
    pub image: String,
    /// Don't deploy kube-proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    /// Proxy mode (`iptables`, `ipvs`, `nftables`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// `cluster.discovery`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryConfig {
    /// Enable discovery
    pub enabled: bool,
    /// Discovery registries
    #[serde(default)]
    pub registries: DiscoveryRegistries,
}

/// `cluster.discovery.registries`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryRegistries {
    /// Kubernetes node annotation registry
    #[serde(default)]
    pub kubernetes: RegistryToggle,
    /// External discovery service
    #[serde(default)]
    pub service: ServiceRegistry,
}

/// Registry that can be switched off
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryToggle {
    /// Disable this registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
}

/// `cluster.discovery.registries.service`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegistry {
    /// Disable this registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    /// Discovery service URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// `cluster.etcd`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdConfig {
    /// etcd CA
    pub ca: CertificateAndKey,
    /// Subnets etcd advertises on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advertised_subnets: Vec<String>,
    /// Extra etcd flags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_args: BTreeMap<String, String>,
}

/// `cluster.inlineManifests[]`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InlineManifest {
    /// Manifest name
    pub name: String,
    /// Manifest contents
    pub contents: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_type_parses_and_displays() {
        assert_eq!("controlplane".parse::<MachineType>().unwrap(), MachineType::Controlplane);
        assert_eq!("Worker".parse::<MachineType>().unwrap(), MachineType::Worker);
        assert!("init".parse::<MachineType>().is_err());
        assert_eq!(MachineType::Worker.to_string(), "worker");
    }

    #[test]
    fn machine_type_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(MachineType::Controlplane).unwrap(),
            serde_json::json!("controlplane")
        );
    }
}
