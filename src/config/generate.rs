//! Base document generation
//!
//! Builds the unpatched machine configuration for one machine type. Every
//! version-dependent field is decided by a [`VersionContract`] predicate, never
//! by comparing versions inline.

use std::collections::BTreeMap;

use serde_json::json;

use super::types::{
    AdmissionPlugin, ApiServerConfig, CertificateAndKey, ClusterNetworkConfig, ClusterSection,
    ControlPlaneConfig, DiscoveryConfig, DiscoveryRegistries, EtcdConfig, FeaturesConfig, HostDns,
    ImageConfig, InstallConfig, KeyOnly, KubePrism, KubeletConfig, MachineConfig, MachineSection,
    MachineType, ProxyConfig, RegistryToggle, ServiceRegistry, CONFIG_VERSION,
};
use crate::contract::VersionContract;
use crate::secrets::SecretsBundle;

/// Default pod network
pub const DEFAULT_POD_SUBNET: &str = "10.244.0.0/16";

/// Default service network
pub const DEFAULT_SERVICE_SUBNET: &str = "10.96.0.0/12";

/// Default public discovery service
pub const DEFAULT_DISCOVERY_ENDPOINT: &str = "https://discovery.talos.dev/";

/// Local port KubePrism listens on
pub const KUBE_PRISM_PORT: u16 = 7445;

const KUBELET_IMAGE: &str = "ghcr.io/siderolabs/kubelet";
const KUBERNETES_IMAGE_REGISTRY: &str = "registry.k8s.io";

/// Fully resolved inputs for base generation
#[derive(Clone, Debug)]
pub struct GenerationOptions {
    /// Contract every feature toggle is evaluated against
    pub contract: VersionContract,
    /// Kubernetes version without a leading `v`
    pub kubernetes_version: String,
    /// Cluster name
    pub cluster_name: String,
    /// Validated control plane endpoint
    pub endpoint: String,
    /// Kubernetes DNS domain
    pub dns_domain: String,
    /// Install disk
    pub install_disk: String,
    /// Installer image
    pub install_image: String,
    /// Persist the configuration on the node
    pub persist: bool,
    /// Enable cluster discovery (still gated by the contract)
    pub discovery_enabled: bool,
    /// Extra API server certificate SANs
    pub additional_sans: Vec<String>,
}

/// Build the base document for `machine_type`
pub fn build(
    machine_type: MachineType,
    options: &GenerationOptions,
    secrets: &SecretsBundle,
) -> MachineConfig {
    MachineConfig {
        version: CONFIG_VERSION.to_string(),
        debug: false,
        persist: options.persist,
        machine: machine_section(machine_type, options, secrets),
        cluster: cluster_section(machine_type, options, secrets),
    }
}

fn machine_section(
    machine_type: MachineType,
    options: &GenerationOptions,
    secrets: &SecretsBundle,
) -> MachineSection {
    let contract = &options.contract;

    // Workers hold the OS CA certificate but never its key.
    let os_ca = match machine_type {
        MachineType::Controlplane => copy_pair(&secrets.certs.os),
        MachineType::Worker => CertificateAndKey {
            crt: secrets.certs.os.crt.clone(),
            key: String::new(),
        },
    };

    let kubelet = KubeletConfig {
        image: format!("{KUBELET_IMAGE}:v{}", options.kubernetes_version),
        default_runtime_seccomp_profile_enabled: contract
            .kubelet_default_runtime_seccomp_profile_enabled()
            .then_some(true),
        disable_manifests_directory: contract.kubelet_manifests_directory_disabled().then_some(true),
        ..Default::default()
    };

    let features = FeaturesConfig {
        rbac: Some(true),
        stable_hostname: contract.stable_hostname_enabled().then_some(true),
        apid_check_ext_key_usage: contract.apid_ext_key_usage_check_enabled().then_some(true),
        disk_quota_support: contract.disk_quota_support_enabled().then_some(true),
        kube_prism: contract.kube_prism_enabled().then_some(KubePrism {
            enabled: true,
            port: KUBE_PRISM_PORT,
        }),
        host_dns: contract.host_dns_enabled().then(|| HostDns {
            enabled: true,
            forward_kube_dns_to_host: contract.host_dns_forward_kube_dns_to_host().then_some(true),
        }),
    };

    let mut node_labels = BTreeMap::new();
    if machine_type == MachineType::Controlplane
        && contract.exclude_control_plane_from_load_balancers()
    {
        node_labels.insert(
            "node.kubernetes.io/exclude-from-external-load-balancers".to_string(),
            String::new(),
        );
    }

    MachineSection {
        machine_type,
        token: secrets.trustd_info.token.clone(),
        ca: os_ca,
        cert_sans: Vec::new(),
        kubelet,
        network: Default::default(),
        install: InstallConfig {
            disk: options.install_disk.clone(),
            image: options.install_image.clone(),
            wipe: false,
            extra_kernel_args: Vec::new(),
        },
        registries: Default::default(),
        features,
        node_labels,
        sysctls: BTreeMap::new(),
        env: BTreeMap::new(),
    }
}

fn cluster_section(
    machine_type: MachineType,
    options: &GenerationOptions,
    secrets: &SecretsBundle,
) -> ClusterSection {
    let contract = &options.contract;
    let control_plane = machine_type == MachineType::Controlplane;
    let k8s_image = |component: &str| {
        format!(
            "{KUBERNETES_IMAGE_REGISTRY}/{component}:v{}",
            options.kubernetes_version
        )
    };

    let discovery_enabled = options.discovery_enabled && contract.cluster_discovery_enabled();
    let discovery = DiscoveryConfig {
        enabled: discovery_enabled,
        registries: DiscoveryRegistries {
            kubernetes: RegistryToggle {
                disabled: (discovery_enabled && contract.kubernetes_discovery_backend_disabled())
                    .then_some(true),
            },
            service: ServiceRegistry::default(),
        },
    };

    let kubernetes_ca = if control_plane {
        copy_pair(&secrets.certs.kubernetes)
    } else {
        CertificateAndKey {
            crt: secrets.certs.kubernetes.crt.clone(),
            key: String::new(),
        }
    };

    let mut section = ClusterSection {
        id: secrets.cluster.id.clone(),
        secret: secrets.cluster.secret.clone(),
        control_plane: ControlPlaneConfig {
            endpoint: options.endpoint.clone(),
        },
        cluster_name: options.cluster_name.clone(),
        network: ClusterNetworkConfig {
            dns_domain: options.dns_domain.clone(),
            pod_subnets: vec![DEFAULT_POD_SUBNET.to_string()],
            service_subnets: vec![DEFAULT_SERVICE_SUBNET.to_string()],
            cni: None,
        },
        token: secrets.secrets.bootstrap_token.clone(),
        secretbox_encryption_secret: None,
        aescbc_encryption_secret: None,
        ca: kubernetes_ca,
        aggregator_ca: None,
        service_account: None,
        api_server: None,
        controller_manager: None,
        proxy: Some(ProxyConfig {
            image: k8s_image("kube-proxy"),
            disabled: None,
            mode: None,
        }),
        scheduler: None,
        discovery,
        etcd: None,
        extra_manifests: Vec::new(),
        inline_manifests: Vec::new(),
        allow_scheduling_on_control_planes: None,
    };

    if control_plane {
        section.secretbox_encryption_secret =
            Some(secrets.secrets.secretbox_encryption_secret.clone()).filter(|s| !s.is_empty());
        section.aescbc_encryption_secret = secrets
            .secrets
            .aescbc_encryption_secret
            .clone()
            .filter(|s| !s.is_empty());
        section.aggregator_ca = Some(copy_pair(&secrets.certs.kubernetes_aggregator));
        section.service_account = Some(KeyOnly {
            key: secrets.certs.kubernetes_service_account.key.clone(),
        });
        section.api_server = Some(ApiServerConfig {
            image: k8s_image("kube-apiserver"),
            cert_sans: api_server_sans(options),
            disable_pod_security_policy: true,
            admission_control: if contract.pod_security_admission_enabled() {
                vec![pod_security_admission()]
            } else {
                Vec::new()
            },
            extra_args: BTreeMap::new(),
        });
        section.controller_manager = Some(ImageConfig {
            image: k8s_image("kube-controller-manager"),
            extra_args: BTreeMap::new(),
        });
        section.scheduler = Some(ImageConfig {
            image: k8s_image("kube-scheduler"),
            extra_args: BTreeMap::new(),
        });
        section.etcd = Some(EtcdConfig {
            ca: copy_pair(&secrets.certs.etcd),
            advertised_subnets: Vec::new(),
            extra_args: BTreeMap::new(),
        });
    }

    section
}

/// Control plane endpoint host first, then any extra SANs, without duplicates
fn api_server_sans(options: &GenerationOptions) -> Vec<String> {
    let mut sans = Vec::new();
    if let Some(host) = url::Url::parse(&options.endpoint)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
    {
        sans.push(host);
    }
    for san in &options.additional_sans {
        if !sans.contains(san) {
            sans.push(san.clone());
        }
    }
    sans
}

fn pod_security_admission() -> AdmissionPlugin {
    AdmissionPlugin {
        name: "PodSecurity".to_string(),
        configuration: json!({
            "apiVersion": "pod-security.admission.config.k8s.io/v1alpha1",
            "kind": "PodSecurityConfiguration",
            "defaults": {
                "audit": "restricted",
                "audit-version": "latest",
                "enforce": "baseline",
                "enforce-version": "latest",
                "warn": "restricted",
                "warn-version": "latest",
            },
            "exemptions": {
                "namespaces": ["kube-system"],
                "runtimeClasses": [],
                "usernames": [],
            },
        }),
    }
}

fn copy_pair(pair: &crate::secrets::CertificateAndKey) -> CertificateAndKey {
    CertificateAndKey {
        crt: pair.crt.clone(),
        key: pair.key.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::{FixedClock, SecretsBundle};

    fn options(contract: &str) -> GenerationOptions {
        GenerationOptions {
            contract: VersionContract::parse(contract).unwrap(),
            kubernetes_version: "1.31.2".to_string(),
            cluster_name: "demo".to_string(),
            endpoint: "https://10.5.0.2:6443".to_string(),
            dns_domain: "cluster.local".to_string(),
            install_disk: "/dev/sda".to_string(),
            install_image: "ghcr.io/siderolabs/installer:v1.8.3".to_string(),
            persist: true,
            discovery_enabled: true,
            additional_sans: vec!["api.example.com".to_string(), "10.5.0.2".to_string()],
        }
    }

    fn bundle() -> SecretsBundle {
        let clock = FixedClock(time::OffsetDateTime::UNIX_EPOCH);
        SecretsBundle::generate(&clock, None).unwrap()
    }

    #[test]
    fn worker_never_carries_control_plane_secrets() {
        let secrets = bundle();
        let config = build(MachineType::Worker, &options("v1.8"), &secrets);

        assert!(config.machine.ca.key.is_empty());
        assert!(config.cluster.ca.key.is_empty());
        assert!(config.cluster.etcd.is_none());
        assert!(config.cluster.api_server.is_none());
        assert!(config.cluster.service_account.is_none());
        assert!(config.cluster.secretbox_encryption_secret.is_none());
        assert!(config.cluster.proxy.is_some());
    }

    #[test]
    fn control_plane_carries_role_material() {
        let secrets = bundle();
        let config = build(MachineType::Controlplane, &options("v1.8"), &secrets);

        assert_eq!(config.machine.ca.key, secrets.certs.os.key);
        assert_eq!(
            config.cluster.etcd.as_ref().unwrap().ca.crt,
            secrets.certs.etcd.crt
        );
        assert_eq!(
            config.cluster.api_server.as_ref().unwrap().image,
            "registry.k8s.io/kube-apiserver:v1.31.2"
        );
        assert_eq!(
            config.cluster.api_server.as_ref().unwrap().cert_sans,
            vec!["10.5.0.2", "api.example.com"]
        );
        assert_eq!(config.machine.kubelet.image, "ghcr.io/siderolabs/kubelet:v1.31.2");
    }

    #[test]
    fn features_follow_the_contract() {
        let secrets = bundle();

        let modern = build(MachineType::Controlplane, &options("v1.8"), &secrets);
        let features = &modern.machine.features;
        assert_eq!(features.kube_prism.as_ref().map(|k| k.port), Some(KUBE_PRISM_PORT));
        assert_eq!(
            features.host_dns.as_ref().and_then(|h| h.forward_kube_dns_to_host),
            Some(true)
        );
        assert_eq!(modern.cluster.discovery.registries.kubernetes.disabled, Some(true));
        assert!(modern
            .machine
            .node_labels
            .contains_key("node.kubernetes.io/exclude-from-external-load-balancers"));

        let old = build(MachineType::Controlplane, &options("v1.2"), &secrets);
        let features = &old.machine.features;
        assert!(features.kube_prism.is_none());
        assert!(features.host_dns.is_none());
        assert!(features.apid_check_ext_key_usage.is_none());
        assert_eq!(features.stable_hostname, Some(true));
        assert!(old.machine.node_labels.is_empty());
        assert_eq!(old.cluster.discovery.registries.kubernetes.disabled, None);
    }

    #[test]
    fn host_dns_without_forwarding_on_v1_7() {
        let config = build(MachineType::Worker, &options("v1.7"), &bundle());
        let host_dns = config.machine.features.host_dns.unwrap();
        assert!(host_dns.enabled);
        assert_eq!(host_dns.forward_kube_dns_to_host, None);
    }

    #[test]
    fn discovery_disabled_before_supported_contract() {
        let config = build(MachineType::Worker, &options("v0.13"), &bundle());
        assert!(!config.cluster.discovery.enabled);
    }
}
