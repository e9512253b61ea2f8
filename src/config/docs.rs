//! Field documentation and examples for the annotated encoder
//!
//! Keys are dotted document paths (`machine.install.disk`). List items don't
//! have their own entries.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde_json::{json, Value};

/// Documentation for one field
#[derive(Clone, Debug, PartialEq)]
pub struct FieldDoc {
    /// One or more lines of description
    pub description: &'static str,
    /// Example value rendered as a commented block
    pub example: Option<Value>,
}

/// Look up the documentation for a dotted path
pub fn lookup(path: &str) -> Option<&'static FieldDoc> {
    registry().get(path)
}

/// Direct children of `parent` that carry documentation, in registry order
pub fn documented_children(
    parent: &str,
) -> impl Iterator<Item = (&'static str, &'static FieldDoc)> {
    let prefix = if parent.is_empty() {
        String::new()
    } else {
        format!("{parent}.")
    };
    registry().iter().filter_map(move |(path, doc)| {
        let rest = path.strip_prefix(prefix.as_str())?;
        (!rest.is_empty() && !rest.contains('.')).then_some((rest, doc))
    })
}

fn registry() -> &'static BTreeMap<&'static str, FieldDoc> {
    static REGISTRY: OnceLock<BTreeMap<&'static str, FieldDoc>> = OnceLock::new();
    REGISTRY.get_or_init(build_registry)
}

fn doc(description: &'static str) -> FieldDoc {
    FieldDoc {
        description,
        example: None,
    }
}

fn doc_with_example(description: &'static str, example: Value) -> FieldDoc {
    FieldDoc {
        description,
        example: Some(example),
    }
}

fn build_registry() -> BTreeMap<&'static str, FieldDoc> {
    BTreeMap::from([
        ("version", doc("Indicates the schema used to decode the contents.")),
        ("debug", doc("Enable verbose logging to the console.")),
        ("persist", doc("Indicates whether to pull the machine config upon every boot.")),
        (
            "machine",
            doc("Provides machine specific configuration options."),
        ),
        (
            "machine.type",
            doc("Defines the role of the machine within the cluster."),
        ),
        (
            "machine.token",
            doc("The `token` is used by a machine to join the PKI of the cluster."),
        ),
        (
            "machine.ca",
            doc("The root certificate authority of the PKI.\nIt is composed of a base64 encoded `crt` and `key`."),
        ),
        (
            "machine.certSANs",
            doc_with_example(
                "Extra certificate subject alternative names for the machine's certificate.",
                json!(["10.0.0.10", "172.16.0.10", "192.168.0.10"]),
            ),
        ),
        (
            "machine.kubelet",
            doc("Used to provide additional options to the kubelet."),
        ),
        (
            "machine.kubelet.image",
            doc_with_example(
                "The `image` field is an optional reference to an alternative kubelet image.",
                json!("ghcr.io/siderolabs/kubelet:v1.31.2"),
            ),
        ),
        (
            "machine.kubelet.defaultRuntimeSeccompProfileEnabled",
            doc("Enable container runtime default Seccomp profile."),
        ),
        (
            "machine.kubelet.disableManifestsDirectory",
            doc("The `disableManifestsDirectory` field configures the kubelet to get static pod manifests from the /etc/kubernetes/manifests directory."),
        ),
        (
            "machine.kubelet.extraArgs",
            doc_with_example(
                "The `extraArgs` field is used to provide additional flags to the kubelet.",
                json!({ "feature-gates": "ServerSideApply=true" }),
            ),
        ),
        (
            "machine.kubelet.nodeIP",
            doc_with_example(
                "The `nodeIP` field is used to configure `--node-ip` flag for the kubelet.",
                json!({ "validSubnets": ["10.0.0.0/8", "!10.0.0.3/32", "fdc7::/16"] }),
            ),
        ),
        (
            "machine.network",
            doc_with_example(
                "Provides machine specific network configuration options.",
                json!({
                    "hostname": "worker-1",
                    "interfaces": [{
                        "interface": "enp0s1",
                        "addresses": ["192.168.2.0/24"],
                        "mtu": 1500,
                        "routes": [{ "network": "0.0.0.0/0", "gateway": "192.168.2.1", "metric": 1024 }],
                    }],
                    "nameservers": ["9.8.7.6", "8.7.6.5"],
                }),
            ),
        ),
        (
            "machine.install",
            doc_with_example(
                "Used to provide instructions for installations.",
                json!({
                    "disk": "/dev/sda",
                    "extraKernelArgs": ["console=ttyS1", "panic=10"],
                    "image": "ghcr.io/siderolabs/installer:latest",
                    "wipe": false,
                }),
            ),
        ),
        (
            "machine.install.disk",
            doc_with_example(
                "The disk used for installations.",
                json!("/dev/nvme0"),
            ),
        ),
        (
            "machine.install.image",
            doc_with_example(
                "Allows for supplying the image used to perform the installation.",
                json!("ghcr.io/siderolabs/installer:latest"),
            ),
        ),
        (
            "machine.install.wipe",
            doc("Indicates if the installation disk should be wiped at installation time."),
        ),
        (
            "machine.install.extraKernelArgs",
            doc_with_example(
                "Allows for supplying extra kernel args via the bootloader.",
                json!(["talos.platform=metal", "reboot=k"]),
            ),
        ),
        (
            "machine.registries",
            doc_with_example(
                "Used to configure the machine's container image registry mirrors.",
                json!({ "mirrors": { "docker.io": { "endpoints": ["https://registry.local"] } } }),
            ),
        ),
        (
            "machine.features",
            doc("Features describe individual Talos features that can be switched on or off."),
        ),
        (
            "machine.nodeLabels",
            doc_with_example(
                "Configures the node labels for the machine.",
                json!({ "exampleLabel": "exampleLabelValue" }),
            ),
        ),
        (
            "machine.sysctls",
            doc_with_example(
                "Used to configure the machine's sysctls.",
                json!({ "kernel.domainname": "talos.dev", "net.ipv4.ip_forward": "0" }),
            ),
        ),
        (
            "machine.env",
            doc_with_example(
                "Allows for the addition of environment variables.",
                json!({ "GRPC_GO_LOG_SEVERITY_LEVEL": "info", "https_proxy": "http://SERVER:PORT/" }),
            ),
        ),
        (
            "cluster",
            doc("Provides cluster specific configuration options."),
        ),
        ("cluster.id", doc("Globally unique identifier for this cluster (base64 encoded random 32 bytes).")),
        (
            "cluster.secret",
            doc("Shared secret of cluster (base64 encoded random 32 bytes).\nThis secret is shared among cluster members but should never be sent over the network."),
        ),
        (
            "cluster.controlPlane",
            doc("Provides control plane specific configuration options."),
        ),
        (
            "cluster.controlPlane.endpoint",
            doc_with_example(
                "Endpoint is the canonical controlplane endpoint, which can be an IP address or a DNS hostname.\nIt is single-valued, and may optionally include a port number.",
                json!("https://1.2.3.4:6443"),
            ),
        ),
        ("cluster.clusterName", doc("Configures the cluster's name.")),
        (
            "cluster.network",
            doc("Provides cluster specific network configuration options."),
        ),
        (
            "cluster.network.dnsDomain",
            doc("The domain used by Kubernetes DNS.\nThe default is `cluster.local`"),
        ),
        (
            "cluster.network.podSubnets",
            doc_with_example(
                "The pod subnet CIDR.",
                json!(["10.244.0.0/16"]),
            ),
        ),
        (
            "cluster.network.serviceSubnets",
            doc_with_example(
                "The service subnet CIDR.",
                json!(["10.96.0.0/12"]),
            ),
        ),
        (
            "cluster.network.cni",
            doc_with_example(
                "The CNI used.\nComposed of \"name\" and \"urls\".",
                json!({ "name": "custom", "urls": ["https://docs.projectcalico.org/archive/v3.20/manifests/canal.yaml"] }),
            ),
        ),
        (
            "cluster.token",
            doc("The bootstrap token used to join the cluster."),
        ),
        (
            "cluster.secretboxEncryptionSecret",
            doc("A key used for the encryption of secret data at rest.\nEnables encryption with secretbox."),
        ),
        (
            "cluster.aescbcEncryptionSecret",
            doc("A key used for the encryption of secret data at rest.\nEnables encryption with AESCBC."),
        ),
        (
            "cluster.ca",
            doc("The base64 encoded root certificate authority used by Kubernetes."),
        ),
        (
            "cluster.aggregatorCA",
            doc("The base64 encoded aggregator certificate authority used by Kubernetes for front-proxy certificate generation."),
        ),
        (
            "cluster.serviceAccount",
            doc("The base64 encoded private key for service account token generation."),
        ),
        (
            "cluster.apiServer",
            doc("API server specific configuration options."),
        ),
        (
            "cluster.apiServer.image",
            doc_with_example(
                "The container image used in the API server manifest.",
                json!("registry.k8s.io/kube-apiserver:v1.31.2"),
            ),
        ),
        (
            "cluster.apiServer.certSANs",
            doc("Extra certificate subject alternative names for the API server's certificate."),
        ),
        (
            "cluster.apiServer.disablePodSecurityPolicy",
            doc("Disable PodSecurityPolicy in the API server and default manifests."),
        ),
        (
            "cluster.apiServer.admissionControl",
            doc("Configure the API server admission plugins."),
        ),
        (
            "cluster.controllerManager",
            doc("Controller manager server specific configuration options."),
        ),
        (
            "cluster.proxy",
            doc_with_example(
                "Kube-proxy server-specific configuration options",
                json!({ "image": "registry.k8s.io/kube-proxy:v1.31.2", "mode": "ipvs" }),
            ),
        ),
        (
            "cluster.scheduler",
            doc("Scheduler server specific configuration options."),
        ),
        (
            "cluster.discovery",
            doc_with_example(
                "Configures cluster member discovery.",
                json!({
                    "enabled": true,
                    "registries": {
                        "kubernetes": {},
                        "service": { "endpoint": "https://discovery.talos.dev/" },
                    },
                }),
            ),
        ),
        (
            "cluster.etcd",
            doc("Etcd specific configuration options."),
        ),
        (
            "cluster.extraManifests",
            doc_with_example(
                "A list of urls that point to additional manifests.\nThese will get automatically deployed as part of the bootstrap.",
                json!([
                    "https://www.example.com/manifest1.yaml",
                    "https://www.example.com/manifest2.yaml",
                ]),
            ),
        ),
        (
            "cluster.inlineManifests",
            doc_with_example(
                "A list of inline Kubernetes manifests.\nThese will get automatically deployed as part of the bootstrap.",
                json!([{
                    "name": "namespace-ci",
                    "contents": "apiVersion: v1\nkind: Namespace\nmetadata:\n\tname: ci",
                }]),
            ),
        ),
        (
            "cluster.allowSchedulingOnControlPlanes",
            doc("Allows running workload on control-plane nodes."),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_nested_fields() {
        let disk = lookup("machine.install.disk").unwrap();
        assert_eq!(disk.description, "The disk used for installations.");
        assert_eq!(disk.example, Some(json!("/dev/nvme0")));
        assert!(lookup("machine.install.nope").is_none());
    }

    #[test]
    fn children_are_direct_only() {
        let children: Vec<_> = documented_children("machine.install")
            .map(|(key, _)| key)
            .collect();
        assert_eq!(children, vec!["disk", "extraKernelArgs", "image", "wipe"]);

        let top: Vec<_> = documented_children("").map(|(key, _)| key).collect();
        assert_eq!(top, vec!["cluster", "debug", "machine", "persist", "version"]);
    }
}
