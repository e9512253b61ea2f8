//! Version contracts
//!
//! A version contract is the `MAJOR.MINOR` of the Talos release a configuration
//! targets. Every generation-time feature toggle is a predicate over the
//! contract, and they all live here so adding a threshold is a one-place change.

use std::fmt;
use std::str::FromStr;

use crate::{Error, Result, DEFAULT_TALOS_VERSION};

/// Comparable `MAJOR.MINOR` contract
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionContract {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
}

impl VersionContract {
    /// Talos v1.2, the last contract that generates an aescbc encryption secret
    pub const V1_2: Self = Self::new(1, 2);
    /// Talos v1.3
    pub const V1_3: Self = Self::new(1, 3);

    /// Build a contract from its components
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse a version string (`1.8`, `v1.8.3`, `v1.9.0-alpha.1`)
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || {
            Error::parse(
                "version",
                format!("{input:?} does not match MAJOR.MINOR[.PATCH]"),
            )
        };

        let trimmed = input.trim();
        let stripped = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let mut parts = stripped.splitn(3, '.');

        let major = parse_component(parts.next()).ok_or_else(invalid)?;
        let minor = parse_component(parts.next()).ok_or_else(invalid)?;

        if let Some(rest) = parts.next() {
            if !rest.starts_with(|c: char| c.is_ascii_digit()) {
                return Err(invalid());
            }
        }

        Ok(Self::new(major, minor))
    }

    /// Contract of the running system
    pub fn current() -> Self {
        Self::parse(DEFAULT_TALOS_VERSION).unwrap_or(Self::new(1, 8))
    }

    fn at_least(&self, major: u32, minor: u32) -> bool {
        *self >= Self::new(major, minor)
    }

    // -------------------------------------------------------------------------
    // Feature gates
    // -------------------------------------------------------------------------

    /// Secretbox is the only generated encryption secret from v1.3 on
    pub fn secretbox_encryption_supported(&self) -> bool {
        self.at_least(1, 3)
    }

    /// Cluster discovery is enabled by default
    pub fn cluster_discovery_enabled(&self) -> bool {
        self.at_least(0, 14)
    }

    /// Kubelet runs containers with the runtime default seccomp profile
    pub fn kubelet_default_runtime_seccomp_profile_enabled(&self) -> bool {
        self.at_least(1, 2)
    }

    /// Kubelet static manifests directory is disabled
    pub fn kubelet_manifests_directory_disabled(&self) -> bool {
        self.at_least(1, 2)
    }

    /// Stable default hostnames are generated
    pub fn stable_hostname_enabled(&self) -> bool {
        self.at_least(1, 2)
    }

    /// apid checks the extended key usage of client certificates
    pub fn apid_ext_key_usage_check_enabled(&self) -> bool {
        self.at_least(1, 3)
    }

    /// The Kubernetes discovery registry is disabled by default
    pub fn kubernetes_discovery_backend_disabled(&self) -> bool {
        self.at_least(1, 5)
    }

    /// EPHEMERAL is mounted with project quota support
    pub fn disk_quota_support_enabled(&self) -> bool {
        self.at_least(1, 5)
    }

    /// KubePrism load balancer is enabled
    pub fn kube_prism_enabled(&self) -> bool {
        self.at_least(1, 6)
    }

    /// Control plane nodes are excluded from external load balancers
    pub fn exclude_control_plane_from_load_balancers(&self) -> bool {
        self.at_least(1, 6)
    }

    /// Host DNS caching resolver is enabled
    pub fn host_dns_enabled(&self) -> bool {
        self.at_least(1, 7)
    }

    /// Kubernetes DNS forwards to the host resolver
    pub fn host_dns_forward_kube_dns_to_host(&self) -> bool {
        self.at_least(1, 8)
    }

    /// Pod security admission configuration is generated for the API server
    pub fn pod_security_admission_enabled(&self) -> bool {
        self.at_least(1, 1)
    }

    /// Supported Kubernetes minor range for this contract, if known
    pub fn kubernetes_support(&self) -> Option<KubernetesSupport> {
        KUBERNETES_SUPPORT
            .iter()
            .find(|(contract, _)| contract == self)
            .map(|(_, support)| *support)
    }
}

fn parse_component(part: Option<&str>) -> Option<u32> {
    let part = part?;
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

impl FromStr for VersionContract {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}

// =============================================================================
// Kubernetes compatibility
// =============================================================================

/// Inclusive Kubernetes `1.x` minor range supported by a contract
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KubernetesSupport {
    /// Oldest supported minor
    pub min_minor: u64,
    /// Newest supported minor
    pub max_minor: u64,
}

const KUBERNETES_SUPPORT: &[(VersionContract, KubernetesSupport)] = &[
    (VersionContract::new(1, 0), support(21, 24)),
    (VersionContract::new(1, 1), support(21, 24)),
    (VersionContract::new(1, 2), support(22, 25)),
    (VersionContract::new(1, 3), support(24, 26)),
    (VersionContract::new(1, 4), support(25, 27)),
    (VersionContract::new(1, 5), support(26, 28)),
    (VersionContract::new(1, 6), support(24, 29)),
    (VersionContract::new(1, 7), support(25, 30)),
    (VersionContract::new(1, 8), support(26, 31)),
    (VersionContract::new(1, 9), support(27, 32)),
    (VersionContract::new(1, 10), support(28, 33)),
    (VersionContract::new(1, 11), support(29, 34)),
];

const fn support(min_minor: u64, max_minor: u64) -> KubernetesSupport {
    KubernetesSupport {
        min_minor,
        max_minor,
    }
}

/// Parse a Kubernetes version, accepting an optional leading `v`
pub fn parse_kubernetes_version(input: &str) -> Result<semver::Version> {
    let trimmed = input.trim();
    let stripped = trimmed.strip_prefix('v').unwrap_or(trimmed);
    semver::Version::parse(stripped)
        .map_err(|e| Error::parse("kubernetes version", format!("{input:?}: {e}")))
}

/// Reject a Kubernetes version outside the range the contract supports
///
/// Contracts missing from the compatibility table are not checked.
pub fn check_kubernetes_compatibility(
    kubernetes: &semver::Version,
    contract: &VersionContract,
) -> Result<()> {
    let Some(support) = contract.kubernetes_support() else {
        return Ok(());
    };

    let too_old =
        kubernetes.major < 1 || (kubernetes.major == 1 && kubernetes.minor < support.min_minor);
    let too_new = kubernetes.major > 1 || kubernetes.minor > support.max_minor;

    if too_old {
        return Err(Error::validation(format!(
            "kubernetes version {kubernetes} is not supported with Talos {contract}: \
             minimum supported kubernetes version is 1.{}",
            support.min_minor
        )));
    }

    if too_new {
        return Err(Error::validation(format!(
            "kubernetes version {kubernetes} is not supported with Talos {contract}: \
             maximum supported kubernetes version is 1.{}",
            support.max_minor
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_and_without_prefix() {
        for input in ["1.8", "v1.8", "1.8.3", "v1.8.3", "v1.8.0-beta.1"] {
            assert_eq!(
                VersionContract::parse(input).unwrap(),
                VersionContract::new(1, 8),
                "{input}"
            );
        }
    }

    #[test]
    fn differently_formatted_versions_compare_equal() {
        let a: VersionContract = "v1.3.7".parse().unwrap();
        let b: VersionContract = "1.3".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), std::cmp::Ordering::Equal);
    }

    #[test]
    fn rejects_malformed_versions() {
        for input in ["", "v", "1", "1.", "one.two", "1.x", "1.2.beta", "vv1.2", "-1.2"] {
            assert!(VersionContract::parse(input).is_err(), "{input}");
        }
    }

    #[test]
    fn ordering_is_numeric() {
        assert!(VersionContract::new(1, 10) > VersionContract::new(1, 9));
        assert!(VersionContract::new(2, 0) > VersionContract::new(1, 99));
        assert!(VersionContract::new(0, 14) < VersionContract::V1_2);
    }

    #[test]
    fn secretbox_threshold() {
        assert!(!VersionContract::V1_2.secretbox_encryption_supported());
        assert!(VersionContract::V1_3.secretbox_encryption_supported());
        assert!(VersionContract::new(1, 8).secretbox_encryption_supported());
    }

    #[test]
    fn current_contract_comes_from_default_version() {
        let current = VersionContract::current();
        assert_eq!(current, VersionContract::parse(DEFAULT_TALOS_VERSION).unwrap());
        assert!(current.kubernetes_support().is_some());
    }

    #[test]
    fn default_kubernetes_version_fits_current_contract() {
        let k8s = parse_kubernetes_version(crate::DEFAULT_KUBERNETES_VERSION).unwrap();
        check_kubernetes_compatibility(&k8s, &VersionContract::current()).unwrap();
    }

    #[test]
    fn kubernetes_below_minimum_is_rejected_with_both_versions() {
        let k8s = parse_kubernetes_version("1.25.0").unwrap();
        let err = check_kubernetes_compatibility(&k8s, &VersionContract::new(1, 8)).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("1.25.0"), "{msg}");
        assert!(msg.contains("v1.8"), "{msg}");

        let k8s = parse_kubernetes_version("v1.23.0").unwrap();
        let err = check_kubernetes_compatibility(&k8s, &VersionContract::V1_3).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("1.23.0"), "{msg}");
        assert!(msg.contains("v1.3"), "{msg}");
    }

    #[test]
    fn kubernetes_above_maximum_is_rejected() {
        let k8s = parse_kubernetes_version("1.30.0").unwrap();
        assert!(check_kubernetes_compatibility(&k8s, &VersionContract::V1_3).is_err());
    }

    #[test]
    fn unknown_contracts_are_not_checked() {
        let k8s = parse_kubernetes_version("1.40.0").unwrap();
        check_kubernetes_compatibility(&k8s, &VersionContract::new(2, 0)).unwrap();
    }

    #[test]
    fn kubernetes_version_requires_patch() {
        assert!(parse_kubernetes_version("1.31").is_err());
        assert_eq!(
            parse_kubernetes_version("v1.31.2").unwrap(),
            semver::Version::new(1, 31, 2)
        );
    }
}
