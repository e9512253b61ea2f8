//! End-to-end tests for configuration generation
//!
//! Secrets bundle -> machine configuration compile -> patches -> rendered
//! document, exercised through the public API only.

use talos_provisioner::config::{
    compile, parse_document, CompiledConfig, GenerationDefaults, MachineConfigGenerationRequest,
    MachineType,
};
use talos_provisioner::contract::VersionContract;
use talos_provisioner::patch::PatchSource;
use talos_provisioner::secrets::{FixedClock, SecretsBundle, SystemClock};
use talos_provisioner::Error;

const ENDPOINT: &str = "https://10.5.0.2:6443";

fn clock() -> FixedClock {
    FixedClock(time::OffsetDateTime::from_unix_timestamp(1_704_067_200).unwrap())
}

fn secrets() -> SecretsBundle {
    SecretsBundle::generate(&clock(), None).unwrap()
}

fn request(machine_type: MachineType) -> MachineConfigGenerationRequest {
    MachineConfigGenerationRequest::new(machine_type, "demo", ENDPOINT, secrets())
}

fn compile_default(
    request: &MachineConfigGenerationRequest,
) -> talos_provisioner::Result<CompiledConfig> {
    compile(request, &GenerationDefaults::default())
}

#[test]
fn secrets_encryption_keys_follow_the_contract() {
    let legacy = SecretsBundle::generate(&clock(), Some(&VersionContract::V1_2)).unwrap();
    assert!(legacy.secrets.aescbc_encryption_secret.is_some());
    assert!(!legacy.secrets.secretbox_encryption_secret.is_empty());

    let current = SecretsBundle::generate(&clock(), Some(&VersionContract::V1_3)).unwrap();
    assert!(current.secrets.aescbc_encryption_secret.is_none());
    assert!(!current.secrets.secretbox_encryption_secret.is_empty());

    let (imported, inferred) =
        SecretsBundle::import_legacy(legacy.to_yaml().unwrap().as_bytes()).unwrap();
    assert_eq!(imported, legacy);
    assert_eq!(inferred, Some(VersionContract::V1_2));

    let (_, inferred) =
        SecretsBundle::import_legacy(current.to_yaml().unwrap().as_bytes()).unwrap();
    assert_eq!(inferred, None);
}

#[test]
fn generated_documents_carry_request_literals() {
    let mut request = request(MachineType::Controlplane);
    request.kubernetes_version = Some("1.30.1".to_string());

    let compiled = compile_default(&request).unwrap();
    let config = &compiled.config;

    assert_eq!(config.machine.machine_type, MachineType::Controlplane);
    assert_eq!(config.cluster.cluster_name, "demo");
    assert_eq!(config.cluster.control_plane.endpoint, ENDPOINT);
    assert_eq!(config.machine.token, request.secrets.trustd_info.token);
    assert_eq!(config.cluster.token, request.secrets.secrets.bootstrap_token);
    assert_eq!(config.machine.ca.crt, request.secrets.certs.os.crt);
    assert!(config.machine.kubelet.image.ends_with(":v1.30.1"));

    // Same inputs, same bytes.
    assert_eq!(compile_default(&request).unwrap().rendered, compiled.rendered);
    assert_eq!(parse_document(&compiled.rendered).unwrap(), compiled.config);
}

#[test]
fn workers_never_receive_ca_keys() {
    let compiled = compile_default(&request(MachineType::Worker)).unwrap();
    assert_eq!(compiled.config.machine.machine_type, MachineType::Worker);
    assert!(compiled.config.machine.ca.key.is_empty());
    assert!(compiled.config.cluster.ca.key.is_empty());
    assert!(compiled.config.cluster.aggregator_ca.is_none());
    assert!(compiled.config.cluster.service_account.is_none());
}

#[test]
fn docs_and_examples_toggle_independently() {
    const DOC: &str = "# The disk used for installations.";
    const EXAMPLE: &str = "# disk: /dev/nvme0";

    for (docs, examples) in [(false, false), (true, false), (false, true), (true, true)] {
        let mut request = request(MachineType::Worker);
        request.docs = docs;
        request.examples = examples;

        let rendered = compile_default(&request).unwrap().rendered;
        assert_eq!(rendered.contains(DOC), docs, "docs={docs} examples={examples}");
        assert_eq!(
            rendered.contains(EXAMPLE),
            examples,
            "docs={docs} examples={examples}"
        );
        assert!(parse_document(&rendered).is_ok());
    }
}

#[test]
fn endpoint_without_scheme_and_port_suggests_a_fix() {
    let mut request = request(MachineType::Controlplane);
    request.endpoint = "cluster.local".to_string();

    let err = compile_default(&request).unwrap_err();
    assert!(matches!(err, Error::Validation { .. }), "{err}");
    assert!(
        err.to_string().contains("https://cluster.local:6443"),
        "{err}"
    );
}

#[test]
fn incompatible_kubernetes_versions_are_rejected() {
    let mut too_old_for_default = request(MachineType::Controlplane);
    too_old_for_default.kubernetes_version = Some("1.25.0".to_string());
    let err = compile_default(&too_old_for_default).unwrap_err();
    assert!(err.is_user_error(), "{err}");
    assert!(err.to_string().contains("1.25.0"), "{err}");

    let mut too_old_for_v1_3 = request(MachineType::Controlplane);
    too_old_for_v1_3.talos_version = Some("v1.3".to_string());
    too_old_for_v1_3.kubernetes_version = Some("1.23.0".to_string());
    let err = compile_default(&too_old_for_v1_3).unwrap_err();
    assert!(err.to_string().contains("1.23.0"), "{err}");
    assert!(err.to_string().contains("v1.3"), "{err}");

    let mut supported = request(MachineType::Controlplane);
    supported.talos_version = Some("v1.3".to_string());
    supported.kubernetes_version = Some("1.26.0".to_string());
    compile_default(&supported).unwrap();
}

#[test]
fn patches_apply_in_order() {
    let mut request = request(MachineType::Worker);
    request.patches = vec![
        PatchSource::from("machine:\n  install:\n    disk: /dev/vda\n"),
        PatchSource::from(
            r#"[{"op": "replace", "path": "/machine/install/disk", "value": "/dev/vdb"}]"#,
        ),
        PatchSource::from("machine:\n  network:\n    hostname: worker-1\n"),
    ];

    let compiled = compile_default(&request).unwrap();
    assert_eq!(compiled.config.machine.install.disk, "/dev/vdb");
    assert_eq!(
        compiled.config.machine.network.hostname.as_deref(),
        Some("worker-1")
    );
}

#[test]
fn unknown_patch_keys_are_listed() {
    let mut request = request(MachineType::Worker);
    request.patches = vec![PatchSource::from(
        "machine:\n  bogus: 1\ncluster:\n  network:\n    mystery: true\n",
    )];

    let err = compile_default(&request).unwrap_err();
    assert!(matches!(err, Error::Validation { .. }), "{err}");
    let message = err.to_string();
    assert!(message.contains("machine.bogus"), "{message}");
    assert!(message.contains("cluster.network.mystery"), "{message}");
}

#[test]
fn empty_valued_unknown_keys_are_rejected() {
    for (patch, path) in [
        ("bogus: \"\"\n", "bogus"),
        ("machine:\n  bogus: []\n", "machine.bogus"),
        ("machine:\n  kubelet:\n    mystery: {}\n", "machine.kubelet.mystery"),
        ("clustr: null\n", "clustr"),
    ] {
        let mut request = request(MachineType::Worker);
        request.patches = vec![PatchSource::from(patch)];

        let err = compile_default(&request).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }), "{patch}: {err}");
        assert!(err.to_string().contains(path), "{patch}: {err}");
    }
}

#[test]
fn inline_manifests_with_trailing_blank_lines_round_trip() {
    for contents in ["a: 1\n\n", " leading\nsecond", "kind: Namespace\nmetadata:\n  name: ci\n"] {
        let mut request = request(MachineType::Controlplane);
        request.patches = vec![PatchSource::from(serde_json::json!({
            "cluster": { "inlineManifests": [{ "name": "ci", "contents": contents }] }
        }))];
        request.docs = true;
        request.examples = true;

        let compiled = compile_default(&request).unwrap();
        let parsed = parse_document(&compiled.rendered).unwrap();
        assert_eq!(parsed, compiled.config, "{contents:?}");
        assert_eq!(parsed.cluster.inline_manifests[0].contents, contents);
    }
}

#[test]
fn client_identity_chains_to_the_bundle() {
    let bundle = secrets();
    let identity = bundle.client_identity(&SystemClock).unwrap();
    assert!(identity.verify_against(&bundle).unwrap());

    let other = SecretsBundle::generate(&SystemClock, None).unwrap();
    assert!(!identity.verify_against(&other).unwrap());
}
