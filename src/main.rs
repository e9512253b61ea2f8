//! talos-provisioner - generate cluster secrets and machine configuration,
//! and run operations against Talos nodes

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use talos_provisioner::config::{
    compile, GenerationDefaults, MachineConfigGenerationRequest, MachineType,
};
use talos_provisioner::contract::VersionContract;
use talos_provisioner::disk::{DiskFilter, DiskType, SizeFilter};
use talos_provisioner::executor::{ExecuteOptions, Executor};
use talos_provisioner::node::{ApiReadiness, ApplyMode, HttpsReadiness, NodeTarget};
use talos_provisioner::operations::{self, ApplyConfigurationOptions, DiskSelection};
use talos_provisioner::patch::PatchSource;
use talos_provisioner::secrets::{ClientIdentity, SecretsBundle, SystemClock};
use talos_provisioner::DEFAULT_OPERATION_TIMEOUT;

/// Talos cluster provisioning: secrets, machine configuration and node operations
#[derive(Parser, Debug)]
#[command(name = "talos-provisioner", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate secrets, machine configuration or client configuration
    #[command(subcommand)]
    Gen(GenCommand),

    /// Bootstrap etcd on a control plane node
    Bootstrap(NodeArgs),

    /// Apply a machine configuration to a node
    Apply(ApplyArgs),

    /// List or select disks on a node
    Disks(DisksArgs),

    /// Retrieve the cluster admin kubeconfig
    Kubeconfig(KubeconfigArgs),
}

#[derive(Subcommand, Debug)]
enum GenCommand {
    /// Generate a new secrets bundle
    Secrets(GenSecretsArgs),

    /// Generate a machine configuration
    Config(GenConfigArgs),

    /// Generate a client configuration for the node API
    Talosconfig(GenTalosconfigArgs),
}

#[derive(Args, Debug)]
struct GenSecretsArgs {
    /// Talos version the secrets are generated for
    #[arg(long, env = "TALOS_VERSION")]
    talos_version: Option<String>,

    /// Write to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct GenConfigArgs {
    /// Cluster name
    #[arg(long, env = "TALOS_CLUSTER_NAME")]
    cluster_name: String,

    /// Cluster endpoint, https://<host>:<port>
    #[arg(long, env = "TALOS_CLUSTER_ENDPOINT")]
    endpoint: String,

    /// Machine type (controlplane or worker)
    #[arg(long = "type", default_value = "controlplane")]
    machine_type: MachineType,

    /// Secrets bundle file
    #[arg(long, env = "TALOS_SECRETS")]
    secrets: PathBuf,

    /// Patch to apply, inline YAML/JSON or @file
    #[arg(long = "patch")]
    patches: Vec<String>,

    /// Kubernetes version
    #[arg(long, env = "TALOS_KUBERNETES_VERSION")]
    kubernetes_version: Option<String>,

    /// Talos version the configuration targets
    #[arg(long, env = "TALOS_VERSION")]
    talos_version: Option<String>,

    /// Install disk
    #[arg(long)]
    install_disk: Option<String>,

    /// Installer image
    #[arg(long)]
    install_image: Option<String>,

    /// Extra API server certificate SANs
    #[arg(long = "additional-sans", value_delimiter = ',')]
    additional_sans: Vec<String>,

    /// Include field documentation
    #[arg(long)]
    docs: bool,

    /// Include commented examples
    #[arg(long)]
    examples: bool,

    /// Write to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct GenTalosconfigArgs {
    /// Secrets bundle file
    #[arg(long, env = "TALOS_SECRETS")]
    secrets: PathBuf,

    /// Context name
    #[arg(long, default_value = "talos")]
    context: String,

    /// Node API endpoints
    #[arg(short, long = "endpoint", env = "TALOS_ENDPOINTS", value_delimiter = ',')]
    endpoints: Vec<String>,

    /// Default target nodes
    #[arg(short, long = "node", env = "TALOS_NODES", value_delimiter = ',')]
    nodes: Vec<String>,

    /// Write to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

/// Flags shared by every node operation
#[derive(Args, Debug)]
struct NodeArgs {
    /// Node API endpoint, host[:port]
    #[arg(short, long, env = "TALOS_ENDPOINT")]
    endpoint: String,

    /// Node to proxy the request to through the endpoint
    #[arg(short, long, env = "TALOS_NODE")]
    node: Option<String>,

    /// Secrets bundle the client identity is derived from
    #[arg(long, env = "TALOS_SECRETS")]
    secrets: PathBuf,

    /// Overall deadline, retries included (e.g. 90s, 10m)
    #[arg(long, env = "TALOS_TIMEOUT", value_parser = parse_duration)]
    timeout: Option<Duration>,
}

#[derive(Args, Debug)]
struct ApplyArgs {
    #[command(flatten)]
    node: NodeArgs,

    /// Machine configuration file
    #[arg(short = 'f', long = "config")]
    config: PathBuf,

    /// Apply mode (auto, reboot, no-reboot, staged, try)
    #[arg(long, default_value = "auto")]
    mode: ApplyMode,

    /// Validate on the node without applying
    #[arg(long)]
    dry_run: bool,

    /// Patch to apply before sending, inline YAML/JSON or @file
    #[arg(long = "patch")]
    patches: Vec<String>,
}

#[derive(Args, Debug)]
struct DisksArgs {
    #[command(flatten)]
    node: NodeArgs,

    /// Size comparison, e.g. ">= 100GB"
    #[arg(long)]
    size: Option<SizeFilter>,

    /// Medium (ssd, hdd, nvme, sd)
    #[arg(long = "type")]
    disk_type: Option<DiskType>,

    /// Device path glob
    #[arg(long)]
    name: Option<String>,

    /// Model glob
    #[arg(long)]
    model: Option<String>,

    /// Return every match instead of the first
    #[arg(long)]
    all: bool,
}

#[derive(Args, Debug)]
struct KubeconfigArgs {
    #[command(flatten)]
    node: NodeArgs,

    /// Wait for the Kubernetes API to come up
    #[arg(long)]
    wait: bool,

    /// Write to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("failed to install the aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Gen(GenCommand::Secrets(args)) => gen_secrets(args),
        Commands::Gen(GenCommand::Config(args)) => gen_config(args),
        Commands::Gen(GenCommand::Talosconfig(args)) => gen_talosconfig(args),
        Commands::Bootstrap(args) => run_bootstrap(args).await,
        Commands::Apply(args) => run_apply(args).await,
        Commands::Disks(args) => run_disks(args).await,
        Commands::Kubeconfig(args) => run_kubeconfig(args).await,
    }
}

fn gen_secrets(args: GenSecretsArgs) -> anyhow::Result<()> {
    let contract = args
        .talos_version
        .as_deref()
        .map(VersionContract::parse)
        .transpose()?;

    let bundle = SecretsBundle::generate(&SystemClock, contract.as_ref())?;
    write_output(args.output.as_deref(), bundle.to_yaml()?.as_bytes())
}

fn gen_config(args: GenConfigArgs) -> anyhow::Result<()> {
    let (secrets, inferred) = load_secrets(&args.secrets)?;

    let mut request = MachineConfigGenerationRequest::new(
        args.machine_type,
        args.cluster_name,
        args.endpoint,
        secrets,
    );
    request.patches = load_patch_sources(&args.patches)?;
    request.kubernetes_version = args.kubernetes_version;
    request.talos_version = args
        .talos_version
        .or_else(|| inferred.map(|contract| contract.to_string()));
    request.install_disk = args.install_disk;
    request.install_image = args.install_image;
    request.additional_sans = args.additional_sans;
    request.docs = args.docs;
    request.examples = args.examples;

    let compiled = compile(&request, &GenerationDefaults::default())?;
    info!(
        machine_type = %args.machine_type,
        contract = %compiled.contract,
        "Generated machine configuration"
    );
    write_output(args.output.as_deref(), compiled.rendered.as_bytes())
}

fn gen_talosconfig(args: GenTalosconfigArgs) -> anyhow::Result<()> {
    let (secrets, _) = load_secrets(&args.secrets)?;
    let identity = secrets.client_identity(&SystemClock)?;
    let rendered = identity.to_talosconfig(&args.context, &args.endpoints, &args.nodes)?;
    write_output(args.output.as_deref(), rendered.as_bytes())
}

async fn run_bootstrap(args: NodeArgs) -> anyhow::Result<()> {
    let (target, identity, options) = node_context(&args)?;
    operations::bootstrap(&Executor::grpc(), &target, &identity, &options).await?;
    info!(endpoint = %target, "Bootstrap requested");
    Ok(())
}

async fn run_apply(args: ApplyArgs) -> anyhow::Result<()> {
    let (target, identity, options) = node_context(&args.node)?;
    let document = std::fs::read_to_string(&args.config)
        .with_context(|| format!("failed to read {}", args.config.display()))?;

    let apply = ApplyConfigurationOptions {
        mode: args.mode,
        dry_run: args.dry_run,
        patches: load_patch_sources(&args.patches)?,
    };
    let outcome = operations::apply_configuration(
        &Executor::grpc(),
        &target,
        &identity,
        &document,
        &apply,
        &options,
    )
    .await?;

    println!("{}", outcome.mode_details);
    for warning in outcome.warnings {
        eprintln!("warning: {warning}");
    }
    Ok(())
}

async fn run_disks(args: DisksArgs) -> anyhow::Result<()> {
    let (target, identity, options) = node_context(&args.node)?;
    let filter = DiskFilter {
        size: args.size,
        disk_type: args.disk_type,
        name: args.name.as_deref().map(DiskFilter::pattern).transpose()?,
        model: args.model.as_deref().map(DiskFilter::pattern).transpose()?,
        ..Default::default()
    };
    let selection = if args.all || filter.is_empty() {
        DiskSelection::AllMatches
    } else {
        DiskSelection::FirstMatch
    };

    let disks =
        operations::find_disks(&Executor::grpc(), &target, &identity, &filter, selection, &options)
            .await?;

    println!("{:<16} {:>12} {:<6} {:<24} SYSTEM", "NAME", "SIZE", "TYPE", "MODEL");
    for disk in disks {
        println!(
            "{:<16} {:>12} {:<6} {:<24} {}",
            disk.name,
            bytesize::ByteSize::b(disk.size).to_string(),
            disk.disk_type.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string()),
            disk.model,
            if disk.system_disk { "*" } else { "" }
        );
    }
    Ok(())
}

async fn run_kubeconfig(args: KubeconfigArgs) -> anyhow::Result<()> {
    let (target, identity, options) = node_context(&args.node)?;
    let readiness = HttpsReadiness::new();
    let wait = args.wait.then_some(&readiness as &dyn ApiReadiness);
    let credentials = operations::retrieve_cluster_credentials(
        &Executor::grpc(),
        &target,
        &identity,
        wait,
        &options,
    )
    .await?;

    info!(host = %credentials.client.host, "Retrieved kubeconfig");
    write_output(args.output.as_deref(), &credentials.kubeconfig)
}

fn node_context(args: &NodeArgs) -> anyhow::Result<(NodeTarget, ClientIdentity, ExecuteOptions)> {
    let mut target = NodeTarget::new(&args.endpoint);
    if let Some(node) = &args.node {
        target = target.with_node(node);
    }

    let (secrets, _) = load_secrets(&args.secrets)?;
    let identity = secrets.client_identity(&SystemClock)?;

    let options = ExecuteOptions::with_timeout(args.timeout.unwrap_or(DEFAULT_OPERATION_TIMEOUT));
    let cancel = options.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    Ok((target, identity, options))
}

fn load_secrets(path: &Path) -> anyhow::Result<(SecretsBundle, Option<VersionContract>)> {
    let raw = std::fs::read(path)
        .with_context(|| format!("failed to read secrets bundle {}", path.display()))?;
    Ok(SecretsBundle::import_legacy(&raw)?)
}

fn load_patch_sources(patches: &[String]) -> anyhow::Result<Vec<PatchSource>> {
    patches
        .iter()
        .map(|patch| match patch.strip_prefix('@') {
            Some(path) => std::fs::read_to_string(path)
                .map(PatchSource::Raw)
                .with_context(|| format!("failed to read patch file {path}")),
            None => Ok(PatchSource::Raw(patch.clone())),
        })
        .collect()
}

fn write_output(path: Option<&Path>, contents: &[u8]) -> anyhow::Result<()> {
    match path {
        Some(path) => {
            std::fs::write(path, contents)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "Wrote output");
        }
        None => {
            use std::io::Write;
            std::io::stdout().write_all(contents)?;
        }
    }
    Ok(())
}

/// Parse `90`, `90s`, `10m` or `1h`
fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let (digits, unit) = input
        .find(|c: char| !c.is_ascii_digit())
        .map_or((input, ""), |i| input.split_at(i));

    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {input:?}"))?;
    let scale = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => return Err(format!("invalid duration unit in {input:?}, expected s, m or h")),
    };
    let seconds = value
        .checked_mul(scale)
        .ok_or_else(|| format!("invalid duration {input:?}"))?;
    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_accept_units() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("m").is_err());
    }

    #[test]
    fn overflowing_durations_are_rejected() {
        let err = parse_duration(&format!("{}h", u64::MAX / 60)).unwrap_err();
        assert!(err.contains("invalid duration"), "{err}");
        assert!(parse_duration(&format!("{}m", u64::MAX)).is_err());
        assert!(parse_duration(&format!("{}s", u64::MAX)).is_ok());
    }
}
