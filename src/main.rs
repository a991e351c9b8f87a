use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use logs_collector_k8s::backend::{ClusterBackend, KubeBackend};
use logs_collector_k8s::collector::{
    find_collector_resources, CancelHandle, CancelSignal, CheckpointCleaner, CleanupOptions,
    CollectorGuid, LogsCollectorProvisioner, PollPolicy, ResourceRef,
};
use logs_collector_k8s::settings::Settings;
use serde::Serialize;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deploy a logs collector and wait until it is ready
    Provision(ProvisionArgs),
    /// Wipe the checkpoint database of a running logs collector
    Clean(CleanArgs),
    /// Remove every resource of a logs collector
    Destroy(DestroyArgs),
    /// Show version and build information
    Version,
}

#[derive(Parser, Debug)]
struct ProvisionArgs {
    /// Settings file (YAML)
    #[arg(long, env = "LOGS_COLLECTOR_SETTINGS")]
    settings: PathBuf,
}

#[derive(Parser, Debug)]
struct CleanArgs {
    /// Namespace of the collector daemon set
    #[arg(long, env = "LOGS_COLLECTOR_NAMESPACE")]
    namespace: String,

    /// Name of the collector daemon set
    #[arg(long)]
    daemon_set: String,

    /// Seconds to wait for evicted pods to terminate
    #[arg(long, default_value_t = 300)]
    termination_timeout_secs: u64,

    /// Seconds to wait for a node cleanup command
    #[arg(long, default_value_t = 120)]
    node_command_timeout_secs: u64,
}

#[derive(Parser, Debug)]
struct DestroyArgs {
    /// Collector id printed by `provision`
    #[arg(long)]
    collector_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProvisionSummary {
    collector_id: String,
    provisioned_at: DateTime<Utc>,
    resources: Vec<ResourceRef>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Commands::Version = args.command {
        println!("Logs-Collector-K8s v{}", env!("CARGO_PKG_VERSION"));
        println!("Build Date: {}", env!("BUILD_DATE"));
        return Ok(());
    }

    init_tracing(args.log_format);

    let client = kube::Client::try_default()
        .await
        .context("failed to connect to the Kubernetes cluster")?;
    info!("Connected to Kubernetes cluster");

    let (handle, cancel) = CancelSignal::pair();
    tokio::spawn(cancel_on_ctrl_c(handle));

    match args.command {
        Commands::Provision(provision_args) => {
            run_provision(KubeBackend::new(client), provision_args, &cancel).await
        }
        Commands::Clean(clean_args) => {
            let backend = KubeBackend::new(client).with_node_command_timeout(Duration::from_secs(
                clean_args.node_command_timeout_secs,
            ));
            run_clean(backend, clean_args, &cancel).await
        }
        Commands::Destroy(destroy_args) => {
            run_destroy(KubeBackend::new(client), destroy_args).await
        }
        Commands::Version => Ok(()),
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

async fn cancel_on_ctrl_c(handle: CancelHandle) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            warn!("Interrupt received, cancelling");
            handle.cancel();
        }
        Err(e) => error!("Failed to listen for interrupt: {}", e),
    }
}

async fn run_provision(
    backend: KubeBackend,
    args: ProvisionArgs,
    cancel: &CancelSignal,
) -> anyhow::Result<()> {
    let settings = Settings::load(&args.settings)
        .with_context(|| format!("failed to load settings from {:?}", args.settings))?;

    let backend: Arc<dyn ClusterBackend> = Arc::new(backend);
    let provisioner = LogsCollectorProvisioner::new(backend)?
        .with_readiness(settings.poll_policy()?)
        .with_image(settings.image.clone());

    let collector = provisioner
        .provision(&settings.provision_params(), cancel)
        .await
        .context("failed to provision logs collector")?;

    let summary = ProvisionSummary {
        collector_id: collector.guid.to_string(),
        provisioned_at: Utc::now(),
        resources: collector.resources.refs(),
    };
    print!("{}", serde_yaml::to_string(&summary)?);
    Ok(())
}

async fn run_clean(
    backend: KubeBackend,
    args: CleanArgs,
    cancel: &CancelSignal,
) -> anyhow::Result<()> {
    let options = CleanupOptions {
        termination_timeout: Duration::from_secs(args.termination_timeout_secs),
        readiness: PollPolicy::default(),
    };
    let cleaner = CheckpointCleaner::new(Arc::new(backend)).with_options(options);

    let report = cleaner
        .clean_by_name(&args.namespace, &args.daemon_set, cancel)
        .await
        .with_context(|| format!("failed to clean daemon set {}", args.daemon_set))?;

    println!(
        "Cleared checkpoint db on {} node(s): {}",
        report.nodes.len(),
        report.nodes.join(", ")
    );
    Ok(())
}

async fn run_destroy(backend: KubeBackend, args: DestroyArgs) -> anyhow::Result<()> {
    let guid = CollectorGuid::new(args.collector_id);
    let teardown = find_collector_resources(Arc::new(backend), &guid).await?;
    if teardown.resources().is_empty() {
        warn!("No resources found for logs collector {}", guid);
        return Ok(());
    }

    let report = teardown.run().await;
    println!("Removed {} resource(s)", report.removed.len());
    if !report.is_clean() {
        for orphan in &report.orphaned {
            eprintln!("{orphan}");
        }
        anyhow::bail!(
            "{} resource(s) of logs collector {} require manual removal",
            report.orphaned.len(),
            guid
        );
    }
    Ok(())
}
