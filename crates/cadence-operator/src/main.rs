//! Cadence - Kubernetes backup operator

use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use cadence_backup::client::KubeBackupClient;
use cadence_backup::executor::ResticCli;
use cadence_backup::scheduler::RunLock;
use cadence_backup::session::create_backup_run;
use cadence_backup::sidecar::{run_backup_scheduler, SchedulerDeps};
use cadence_common::events::KubeEventPublisher;
use cadence_common::leader_election::KubeLeaseStore;
use cadence_common::telemetry::{init_telemetry, TelemetryConfig};

use cadence_operator::config::{CreateBackupRunArgs, OperatorConfig, SchedulerArgs};
use cadence_operator::controller_runner::build_controllers;
use cadence_operator::startup::{crd_manifests, ensure_crds_installed};

/// Cadence - CRD-driven scheduled backups for Kubernetes workloads
#[derive(Parser, Debug)]
#[command(name = "cadence", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    ///
    /// Watches BackupConfigurations and BackupBatches, verifies their
    /// dependencies, keeps their trigger CronJobs in place and marks the
    /// workloads that need a backup sidecar.
    Run(OperatorConfig),

    /// Run the in-pod backup scheduler for one invoker
    BackupScheduler(SchedulerArgs),

    /// Create a BackupSession for an invoker (run by trigger CronJobs)
    CreateBackupRun(CreateBackupRunArgs),

    /// Print all CRD manifests and exit
    Crd,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Crd => {
            print!("{}", crd_manifests()?);
            Ok(())
        }
        Commands::Run(config) => run_operator(config).await,
        Commands::BackupScheduler(args) => run_scheduler(args).await,
        Commands::CreateBackupRun(args) => run_create_backup_run(args).await,
    }
}

async fn run_operator(config: OperatorConfig) -> anyhow::Result<()> {
    let _telemetry = init_telemetry(
        TelemetryConfig::for_service("cadence-operator")
            .with_attribute("cadence.namespace", config.operator_namespace.clone()),
    )?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Cadence operator");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {e}"))?;

    ensure_crds_installed(&client).await?;

    tracing::info!("Starting controllers:");
    let controllers = build_controllers(client, &config);
    futures::future::join_all(controllers).await;

    tracing::info!("Cadence operator shutting down");
    Ok(())
}

async fn run_scheduler(args: SchedulerArgs) -> anyhow::Result<()> {
    let _telemetry = init_telemetry(
        TelemetryConfig::for_service("cadence-backup-scheduler")
            .with_attribute("cadence.invoker", args.invoker_name.clone())
            .with_attribute("cadence.workload", args.workload_name.clone()),
    )?;

    let options = args.to_options();
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {e}"))?;

    let instance = (!options.pod_name.is_empty()).then(|| options.pod_name.clone());
    let deps = SchedulerDeps {
        client: Arc::new(KubeBackupClient::new(client.clone())),
        executor: Arc::new(ResticCli::new(args.restic_binary.clone(), options.extra.clone())),
        events: Arc::new(KubeEventPublisher::new(
            client.clone(),
            "cadence-backup-scheduler",
            instance,
        )),
        leases: Arc::new(KubeLeaseStore::new(client, &options.namespace)),
        run_lock: RunLock::new(),
    };

    run_backup_scheduler(options, deps, shutdown_on_signal()?).await?;
    tracing::info!("Backup scheduler stopped");
    Ok(())
}

async fn run_create_backup_run(args: CreateBackupRunArgs) -> anyhow::Result<()> {
    let _telemetry = init_telemetry(
        TelemetryConfig::for_service("cadence-trigger")
            .with_attribute("cadence.invoker", args.invoker_name.clone()),
    )?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {e}"))?;
    let kube = KubeBackupClient::new(client);

    create_backup_run(&kube, args.invoker_kind, &args.namespace, &args.invoker_name).await?;
    Ok(())
}

/// Token cancelled on the first SIGTERM or SIGINT
fn shutdown_on_signal() -> anyhow::Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down"),
        }
        cancel.cancel();
    });
    Ok(token)
}
