//! Backup scheduler entrypoint
//!
//! Runs inside the workload's pods. Workloads whose pods are interchangeable
//! replicas (Deployment, ReplicaSet, ReplicationController) elect one pod to
//! schedule backups; every other kind schedules directly.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cadence_common::events::{actions, reasons, EventPublisher};
use cadence_common::leader_election::{LeaderElector, LeaseStore, LeadershipHandler};
use cadence_common::{Error, Result};

use crate::client::SchedulerKubeClient;
use crate::dispatcher::WorkloadKind;
use crate::executor::BackupExecutor;
use crate::invoker::InvokerKind;
use crate::options::ExtraOptions;
use crate::scheduler::{BackupAction, CheckAction, RunLock, SchedulerContext, CHECK_SCHEDULE};

/// Where the scheduler runs and what it backs up
#[derive(Clone, Debug)]
pub struct SchedulerOptions {
    /// Name of the backup invoker
    pub invoker_name: String,
    /// Kind of the backup invoker
    pub invoker_kind: InvokerKind,
    /// Namespace of the invoker and the workload
    pub namespace: String,
    /// Kind of the workload this pod belongs to
    pub workload_kind: String,
    /// Name of the workload this pod belongs to
    pub workload_name: String,
    /// This pod's name; the leader election identity
    pub pod_name: String,
    /// Node the pod runs on
    pub node_name: String,
    /// Prefix appended to the repository path for this workload
    pub smart_prefix: String,
    /// Process-level engine options
    pub extra: ExtraOptions,
}

impl SchedulerOptions {
    /// Object reference for events about the invoker
    pub fn invoker_ref(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some(self.invoker_kind.api_version().to_string()),
            kind: Some(self.invoker_kind.as_str().to_string()),
            name: Some(self.invoker_name.clone()),
            namespace: Some(self.namespace.clone()),
            ..Default::default()
        }
    }

    /// Lease the replicas of this workload compete for
    pub fn lease_name(&self) -> String {
        format!("cadence-lock-{}-{}", self.workload_kind, self.workload_name).to_lowercase()
    }

    fn needs_leader_election(&self) -> bool {
        WorkloadKind::from_kind(&self.workload_kind)
            .is_some_and(|kind| kind.runs_replicated_scheduler())
    }
}

/// Collaborators of the backup scheduler
#[derive(Clone)]
pub struct SchedulerDeps {
    /// Kubernetes reads and session creation
    pub client: Arc<dyn SchedulerKubeClient>,
    /// Backup engine
    pub executor: Arc<dyn BackupExecutor>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Lease store for leader election
    pub leases: Arc<dyn LeaseStore>,
    /// Process-wide run lock shared by every scheduler this process builds
    pub run_lock: RunLock,
}

/// Validate the invoker and register the backup and check schedules
pub async fn build_scheduler(
    options: &Arc<SchedulerOptions>,
    deps: &SchedulerDeps,
) -> Result<SchedulerContext> {
    let invoker = deps
        .client
        .get_invoker(options.invoker_kind, &options.namespace, &options.invoker_name)
        .await?
        .ok_or_else(|| {
            Error::configuration(
                &options.invoker_name,
                format!("{} {} not found", options.invoker_kind, options.invoker_name),
            )
        })?;

    let mut ctx = SchedulerContext::new().with_lock(deps.run_lock.clone());
    ctx.register(
        &invoker.schedule,
        Arc::new(BackupAction::new(options.clone(), deps.clone())),
    )?;

    if invoker.uses_repository() {
        deps.client
            .get_repository(&options.namespace, &invoker.repository)
            .await?
            .ok_or_else(|| {
                Error::configuration(
                    &invoker.name,
                    format!("Repository {} not found", invoker.repository),
                )
            })?;
        ctx.register(
            CHECK_SCHEDULE,
            Arc::new(CheckAction::new(options.clone(), deps.clone())),
        )?;
    }
    Ok(ctx)
}

async fn setup_or_report(
    options: &Arc<SchedulerOptions>,
    deps: &SchedulerDeps,
) -> Result<SchedulerContext> {
    match build_scheduler(options, deps).await {
        Ok(ctx) => Ok(ctx),
        Err(e) => {
            error!(invoker = %options.invoker_name, error = %e, "Backup scheduler setup failed");
            deps.events
                .warn(
                    &options.invoker_ref(),
                    reasons::FAILED_SETUP,
                    actions::SETUP,
                    format!("Failed to setup backup scheduler. Reason: {e}"),
                )
                .await;
            Err(e)
        }
    }
}

/// Starts the scheduler while this replica leads and stops it when it doesn't
struct SchedulerLeadership {
    options: Arc<SchedulerOptions>,
    deps: SchedulerDeps,
    shutdown: CancellationToken,
    running: Mutex<Option<CancellationToken>>,
}

#[async_trait]
impl LeadershipHandler for SchedulerLeadership {
    async fn on_acquire(&self) {
        let ctx = match setup_or_report(&self.options, &self.deps).await {
            Ok(ctx) => Arc::new(ctx),
            Err(_) => return,
        };
        let token = self.shutdown.child_token();
        tokio::spawn(ctx.run(token.clone()));
        let previous = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(token);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    async fn on_lose(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(token) = running {
            info!(pod = %self.options.pod_name, "Stopping backup scheduler after losing leadership");
            token.cancel();
        }
    }
}

/// Run the backup scheduler until `shutdown` is cancelled
pub async fn run_backup_scheduler(
    options: SchedulerOptions,
    deps: SchedulerDeps,
    shutdown: CancellationToken,
) -> Result<()> {
    let options = Arc::new(options);

    if !options.needs_leader_election() {
        info!(
            workload = %options.workload_name,
            kind = %options.workload_kind,
            "Starting backup scheduler without leader election"
        );
        let ctx = setup_or_report(&options, &deps).await?;
        Arc::new(ctx).run(shutdown).await;
        return Ok(());
    }

    if options.pod_name.is_empty() {
        return Err(Error::configuration(
            &options.invoker_name,
            "pod name is required for leader election",
        ));
    }

    let elector = LeaderElector::new(
        deps.leases.clone(),
        &options.lease_name(),
        &options.namespace,
        &options.pod_name,
    );
    let handler = Arc::new(SchedulerLeadership {
        options: options.clone(),
        deps,
        shutdown: shutdown.clone(),
        running: Mutex::new(None),
    });
    elector.run(handler, shutdown).await;
    warn!(pod = %options.pod_name, "Leader election stopped");
    Ok(())
}
