//! Controller runner - builds the controller futures the operator drives
//!
//! Invoker controllers are built first so their reflector stores can feed the
//! workload controllers' invoker cache. Each workload controller registers its
//! store and trigger channel with the dispatcher the invoker controllers use.
//! Invoker controllers only start once every workload cache has synced.

use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::ReplicationController;
use kube::api::DynamicObject;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio_stream::wrappers::UnboundedReceiverStream;

use cadence_backup::client::KubeBackupClient;
use cadence_backup::controller::{error_policy, reconcile, Context};
use cadence_backup::dispatcher::{workload_channel, TypedWorkloadQueue, WorkloadDispatcher, WorkloadKind};
use cadence_backup::trigger::TriggerScheduler;
use cadence_backup::workload::{
    reconcile_workload, workload_error_policy, InvokerCache, KubeWorkloadPatcher, WorkloadContext,
    WorkloadPatcher,
};
use cadence_common::crd::{BackupBatch, BackupConfiguration};
use cadence_common::events::KubeEventPublisher;
use cadence_common::kube_utils::build_api_resource;

use crate::config::OperatorConfig;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Reporting controller name on emitted events
const CONTROLLER_NAME: &str = "cadence-operator";

/// A controller future ready to be joined by the caller
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build every controller the operator runs
pub fn build_controllers(client: Client, config: &OperatorConfig) -> Vec<ControllerFuture> {
    let controller_config = ControllerConfig::default().concurrency(config.num_threads);

    let configurations = Controller::new(
        Api::<BackupConfiguration>::all(client.clone()),
        watcher_config(),
    )
    .owns(Api::<CronJob>::all(client.clone()), watcher_config())
    .with_config(controller_config.clone());

    let batches = Controller::new(Api::<BackupBatch>::all(client.clone()), watcher_config())
        .owns(Api::<CronJob>::all(client.clone()), watcher_config())
        .with_config(controller_config);

    let invokers = InvokerCache::new(configurations.store(), batches.store());
    let patcher: Arc<dyn WorkloadPatcher> = Arc::new(KubeWorkloadPatcher::new(client.clone()));
    let mut controllers: Vec<ControllerFuture> = Vec::new();

    let mut workloads = WorkloadControllers {
        invokers: &invokers,
        patcher: &patcher,
        dispatcher: WorkloadDispatcher::new(Some(client.clone())),
        cache_syncs: Vec::new(),
    };
    controllers.push(workloads.build(
        Api::<Deployment>::all(client.clone()),
        (),
        WorkloadKind::Deployment,
    ));
    controllers.push(workloads.build(
        Api::<DaemonSet>::all(client.clone()),
        (),
        WorkloadKind::DaemonSet,
    ));
    controllers.push(workloads.build(
        Api::<StatefulSet>::all(client.clone()),
        (),
        WorkloadKind::StatefulSet,
    ));
    controllers.push(workloads.build(
        Api::<ReplicationController>::all(client.clone()),
        (),
        WorkloadKind::ReplicationController,
    ));
    controllers.push(workloads.build(
        Api::<ReplicaSet>::all(client.clone()),
        (),
        WorkloadKind::ReplicaSet,
    ));
    if config.enable_deployment_config {
        let kind = WorkloadKind::DeploymentConfig;
        let ar = build_api_resource(kind.api_version(), kind.as_str());
        controllers.push(workloads.build(
            Api::<DynamicObject>::all_with(client.clone(), &ar),
            ar.clone(),
            kind,
        ));
    } else {
        tracing::info!("DeploymentConfig support disabled");
    }

    let WorkloadControllers {
        dispatcher,
        cache_syncs,
        ..
    } = workloads;

    let kube = Arc::new(KubeBackupClient::new(client.clone()));
    let ctx = Arc::new(Context::new(
        kube.clone(),
        Arc::new(dispatcher),
        Arc::new(TriggerScheduler::new(kube, config.trigger_config())),
        Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME, None)),
        config.max_num_requeues,
    ));

    tracing::info!("- BackupConfiguration controller");
    tracing::info!("- BackupBatch controller");

    let configurations = configurations
        .shutdown_on_signal()
        .run(
            reconcile::<BackupConfiguration>,
            error_policy::<BackupConfiguration>,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("BackupConfiguration"));
    let batches = batches
        .shutdown_on_signal()
        .run(reconcile::<BackupBatch>, error_policy::<BackupBatch>, ctx)
        .for_each(log_reconcile_result("BackupBatch"));

    // Target existence checks require synced workload caches
    controllers.push(Box::pin(async move {
        futures::future::join_all(cache_syncs).await;
        tracing::info!("Workload caches synced, starting invoker controllers");
        futures::future::join(configurations, batches).await;
    }));
    controllers
}

/// Shared inputs of the per-kind workload controllers, and what they register
struct WorkloadControllers<'a> {
    invokers: &'a InvokerCache,
    patcher: &'a Arc<dyn WorkloadPatcher>,
    dispatcher: WorkloadDispatcher,
    cache_syncs: Vec<ControllerFuture>,
}

impl WorkloadControllers<'_> {
    fn build<K>(&mut self, api: Api<K>, dyntype: K::DynamicType, kind: WorkloadKind) -> ControllerFuture
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::DynamicType: Clone + Eq + Hash + Debug + Unpin + Send + Sync,
    {
        let (tx, rx) = workload_channel::<K>();
        let controller = Controller::new_with(api, watcher_config(), dyntype.clone());
        let store = controller.store();
        self.dispatcher.register(
            kind,
            Arc::new(TypedWorkloadQueue::new(store.clone(), tx, dyntype)),
        );
        self.cache_syncs.push(Box::pin(async move {
            if store.wait_until_ready().await.is_err() {
                tracing::warn!(kind = %kind, "Workload cache closed before syncing");
            }
        }));
        let ctx = Arc::new(WorkloadContext::new(
            kind,
            self.invokers.clone(),
            self.patcher.clone(),
        ));

        tracing::info!("- {} workload controller", kind);
        Box::pin(
            controller
                .reconcile_on(UnboundedReceiverStream::new(rx))
                .shutdown_on_signal()
                .run(reconcile_workload::<K>, workload_error_policy::<K>, ctx)
                .for_each(log_reconcile_result(kind.as_str())),
        )
    }
}

fn log_reconcile_result<T: Debug, E: Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
