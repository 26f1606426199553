//! Workload controllers
//!
//! One controller per [`WorkloadKind`], fed by the target dispatcher's queue.
//! Reconciling a workload records which invoker backs it up with a sidecar
//! in the `cadence.dev/backup-invoker` annotation. The admission webhook that
//! injects the sidecar container keys off that annotation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::reflector::Store;
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use cadence_common::crd::{BackupBatch, BackupConfiguration};
use cadence_common::kube_utils::build_api_resource;
use cadence_common::{Error, Result, ANNOTATION_BACKUP_INVOKER};

use crate::dispatcher::{store_synced, WorkloadKind};
use crate::invoker::{normalize_all, BackupInvoker, BackupModel};

/// Periodic resync so a missed invoker notification is eventually corrected
const RESYNC_SECS: u64 = 300;
const RETRY_SECS: u64 = 5;

/// Watch-synchronized view of both invoker kinds
#[derive(Clone)]
pub struct InvokerCache {
    configurations: Store<BackupConfiguration>,
    batches: Store<BackupBatch>,
}

impl InvokerCache {
    /// Cache over the invoker controllers' stores
    pub fn new(configurations: Store<BackupConfiguration>, batches: Store<BackupBatch>) -> Self {
        Self {
            configurations,
            batches,
        }
    }

    /// Every cached invoker, normalized
    pub fn invokers(&self) -> Vec<BackupInvoker> {
        let mut all = normalize_all(&self.configurations.state());
        all.extend(normalize_all(&self.batches.state()));
        all
    }

    /// Whether both invoker reflectors have completed their initial list
    pub fn is_synced(&self) -> bool {
        store_synced(&self.configurations) && store_synced(&self.batches)
    }
}

/// Annotation value for a workload: `<InvokerKind>/<name>` of the invoker
/// that backs it up with a sidecar, if any
///
/// Invokers being deleted and drivers without a repository never claim a
/// workload. When several invokers claim the same workload the smallest
/// value wins so the result is stable.
pub fn desired_invoker_annotation(
    kind: WorkloadKind,
    namespace: &str,
    name: &str,
    invokers: &[BackupInvoker],
) -> Option<String> {
    invokers
        .iter()
        .filter(|inv| inv.namespace == namespace)
        .filter(|inv| !inv.deletion_requested && inv.uses_repository())
        .filter(|inv| {
            inv.targets.iter().any(|t| {
                t.model == BackupModel::Sidecar
                    && t.target_ref().kind == kind.as_str()
                    && t.target_ref().name == name
            })
        })
        .map(|inv| format!("{}/{}", inv.kind, inv.name))
        .min()
}

/// Writes the invoker annotation on workloads
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadPatcher: Send + Sync {
    /// Set (`Some`) or remove (`None`) the invoker annotation
    async fn set_invoker_annotation(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        value: Option<String>,
    ) -> Result<()>;
}

/// Merge-patches workloads through the dynamic API
pub struct KubeWorkloadPatcher {
    client: Client,
}

impl KubeWorkloadPatcher {
    /// Wrap a kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadPatcher for KubeWorkloadPatcher {
    async fn set_invoker_annotation(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        value: Option<String>,
    ) -> Result<()> {
        let ar = build_api_resource(kind.api_version(), kind.as_str());
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let patch = json!({
            "metadata": {
                "annotations": { ANNOTATION_BACKUP_INVOKER: value }
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Shared state of one workload controller
pub struct WorkloadContext {
    /// Kind this controller reconciles
    pub kind: WorkloadKind,
    /// Cached invokers
    pub invokers: InvokerCache,
    /// Annotation writer
    pub patcher: Arc<dyn WorkloadPatcher>,
}

impl WorkloadContext {
    /// Create a context
    pub fn new(kind: WorkloadKind, invokers: InvokerCache, patcher: Arc<dyn WorkloadPatcher>) -> Self {
        Self {
            kind,
            invokers,
            patcher,
        }
    }
}

/// Reconcile one workload's invoker annotation
#[instrument(skip(obj, ctx), fields(kind = %ctx.kind, workload = %obj.name_any()))]
pub async fn reconcile_workload<K>(obj: Arc<K>, ctx: Arc<WorkloadContext>) -> Result<Action>
where
    K: Resource + Send + Sync + 'static,
{
    let name = obj.name_any();
    let namespace = obj
        .namespace()
        .ok_or_else(|| Error::validation(format!("{} {name} has no namespace", ctx.kind)))?;

    if !ctx.invokers.is_synced() {
        debug!(namespace = %namespace, "Invoker cache not synced yet, retrying later");
        return Ok(Action::requeue(Duration::from_secs(RETRY_SECS)));
    }

    let current = obj.annotations().get(ANNOTATION_BACKUP_INVOKER).cloned();
    let desired =
        desired_invoker_annotation(ctx.kind, &namespace, &name, &ctx.invokers.invokers());

    if current != desired {
        info!(
            namespace = %namespace,
            from = ?current,
            to = ?desired,
            "Updating backup invoker annotation"
        );
        ctx.patcher
            .set_invoker_annotation(ctx.kind, &namespace, &name, desired)
            .await?;
    }

    Ok(Action::requeue(Duration::from_secs(RESYNC_SECS)))
}

/// Error policy of the workload controllers
pub fn workload_error_policy<K>(obj: Arc<K>, error: &Error, ctx: Arc<WorkloadContext>) -> Action
where
    K: Resource,
{
    warn!(kind = %ctx.kind, workload = %obj.name_any(), error = %error, "Workload reconciliation failed");
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(RETRY_SECS))
    } else {
        Action::await_change()
    }
}
