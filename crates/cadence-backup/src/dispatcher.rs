//! Target dispatcher
//!
//! Routes "this target changed" notifications to the work queue of the
//! controller that owns the target's workload kind, and answers existence
//! checks from the same watch-synchronized caches. A dispatch table maps
//! each [`WorkloadKind`] to a [`WorkloadQueue`].

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use kube::api::{Api, DynamicObject};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, Resource};
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;
use tracing::debug;

use cadence_common::crd::TargetRef;
use cadence_common::kube_utils::build_api_resource;
use cadence_common::{Error, Result};

/// Workload kinds whose pods can carry a backup sidecar
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 DaemonSet
    DaemonSet,
    /// apps/v1 StatefulSet
    StatefulSet,
    /// v1 ReplicationController
    ReplicationController,
    /// apps/v1 ReplicaSet
    ReplicaSet,
    /// apps.openshift.io/v1 DeploymentConfig
    DeploymentConfig,
}

impl WorkloadKind {
    /// Every supported kind
    pub const ALL: [WorkloadKind; 6] = [
        Self::Deployment,
        Self::DaemonSet,
        Self::StatefulSet,
        Self::ReplicationController,
        Self::ReplicaSet,
        Self::DeploymentConfig,
    ];

    /// Parse a manifest kind string
    pub fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }

    /// Kind string as it appears in manifests
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::DaemonSet => "DaemonSet",
            Self::StatefulSet => "StatefulSet",
            Self::ReplicationController => "ReplicationController",
            Self::ReplicaSet => "ReplicaSet",
            Self::DeploymentConfig => "DeploymentConfig",
        }
    }

    /// apiVersion of the kind
    pub fn api_version(&self) -> &'static str {
        match self {
            Self::ReplicationController => "v1",
            Self::DeploymentConfig => "apps.openshift.io/v1",
            _ => "apps/v1",
        }
    }

    /// Whether several replicas of the workload run the backup scheduler at once
    ///
    /// Those replicas elect one active scheduler.
    pub fn runs_replicated_scheduler(&self) -> bool {
        matches!(
            self,
            Self::Deployment | Self::ReplicaSet | Self::ReplicationController
        )
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routes target notifications and existence checks
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TargetDispatcher: Send + Sync {
    /// Ask the owning workload controller to reprocess a target
    ///
    /// Unknown kinds, disabled kinds and objects missing from the cache are
    /// no-ops.
    async fn notify_target_changed(&self, kind: &str, namespace: &str, name: &str) -> Result<()>;

    /// Whether the target exists; never mutates anything
    async fn target_exists(&self, target: &TargetRef, namespace: &str) -> Result<bool>;
}

/// One workload kind's cache and work queue
pub trait WorkloadQueue: Send + Sync {
    /// Whether the object is in the cache
    ///
    /// Errors until the cache has completed its first list, so a cold cache
    /// never reports an existing object as missing.
    fn exists(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Queue the object for its controller; false if it is not cached
    fn enqueue(&self, namespace: &str, name: &str) -> Result<bool>;
}

/// [`WorkloadQueue`] over a reflector store and a controller trigger channel
pub struct TypedWorkloadQueue<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    store: Store<K>,
    tx: mpsc::UnboundedSender<ObjectRef<K>>,
    dyntype: K::DynamicType,
}

impl<K> TypedWorkloadQueue<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    /// Queue fed by `tx`, answering from `store`
    pub fn new(
        store: Store<K>,
        tx: mpsc::UnboundedSender<ObjectRef<K>>,
        dyntype: K::DynamicType,
    ) -> Self {
        Self { store, tx, dyntype }
    }

    fn object_ref(&self, namespace: &str, name: &str) -> ObjectRef<K> {
        ObjectRef::new_with(name, self.dyntype.clone()).within(namespace)
    }

    /// Whether the reflector has completed its initial list
    pub fn is_synced(&self) -> bool {
        store_synced(&self.store)
    }
}

/// Whether a reflector store has completed its initial list, without waiting
pub fn store_synced<K>(store: &Store<K>) -> bool
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    matches!(store.wait_until_ready().now_or_never(), Some(Ok(())))
}

impl<K> WorkloadQueue for TypedWorkloadQueue<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Clone + Eq + Hash + Send + Sync,
{
    fn exists(&self, namespace: &str, name: &str) -> Result<bool> {
        if !self.is_synced() {
            return Err(Error::internal_with_context(
                "dispatcher",
                "workload cache has not synced yet",
            ));
        }
        Ok(self.store.get(&self.object_ref(namespace, name)).is_some())
    }

    fn enqueue(&self, namespace: &str, name: &str) -> Result<bool> {
        let obj_ref = self.object_ref(namespace, name);
        if self.store.get(&obj_ref).is_none() {
            return Ok(false);
        }
        self.tx.send(obj_ref).map_err(|_| {
            Error::internal_with_context("dispatcher", "workload controller queue is closed")
        })?;
        Ok(true)
    }
}

/// Production dispatcher
pub struct WorkloadDispatcher {
    queues: HashMap<WorkloadKind, Arc<dyn WorkloadQueue>>,
    client: Option<Client>,
}

impl WorkloadDispatcher {
    /// Dispatcher with no queues
    ///
    /// With a client, targets of kinds without a queue are looked up through
    /// the API.
    pub fn new(client: Option<Client>) -> Self {
        Self {
            queues: HashMap::new(),
            client,
        }
    }

    /// Register the queue for a kind
    pub fn register(&mut self, kind: WorkloadKind, queue: Arc<dyn WorkloadQueue>) {
        self.queues.insert(kind, queue);
    }

    fn queue_for(&self, kind: &str) -> Option<&Arc<dyn WorkloadQueue>> {
        WorkloadKind::from_kind(kind).and_then(|k| self.queues.get(&k))
    }

    async fn lookup_via_api(&self, target: &TargetRef, namespace: &str) -> Result<bool> {
        let client = self.client.clone().ok_or_else(|| {
            Error::validation(format!(
                "no existence lookup available for backup target kind {}",
                target.kind
            ))
        })?;
        let ar = build_api_resource(&target.api_version, &target.kind);
        let api: Api<DynamicObject> = Api::namespaced_with(client, namespace, &ar);
        Ok(api.get_opt(&target.name).await?.is_some())
    }
}

#[async_trait]
impl TargetDispatcher for WorkloadDispatcher {
    async fn notify_target_changed(&self, kind: &str, namespace: &str, name: &str) -> Result<()> {
        let Some(queue) = self.queue_for(kind) else {
            debug!(kind = %kind, "No workload controller for kind, skipping notification");
            return Ok(());
        };
        if !queue.enqueue(namespace, name)? {
            debug!(kind = %kind, namespace = %namespace, name = %name, "Target not cached, skipping notification");
        }
        Ok(())
    }

    async fn target_exists(&self, target: &TargetRef, namespace: &str) -> Result<bool> {
        match self.queue_for(&target.kind) {
            Some(queue) => queue.exists(namespace, &target.name),
            None => self.lookup_via_api(target, namespace).await,
        }
    }
}

/// Shorthand used by the workload controllers for their trigger channel
pub fn workload_channel<K>() -> (
    mpsc::UnboundedSender<ObjectRef<K>>,
    mpsc::UnboundedReceiver<ObjectRef<K>>,
)
where
    K: Resource + Debug + 'static,
    K::DynamicType: Clone + Eq + Hash,
{
    mpsc::unbounded_channel()
}
