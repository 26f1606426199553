//! Backup invoker model
//!
//! BackupConfiguration and BackupBatch both drive one schedule over one or
//! more targets. The reconciler, trigger scheduler and backup scheduler work
//! on the normalized [`BackupInvoker`] so they never branch on the CRD kind.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use cadence_common::crd::{
    BackupBatch, BackupConfiguration, BackupInvokerStatus, BackupTarget, Driver, RetentionPolicy,
    RuntimeSettings, TargetRef,
};
use cadence_common::kube_utils::has_finalizer;
use cadence_common::{Error, Result, INVOKER_FINALIZER};

use crate::dispatcher::WorkloadKind;

/// Kinds of objects that invoke backups
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InvokerKind {
    /// A BackupConfiguration (single target)
    BackupConfiguration,
    /// A BackupBatch (several targets)
    BackupBatch,
}

impl InvokerKind {
    /// Kind string as it appears in manifests
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BackupConfiguration => "BackupConfiguration",
            Self::BackupBatch => "BackupBatch",
        }
    }

    /// apiVersion of the kind
    pub fn api_version(&self) -> &'static str {
        "cadence.dev/v1beta1"
    }
}

impl std::fmt::Display for InvokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InvokerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "BackupConfiguration" => Ok(Self::BackupConfiguration),
            "BackupBatch" => Ok(Self::BackupBatch),
            other => Err(Error::validation(format!(
                "unsupported backup invoker kind {other}"
            ))),
        }
    }
}

/// How a target's data is captured
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupModel {
    /// A sidecar inside the workload's pods runs the backup
    Sidecar,
    /// A separate Job runs the backup
    Job,
}

impl BackupModel {
    /// Model used for targets of the given kind
    pub fn for_kind(kind: &str) -> Self {
        if WorkloadKind::from_kind(kind).is_some() {
            Self::Sidecar
        } else {
            Self::Job
        }
    }
}

/// A target snapshot taken at reconciliation time
#[derive(Clone, Debug, PartialEq)]
pub struct TargetInfo {
    /// What to back up
    pub target: BackupTarget,
    /// How it is backed up
    pub model: BackupModel,
}

impl TargetInfo {
    fn new(target: BackupTarget) -> Self {
        let model = BackupModel::for_kind(&target.target_ref.kind);
        Self { target, model }
    }

    /// Reference to the target workload
    pub fn target_ref(&self) -> &TargetRef {
        &self.target.target_ref
    }
}

/// Normalized backup policy
#[derive(Clone, Debug, PartialEq)]
pub struct BackupInvoker {
    /// Which CRD this came from
    pub kind: InvokerKind,
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
    /// Object UID
    pub uid: String,
    /// metadata.generation at read time
    pub generation: Option<i64>,
    /// Labels propagated to resources created for this invoker
    pub labels: BTreeMap<String, String>,
    /// Targets, in declaration order
    pub targets: Vec<TargetInfo>,
    /// Name of the Repository receiving snapshots
    pub repository: String,
    /// Cron schedule
    pub schedule: String,
    /// Backup engine
    pub driver: Driver,
    /// No new backups are triggered while paused
    pub paused: bool,
    /// Pod and container overrides
    pub runtime_settings: RuntimeSettings,
    /// Snapshot retention
    pub retention_policy: RetentionPolicy,
    /// Whether the Cadence finalizer is on the object
    pub finalizer_present: bool,
    /// Whether the object has a deletion timestamp
    pub deletion_requested: bool,
    /// Status at read time
    pub status: BackupInvokerStatus,
}

/// Spec fields shared by the invoker kinds
struct InvokerFields<'a> {
    repository: &'a str,
    schedule: &'a str,
    driver: Driver,
    paused: bool,
    runtime_settings: Option<&'a RuntimeSettings>,
    retention_policy: &'a RetentionPolicy,
    targets: Vec<BackupTarget>,
}

impl BackupInvoker {
    fn from_parts(
        kind: InvokerKind,
        meta: &ObjectMeta,
        fields: InvokerFields<'_>,
        status: Option<&BackupInvokerStatus>,
    ) -> Result<Self> {
        let name = meta
            .name
            .clone()
            .ok_or_else(|| Error::validation(format!("{kind} has no name")))?;
        let namespace = meta
            .namespace
            .clone()
            .ok_or_else(|| Error::validation_for_field(&name, "metadata.namespace", "missing"))?;
        let uid = meta
            .uid
            .clone()
            .ok_or_else(|| Error::validation_for_field(&name, "metadata.uid", "missing"))?;

        Ok(Self {
            kind,
            name,
            namespace,
            uid,
            generation: meta.generation,
            labels: meta.labels.clone().unwrap_or_default(),
            targets: fields.targets.into_iter().map(TargetInfo::new).collect(),
            repository: fields.repository.to_string(),
            schedule: fields.schedule.to_string(),
            driver: fields.driver,
            paused: fields.paused,
            runtime_settings: fields.runtime_settings.cloned().unwrap_or_default(),
            retention_policy: fields.retention_policy.clone(),
            finalizer_present: has_finalizer(meta, INVOKER_FINALIZER),
            deletion_requested: meta.deletion_timestamp.is_some(),
            status: status.cloned().unwrap_or_default(),
        })
    }

    /// `<namespace>/<name>` key used in logs and queues
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Whether the driver stores data in a Repository
    pub fn uses_repository(&self) -> bool {
        self.driver.uses_repository()
    }

    /// Owner reference making the invoker the controller of a resource
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.kind.api_version().to_string(),
            kind: self.kind.as_str().to_string(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Object reference for events about the invoker
    pub fn object_ref(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some(self.kind.api_version().to_string()),
            kind: Some(self.kind.as_str().to_string()),
            name: Some(self.name.clone()),
            namespace: Some(self.namespace.clone()),
            uid: Some(self.uid.clone()),
            ..Default::default()
        }
    }

    /// Whether a target of this invoker is the given workload
    pub fn targets_workload(&self, kind: &str, name: &str) -> bool {
        self.targets
            .iter()
            .any(|t| t.target_ref().kind == kind && t.target_ref().name == name)
    }
}

/// A CRD that can be normalized into a [`BackupInvoker`]
pub trait InvokerResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + DeserializeOwned
    + Serialize
    + std::fmt::Debug
    + Send
    + Sync
    + 'static
{
    /// Kind of this resource
    const INVOKER_KIND: InvokerKind;

    /// Normalize into an invoker
    fn to_invoker(&self) -> Result<BackupInvoker>;
}

impl InvokerResource for BackupConfiguration {
    const INVOKER_KIND: InvokerKind = InvokerKind::BackupConfiguration;

    fn to_invoker(&self) -> Result<BackupInvoker> {
        let spec = &self.spec;
        BackupInvoker::from_parts(
            Self::INVOKER_KIND,
            &self.metadata,
            InvokerFields {
                repository: &spec.repository.name,
                schedule: &spec.schedule,
                driver: spec.driver,
                paused: spec.paused,
                runtime_settings: spec.runtime_settings.as_ref(),
                retention_policy: &spec.retention_policy,
                targets: spec.target.iter().cloned().collect(),
            },
            self.status.as_ref(),
        )
    }
}

impl InvokerResource for BackupBatch {
    const INVOKER_KIND: InvokerKind = InvokerKind::BackupBatch;

    fn to_invoker(&self) -> Result<BackupInvoker> {
        let spec = &self.spec;
        BackupInvoker::from_parts(
            Self::INVOKER_KIND,
            &self.metadata,
            InvokerFields {
                repository: &spec.repository.name,
                schedule: &spec.schedule,
                driver: spec.driver,
                paused: spec.paused,
                runtime_settings: spec.runtime_settings.as_ref(),
                retention_policy: &spec.retention_policy,
                targets: spec.members.clone(),
            },
            self.status.as_ref(),
        )
    }
}

/// Normalize a list of invokers, skipping (and logging) malformed ones
pub fn normalize_all<K: InvokerResource>(objects: &[std::sync::Arc<K>]) -> Vec<BackupInvoker> {
    objects
        .iter()
        .filter_map(|obj| match obj.to_invoker() {
            Ok(inv) => Some(inv),
            Err(e) => {
                tracing::debug!(invoker = %obj.name_any(), error = %e, "Skipping malformed invoker");
                None
            }
        })
        .collect()
}
