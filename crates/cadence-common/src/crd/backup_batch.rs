//! BackupBatch Custom Resource Definition
//!
//! A BackupBatch backs up several targets together under one schedule.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    BackupInvokerStatus, BackupTarget, Driver, RepositoryRef, RetentionPolicy, RuntimeSettings,
};

/// Specification for a BackupBatch
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cadence.dev",
    version = "v1beta1",
    kind = "BackupBatch",
    plural = "backupbatches",
    shortname = "bb",
    namespaced,
    status = "BackupInvokerStatus",
    printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Paused","type":"boolean","jsonPath":".spec.paused"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupBatchSpec {
    /// Repository receiving the snapshots
    #[serde(default)]
    pub repository: RepositoryRef,

    /// Cron schedule for backups
    pub schedule: String,

    /// Targets backed up together
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<BackupTarget>,

    /// Backup engine
    #[serde(default)]
    pub driver: Driver,

    /// Stop triggering new backups
    #[serde(default)]
    pub paused: bool,

    /// Pod and container overrides for pods Cadence creates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_settings: Option<RuntimeSettings>,

    /// Snapshot retention
    #[serde(default)]
    pub retention_policy: RetentionPolicy,
}
