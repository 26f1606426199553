//! BackupConfiguration Custom Resource Definition
//!
//! A BackupConfiguration backs up a single target on a cron schedule into a
//! Repository in the same namespace.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    BackupInvokerStatus, BackupTarget, Driver, RepositoryRef, RetentionPolicy, RuntimeSettings,
};

/// Specification for a BackupConfiguration
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cadence.dev",
    version = "v1beta1",
    kind = "BackupConfiguration",
    plural = "backupconfigurations",
    shortname = "bc",
    namespaced,
    status = "BackupInvokerStatus",
    printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Paused","type":"boolean","jsonPath":".spec.paused"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfigurationSpec {
    /// Repository receiving the snapshots
    #[serde(default)]
    pub repository: RepositoryRef,

    /// Cron schedule for backups (e.g., "*/5 * * * *")
    pub schedule: String,

    /// What to back up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<BackupTarget>,

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
