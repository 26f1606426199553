//! Custom Resource Definitions for Cadence
//!
//! This module contains all CRD definitions used by the Cadence operator.

mod backup_batch;
mod backup_configuration;
mod backup_session;
mod repository;
mod types;

pub use backup_batch::{BackupBatch, BackupBatchSpec};
pub use backup_configuration::{BackupConfiguration, BackupConfigurationSpec};
pub use backup_session::{
    BackupSession, BackupSessionPhase, BackupSessionSpec, BackupSessionStatus, InvokerRef,
};
pub use repository::{
    providers, AzureSpec, Backend, GcsSpec, LocalSpec, Repository, RepositorySpec, S3Spec,
};
pub use types::{
    BackupInvokerStatus, BackupTarget, Condition, ConditionStatus, ContainerRuntimeSettings,
    Driver, PodRuntimeSettings, RepositoryRef, RetentionPolicy, RuntimeSettings, TargetRef,
};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

/// All CRDs served by Cadence, for manifest generation
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        BackupConfiguration::crd(),
        BackupBatch::crd(),
        Repository::crd(),
        BackupSession::crd(),
    ]
}
