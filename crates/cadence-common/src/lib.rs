//! Common types for Cadence: CRDs, errors, events, leader election and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod leader_election;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all Cadence custom resources
pub const CADENCE_GROUP: &str = "cadence.dev";

/// Namespace the operator runs in unless configured otherwise
pub const CADENCE_SYSTEM_NAMESPACE: &str = "cadence-system";

/// Finalizer placed on backup invokers until their owned resources are torn down
pub const INVOKER_FINALIZER: &str = "cadence.dev/backup-invoker";

/// Prefix for the CronJob (and its ServiceAccount) that triggers backup runs
pub const TRIGGER_PREFIX: &str = "cadence-trigger";

/// Name of the container inside the trigger CronJob
pub const TRIGGER_CONTAINER_NAME: &str = "cadence-trigger";

/// Label asking the job cleaner to delete a finished trigger Job
pub const LABEL_DELETE_JOB_ON_COMPLETION: &str = "cadence.dev/delete-job-on-completion";

/// Value for [`LABEL_DELETE_JOB_ON_COMPLETION`]
pub const ALLOW_DELETING_JOB_ON_COMPLETION: &str = "true";

/// Label identifying the managing component of a resource
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] for resources Cadence creates
pub const LABEL_MANAGED_BY_CADENCE: &str = "cadence";

/// Label carrying the resource name
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Annotation recording which invoker wants a backup sidecar on a workload
pub const ANNOTATION_BACKUP_INVOKER: &str = "cadence.dev/backup-invoker";

/// Field manager used for server-side apply and merge patches
pub const FIELD_MANAGER: &str = "cadence-operator";
