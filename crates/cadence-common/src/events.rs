//! Kubernetes Event recording for Cadence controllers.
//!
//! Wraps `kube::runtime::events::Recorder` behind a trait so reconcilers and
//! the backup scheduler can report failures on the invoker (or the failing
//! object) without depending on a live API server in tests.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event about `resource_ref`.
    ///
    /// `reason` is a machine-readable code from [`reasons`], `action` one of
    /// [`actions`], `note` the human-readable message.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );

    /// Publish a Warning event
    async fn warn(&self, resource_ref: &ObjectReference, reason: &str, action: &str, note: String) {
        self.publish(resource_ref, EventType::Warning, reason, action, Some(note))
            .await
    }
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`.
    ///
    /// `instance` is the pod name when the publisher runs inside a workload
    /// replica (the backup scheduler sidecar).
    pub fn new(client: Client, controller_name: &str, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests and dry runs.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    // Invoker reconciliation
    /// Referenced Repository does not exist
    pub const REPOSITORY_NOT_FOUND: &str = "RepositoryNotFound";
    /// Repository's storage Secret does not exist
    pub const BACKEND_SECRET_NOT_FOUND: &str = "BackendSecretNotFound";
    /// A backup target workload does not exist
    pub const BACKUP_TARGET_NOT_FOUND: &str = "BackupTargetNotFound";
    /// The trigger CronJob could not be created or updated
    pub const TRIGGER_SCHEDULE_CREATION_FAILED: &str = "TriggerScheduleCreationFailed";
    /// The workload controller could not be asked to reprocess a target
    pub const WORKLOAD_CONTROLLER_TRIGGERING_FAILED: &str = "WorkloadControllerTriggeringFailed";

    // Backup scheduler
    /// Scheduler setup failed
    pub const FAILED_SETUP: &str = "FailedSetup";
    /// A scheduled backup failed
    pub const FAILED_BACKUP: &str = "FailedBackup";
    /// A repository integrity check failed
    pub const FAILED_TO_CHECK: &str = "FailedToCheck";
    /// A scheduled run was skipped because another run held the lock
    pub const BACKUP_SKIPPED: &str = "BackupSkipped";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Tearing down owned resources
    pub const DELETE: &str = "Delete";
    /// Taking a backup
    pub const BACKUP: &str = "Backup";
    /// Checking repository integrity
    pub const CHECK: &str = "Check";
    /// Preparing the backup environment
    pub const SETUP: &str = "Setup";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        assert_eq!(reasons::REPOSITORY_NOT_FOUND, "RepositoryNotFound");
        assert_eq!(
            reasons::TRIGGER_SCHEDULE_CREATION_FAILED,
            "TriggerScheduleCreationFailed"
        );
        assert_eq!(reasons::BACKUP_SKIPPED, "BackupSkipped");
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        let obj_ref = ObjectReference::default();
        publisher
            .warn(
                &obj_ref,
                reasons::FAILED_BACKUP,
                actions::BACKUP,
                "restic exited 1".to_string(),
            )
            .await;
    }
}
