//! Scheduled backup and check runs
//!
//! Both actions compete for the process [`RunLock`]. A firing that finds the
//! lock held is dropped, not queued; the next tick tries again.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use kube::Resource;
use tracing::{debug, error, info, instrument};

use cadence_common::crd::Repository;
use cadence_common::events::{actions, reasons};
use cadence_common::{Error, Result};

use crate::invoker::BackupInvoker;
use crate::options::backup_options_for_target;
use crate::sidecar::{SchedulerDeps, SchedulerOptions};

use super::lock::RunLock;

/// What happened to one firing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The run executed to completion
    Completed,
    /// Another run held the lock
    Skipped,
    /// Nothing to run (invoker gone, paused, or no repository)
    NothingToDo,
    /// The run failed; an event was published
    Failed,
}

/// An action fired on a cron schedule
#[async_trait]
pub trait ScheduledAction: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Run once under `lock`
    async fn fire(&self, lock: &RunLock) -> RunOutcome;
}

/// Takes a backup of the workload this process runs in
pub struct BackupAction {
    options: Arc<SchedulerOptions>,
    deps: SchedulerDeps,
}

impl BackupAction {
    /// Create the action
    pub fn new(options: Arc<SchedulerOptions>, deps: SchedulerDeps) -> Self {
        Self { options, deps }
    }

    async fn run(&self, lock: &RunLock) -> Result<RunOutcome> {
        let opts = &self.options;
        let Some(_guard) = lock.try_acquire() else {
            info!(invoker = %opts.invoker_name, "Another run is in progress, skipping backup");
            return Ok(RunOutcome::Skipped);
        };

        let Some(invoker) = self
            .deps
            .client
            .get_invoker(opts.invoker_kind, &opts.namespace, &opts.invoker_name)
            .await?
        else {
            info!(invoker = %opts.invoker_name, "Backup invoker no longer exists, skipping backup");
            return Ok(RunOutcome::NothingToDo);
        };

        if invoker.paused {
            self.deps
                .events
                .publish(
                    &invoker.object_ref(),
                    EventType::Normal,
                    reasons::BACKUP_SKIPPED,
                    actions::BACKUP,
                    Some("Backup invoker is paused.".to_string()),
                )
                .await;
            return Ok(RunOutcome::NothingToDo);
        }

        let repository = prepare_repository(opts, &self.deps, &invoker).await?;

        let target = invoker
            .targets
            .iter()
            .find(|t| {
                t.target_ref().kind == opts.workload_kind
                    && t.target_ref().name == opts.workload_name
            })
            .map(|t| &t.target);
        let backup = backup_options_for_target(target, &invoker.retention_policy, &opts.extra);

        self.deps
            .executor
            .run_backup(&backup, &repository)
            .await?;
        info!(invoker = %opts.invoker_name, host = %backup.host, "Backup completed");
        Ok(RunOutcome::Completed)
    }
}

#[async_trait]
impl ScheduledAction for BackupAction {
    fn name(&self) -> &'static str {
        "backup"
    }

    #[instrument(skip_all, fields(invoker = %self.options.invoker_name))]
    async fn fire(&self, lock: &RunLock) -> RunOutcome {
        match self.run(lock).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Scheduled backup failed");
                self.deps
                    .events
                    .warn(
                        &self.options.invoker_ref(),
                        reasons::FAILED_BACKUP,
                        actions::BACKUP,
                        format!("Failed to take backup. Reason: {e}"),
                    )
                    .await;
                RunOutcome::Failed
            }
        }
    }
}

/// Verifies the integrity of the invoker's repository
pub struct CheckAction {
    options: Arc<SchedulerOptions>,
    deps: SchedulerDeps,
}

impl CheckAction {
    /// Create the action
    pub fn new(options: Arc<SchedulerOptions>, deps: SchedulerDeps) -> Self {
        Self { options, deps }
    }

    async fn check(&self, lock: &RunLock, invoker: &BackupInvoker) -> Result<RunOutcome> {
        let opts = &self.options;
        if self
            .deps
            .client
            .get_repository(&opts.namespace, &invoker.repository)
            .await?
            .is_none()
        {
            debug!(repository = %invoker.repository, "Repository not found, skipping check");
            return Ok(RunOutcome::NothingToDo);
        }

        let Some(_guard) = lock.try_acquire() else {
            info!(repository = %invoker.repository, "Another run is in progress, skipping check");
            return Ok(RunOutcome::Skipped);
        };

        prepare_repository(opts, &self.deps, invoker).await?;
        self.deps.executor.run_check().await?;
        info!(repository = %invoker.repository, "Repository check completed");
        Ok(RunOutcome::Completed)
    }
}

#[async_trait]
impl ScheduledAction for CheckAction {
    fn name(&self) -> &'static str {
        "check"
    }

    #[instrument(skip_all, fields(invoker = %self.options.invoker_name))]
    async fn fire(&self, lock: &RunLock) -> RunOutcome {
        let opts = &self.options;
        let invoker = match self
            .deps
            .client
            .get_invoker(opts.invoker_kind, &opts.namespace, &opts.invoker_name)
            .await
        {
            Ok(Some(invoker)) => invoker,
            Ok(None) => return RunOutcome::NothingToDo,
            Err(e) => {
                error!(error = %e, "Failed to read backup invoker before check");
                return RunOutcome::Failed;
            }
        };
        if !invoker.uses_repository() {
            return RunOutcome::NothingToDo;
        }

        match self.check(lock, &invoker).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(repository = %invoker.repository, error = %e, "Repository check failed");
                self.deps
                    .events
                    .warn(
                        &repository_ref(&opts.namespace, &invoker.repository),
                        reasons::FAILED_TO_CHECK,
                        actions::CHECK,
                        format!("Repository check failed. Reason: {e}"),
                    )
                    .await;
                RunOutcome::Failed
            }
        }
    }
}

/// Resolve the repository and its credentials and make sure it is initialized
async fn prepare_repository(
    opts: &SchedulerOptions,
    deps: &SchedulerDeps,
    invoker: &BackupInvoker,
) -> Result<Repository> {
    let repository = deps
        .client
        .get_repository(&opts.namespace, &invoker.repository)
        .await?
        .ok_or_else(|| {
            Error::configuration(
                &invoker.name,
                format!("Repository {} not found", invoker.repository),
            )
        })?;

    let secret_name = &repository.spec.backend.storage_secret_name;
    if secret_name.is_empty() {
        return Err(Error::configuration(
            &invoker.name,
            "missing repository secret name",
        ));
    }
    let secret = deps
        .client
        .get_secret(&opts.namespace, secret_name)
        .await?
        .ok_or_else(|| {
            Error::configuration(&invoker.name, format!("Secret {secret_name} not found"))
        })?;

    let prefix = deps
        .executor
        .setup_environment(&repository, &secret, &opts.smart_prefix)
        .await?;
    debug!(prefix = %prefix, "Backup environment ready");

    deps.executor.init_repository_if_absent().await?;
    Ok(repository)
}

fn repository_ref(namespace: &str, name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some(Repository::api_version(&()).into_owned()),
        kind: Some(Repository::kind(&()).into_owned()),
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    use cadence_common::crd::{Backend, GcsSpec, RepositorySpec};
    use cadence_common::events::EventPublisher;
    use cadence_common::leader_election::InMemoryLeaseStore;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use crate::client::MockSchedulerKubeClient;
    use crate::executor::MockBackupExecutor;
    use crate::invoker::tests::sample_invoker;
    use crate::invoker::InvokerKind;

    /// Events captured for assertions
    #[derive(Default)]
    pub(crate) struct RecordingEvents {
        events: Mutex<Vec<(String, EventType, String)>>,
    }

    impl RecordingEvents {
        /// (object kind, type, reason) of every published event
        pub(crate) fn recorded(&self) -> Vec<(String, EventType, String)> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingEvents {
        async fn publish(
            &self,
            resource_ref: &ObjectReference,
            type_: EventType,
            reason: &str,
            _action: &str,
            _note: Option<String>,
        ) {
            self.events.lock().unwrap().push((
                resource_ref.kind.clone().unwrap_or_default(),
                type_,
                reason.to_string(),
            ));
        }
    }

    pub(crate) fn scheduler_options() -> SchedulerOptions {
        SchedulerOptions {
            invoker_name: "nightly".to_string(),
            invoker_kind: InvokerKind::BackupConfiguration,
            namespace: "demo".to_string(),
            workload_kind: "Deployment".to_string(),
            workload_name: "web".to_string(),
            pod_name: "web-7d9f-abcde".to_string(),
            node_name: "node-1".to_string(),
            smart_prefix: "demo/deployment/web".to_string(),
            extra: Default::default(),
        }
    }

    pub(crate) fn gcs_repository() -> Repository {
        Repository::new(
            "gcs-repo",
            RepositorySpec {
                backend: Backend {
                    storage_secret_name: "gcs-creds".to_string(),
                    gcs: Some(GcsSpec {
                        bucket: "backups".to_string(),
                        prefix: "demo".to_string(),
                        max_connections: None,
                    }),
                    ..Default::default()
                },
                wipe_out: false,
            },
        )
    }

    pub(crate) fn backend_secret() -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("gcs-creds".to_string()),
                namespace: Some("demo".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Client where invoker, repository and secret all exist
    pub(crate) fn healthy_client(paused: bool) -> MockSchedulerKubeClient {
        let mut client = MockSchedulerKubeClient::new();
        client.expect_get_invoker().returning(move |kind, ns, name| {
            assert_eq!(kind, InvokerKind::BackupConfiguration);
            assert_eq!(ns, "demo");
            let mut invoker = sample_invoker(name);
            invoker.paused = paused;
            Ok(Some(invoker))
        });
        client
            .expect_get_repository()
            .returning(|_, _| Ok(Some(gcs_repository())));
        client
            .expect_get_secret()
            .returning(|_, name| {
                assert_eq!(name, "gcs-creds");
                Ok(Some(backend_secret()))
            });
        client
    }

    pub(crate) fn deps(
        client: MockSchedulerKubeClient,
        executor: MockBackupExecutor,
        events: Arc<RecordingEvents>,
    ) -> SchedulerDeps {
        SchedulerDeps {
            client: Arc::new(client),
            executor: Arc::new(executor),
            events,
            leases: Arc::new(InMemoryLeaseStore::new()),
            run_lock: RunLock::new(),
        }
    }

    fn ready_executor() -> MockBackupExecutor {
        let mut executor = MockBackupExecutor::new();
        executor
            .expect_setup_environment()
            .returning(|_, _, prefix| Ok(format!("backups/demo/{prefix}")));
        executor
            .expect_init_repository_if_absent()
            .returning(|| Ok(()));
        executor
    }

    fn backup_action(deps: SchedulerDeps) -> BackupAction {
        BackupAction::new(Arc::new(scheduler_options()), deps)
    }

    fn check_action(deps: SchedulerDeps) -> CheckAction {
        CheckAction::new(Arc::new(scheduler_options()), deps)
    }

    // ========================================================================
    // Backup action
    // ========================================================================

    #[tokio::test]
    async fn story_backup_runs_with_workload_target_options() {
        let mut executor = ready_executor();
        executor
            .expect_run_backup()
            .times(1)
            .returning(|opts, repo| {
                assert_eq!(opts.backup_paths, vec!["/data"]);
                assert_eq!(repo.spec.backend.storage_secret_name, "gcs-creds");
                Ok(())
            });
        let events = Arc::new(RecordingEvents::default());
        let action = backup_action(deps(healthy_client(false), executor, events.clone()));
        let lock = RunLock::new();

        assert_eq!(action.fire(&lock).await, RunOutcome::Completed);
        assert!(!lock.is_held(), "lock must be released after the run");
        assert!(events.recorded().is_empty());
    }

    #[tokio::test]
    async fn story_backup_skipped_while_lock_held() {
        // No expectations: any client or executor call panics
        let events = Arc::new(RecordingEvents::default());
        let action = backup_action(deps(
            MockSchedulerKubeClient::new(),
            MockBackupExecutor::new(),
            events.clone(),
        ));
        let lock = RunLock::new();
        let _held = lock.try_acquire().unwrap();

        assert_eq!(action.fire(&lock).await, RunOutcome::Skipped);
        assert!(events.recorded().is_empty());
    }

    #[tokio::test]
    async fn story_paused_invoker_never_backs_up() {
        let events = Arc::new(RecordingEvents::default());
        let action = backup_action(deps(
            healthy_client(true),
            MockBackupExecutor::new(),
            events.clone(),
        ));

        assert_eq!(action.fire(&RunLock::new()).await, RunOutcome::NothingToDo);
        assert_eq!(
            events.recorded(),
            vec![(
                "BackupConfiguration".to_string(),
                EventType::Normal,
                reasons::BACKUP_SKIPPED.to_string()
            )]
        );
    }

    #[tokio::test]
    async fn story_deleted_invoker_is_not_an_error() {
        let mut client = MockSchedulerKubeClient::new();
        client.expect_get_invoker().returning(|_, _, _| Ok(None));
        let events = Arc::new(RecordingEvents::default());
        let action = backup_action(deps(client, MockBackupExecutor::new(), events.clone()));

        assert_eq!(action.fire(&RunLock::new()).await, RunOutcome::NothingToDo);
        assert!(events.recorded().is_empty());
    }

    #[tokio::test]
    async fn story_missing_secret_name_fails_with_event() {
        let mut client = MockSchedulerKubeClient::new();
        client
            .expect_get_invoker()
            .returning(|_, _, name| Ok(Some(sample_invoker(name))));
        client.expect_get_repository().returning(|_, _| {
            let mut repo = gcs_repository();
            repo.spec.backend.storage_secret_name.clear();
            Ok(Some(repo))
        });
        let events = Arc::new(RecordingEvents::default());
        let lock = RunLock::new();
        let action = backup_action(deps(client, MockBackupExecutor::new(), events.clone()));

        assert_eq!(action.fire(&lock).await, RunOutcome::Failed);
        assert!(!lock.is_held(), "lock must be released on failure");
        assert_eq!(
            events.recorded(),
            vec![(
                "BackupConfiguration".to_string(),
                EventType::Warning,
                reasons::FAILED_BACKUP.to_string()
            )]
        );
    }

    #[tokio::test]
    async fn story_engine_failure_reports_failed_backup() {
        let mut executor = ready_executor();
        executor
            .expect_run_backup()
            .returning(|_, _| Err(Error::execution("backup", "restic exited with 1")));
        let events = Arc::new(RecordingEvents::default());
        let lock = RunLock::new();
        let action = backup_action(deps(healthy_client(false), executor, events.clone()));

        assert_eq!(action.fire(&lock).await, RunOutcome::Failed);
        assert!(!lock.is_held());
        assert_eq!(events.recorded()[0].2, reasons::FAILED_BACKUP);
    }

    // ========================================================================
    // Check action
    // ========================================================================

    #[tokio::test]
    async fn story_check_runs_against_repository() {
        let mut executor = ready_executor();
        executor.expect_run_check().times(1).returning(|| Ok(()));
        let events = Arc::new(RecordingEvents::default());
        let action = check_action(deps(healthy_client(false), executor, events.clone()));

        assert_eq!(action.fire(&RunLock::new()).await, RunOutcome::Completed);
        assert!(events.recorded().is_empty());
    }

    #[tokio::test]
    async fn story_check_skipped_while_backup_holds_lock() {
        let events = Arc::new(RecordingEvents::default());
        let action = check_action(deps(
            healthy_client(false),
            MockBackupExecutor::new(),
            events.clone(),
        ));
        let lock = RunLock::new();
        let _backup_running = lock.try_acquire().unwrap();

        assert_eq!(action.fire(&lock).await, RunOutcome::Skipped);
        assert!(events.recorded().is_empty());
    }

    #[tokio::test]
    async fn story_check_without_repository_does_nothing() {
        let mut client = MockSchedulerKubeClient::new();
        client
            .expect_get_invoker()
            .returning(|_, _, name| Ok(Some(sample_invoker(name))));
        client.expect_get_repository().returning(|_, _| Ok(None));
        let lock = RunLock::new();
        let action = check_action(deps(
            client,
            MockBackupExecutor::new(),
            Arc::new(RecordingEvents::default()),
        ));

        assert_eq!(action.fire(&lock).await, RunOutcome::NothingToDo);
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn story_check_failure_is_reported_on_repository() {
        let mut executor = ready_executor();
        executor
            .expect_run_check()
            .returning(|| Err(Error::execution("check", "pack corrupted")));
        let events = Arc::new(RecordingEvents::default());
        let action = check_action(deps(healthy_client(false), executor, events.clone()));

        assert_eq!(action.fire(&RunLock::new()).await, RunOutcome::Failed);
        assert_eq!(
            events.recorded(),
            vec![(
                "Repository".to_string(),
                EventType::Warning,
                reasons::FAILED_TO_CHECK.to_string()
            )]
        );
    }
}
