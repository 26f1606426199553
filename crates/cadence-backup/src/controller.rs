//! Backup invoker controller
//!
//! Reconciles BackupConfiguration and BackupBatch objects. A pass verifies
//! the invoker's dependencies in order (repository, backend secret, each
//! target), records each result as a condition, and once everything exists
//! ensures the trigger CronJob. Missing dependencies requeue after a fixed
//! delay; lookup failures go back to the controller, whose error policy
//! applies per-key exponential backoff.
//!
//! Deletion tears down in order (sidecars, CronJob ownership, RBAC) and
//! removes the finalizer only when every step succeeded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use cadence_common::crd::Repository;
use cadence_common::events::{actions, reasons, EventPublisher};
use cadence_common::{Error, Result, INVOKER_FINALIZER};

use crate::client::BackupKubeClient;
use crate::conditions::{self, ConditionSet};
use crate::dispatcher::TargetDispatcher;
use crate::invoker::{BackupInvoker, BackupModel, InvokerResource};
use crate::trigger::TriggerSchedules;

/// Requeue delay while a dependency does not exist yet
pub const REQUEUE_WAITING_SECS: u64 = 5;
/// Periodic resync of a healthy invoker
pub const REQUEUE_SUCCESS_SECS: u64 = 300;

/// Per-key exponential backoff for failed reconciliations
pub struct FailureBackoff {
    failures: Mutex<HashMap<String, u32>>,
    base: Duration,
    max: Duration,
    max_requeues: u32,
}

impl FailureBackoff {
    /// Backoff of 1s doubling up to 300s, giving up after `max_requeues` failures
    pub fn new(max_requeues: u32) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
            max_requeues,
        }
    }

    /// Delay before retrying `key`, or `None` once it has failed too often
    ///
    /// Giving up forgets the key, so the next change starts from scratch.
    pub fn next_delay(&self, key: &str) -> Option<Duration> {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(key.to_string()).or_insert(0);
        if *count >= self.max_requeues {
            failures.remove(key);
            return None;
        }
        let delay = self
            .base
            .saturating_mul(2u32.saturating_pow(*count))
            .min(self.max);
        *count += 1;
        Some(delay)
    }

    /// Forget failures of `key`
    pub fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

/// Controller context
pub struct Context {
    /// Kubernetes access
    pub kube: Arc<dyn BackupKubeClient>,
    /// Target existence checks and workload controller notifications
    pub dispatcher: Arc<dyn TargetDispatcher>,
    /// Trigger CronJob management
    pub triggers: Arc<dyn TriggerSchedules>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Failure backoff shared by both invoker kinds
    pub backoff: FailureBackoff,
}

impl Context {
    /// Create a context
    pub fn new(
        kube: Arc<dyn BackupKubeClient>,
        dispatcher: Arc<dyn TargetDispatcher>,
        triggers: Arc<dyn TriggerSchedules>,
        events: Arc<dyn EventPublisher>,
        max_num_requeues: u32,
    ) -> Self {
        Self {
            kube,
            dispatcher,
            triggers,
            events,
            backoff: FailureBackoff::new(max_num_requeues),
        }
    }

    /// Context with events discarded
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn BackupKubeClient>,
        dispatcher: Arc<dyn TargetDispatcher>,
        triggers: Arc<dyn TriggerSchedules>,
    ) -> Self {
        Self::new(
            kube,
            dispatcher,
            triggers,
            Arc::new(cadence_common::events::NoopEventPublisher),
            5,
        )
    }
}

/// Result of one reconciliation pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Every dependency exists and the trigger schedule is in place
    Ready,
    /// A dependency is missing; check again shortly
    Waiting,
    /// Teardown finished (or nothing to tear down)
    Deleted,
}

impl Outcome {
    /// Controller action for this outcome
    pub fn action(self) -> Action {
        match self {
            Outcome::Ready => Action::requeue(Duration::from_secs(REQUEUE_SUCCESS_SECS)),
            Outcome::Waiting => Action::requeue(Duration::from_secs(REQUEUE_WAITING_SECS)),
            Outcome::Deleted => Action::await_change(),
        }
    }
}

fn backoff_key<K: InvokerResource>(obj: &K) -> String {
    format!(
        "{}/{}/{}",
        K::INVOKER_KIND,
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}

/// Reconcile a BackupConfiguration or BackupBatch
#[instrument(skip(obj, ctx), fields(invoker = %obj.name_any(), kind = %K::INVOKER_KIND))]
pub async fn reconcile<K: InvokerResource>(obj: Arc<K>, ctx: Arc<Context>) -> Result<Action> {
    let invoker = obj.to_invoker()?;
    let outcome = reconcile_invoker(&invoker, &ctx).await?;
    ctx.backoff.reset(&backoff_key(obj.as_ref()));
    debug!(outcome = ?outcome, "Reconciliation finished");
    Ok(outcome.action())
}

/// Retry policy for failed reconciliations
pub fn error_policy<K: InvokerResource>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = backoff_key(obj.as_ref());
    if !error.is_retryable() {
        warn!(invoker = %key, error = %error, "Reconciliation failed permanently, waiting for a change");
        ctx.backoff.reset(&key);
        return Action::await_change();
    }
    match ctx.backoff.next_delay(&key) {
        Some(delay) => {
            error!(invoker = %key, error = %error, retry_in = ?delay, "Reconciliation failed");
            Action::requeue(delay)
        }
        None => {
            warn!(invoker = %key, error = %error, "Dropping invoker after repeated failures");
            Action::await_change()
        }
    }
}

/// One pass over a normalized invoker
pub async fn reconcile_invoker(invoker: &BackupInvoker, ctx: &Context) -> Result<Outcome> {
    if invoker.deletion_requested {
        if invoker.finalizer_present {
            tear_down(invoker, ctx).await?;
        }
        return Ok(Outcome::Deleted);
    }

    if !invoker.finalizer_present {
        ctx.kube
            .add_finalizer(
                invoker.kind,
                &invoker.namespace,
                &invoker.name,
                INVOKER_FINALIZER,
            )
            .await?;
    }

    let mut pass = StatusPass::new(invoker, ctx);
    let outcome = pass.run().await?;
    pass.flush().await?;
    pass.record_observed_generation().await?;
    Ok(outcome)
}

async fn tear_down(invoker: &BackupInvoker, ctx: &Context) -> Result<()> {
    info!(invoker = %invoker.key(), "Tearing down backup invoker");

    for target in invoker.targets.iter().filter(|t| t.model == BackupModel::Sidecar) {
        let target_ref = target.target_ref();
        if let Err(e) = ctx
            .dispatcher
            .notify_target_changed(&target_ref.kind, &invoker.namespace, &target_ref.name)
            .await
        {
            ctx.events
                .warn(
                    &invoker.object_ref(),
                    reasons::WORKLOAD_CONTROLLER_TRIGGERING_FAILED,
                    actions::DELETE,
                    format!("Failed to trigger workload controller for {target_ref}: {e}"),
                )
                .await;
            return Err(e);
        }
    }

    ctx.triggers.ensure_trigger_schedule_deleted(invoker).await?;
    ctx.triggers.ensure_rbac_deleted(invoker).await?;
    ctx.kube
        .remove_finalizer(
            invoker.kind,
            &invoker.namespace,
            &invoker.name,
            INVOKER_FINALIZER,
        )
        .await?;

    info!(invoker = %invoker.key(), "Backup invoker torn down");
    Ok(())
}

/// Condition bookkeeping for one pass
///
/// Conditions are written back only when they changed.
struct StatusPass<'a> {
    invoker: &'a BackupInvoker,
    ctx: &'a Context,
    conditions: ConditionSet,
    dirty: bool,
}

impl<'a> StatusPass<'a> {
    fn new(invoker: &'a BackupInvoker, ctx: &'a Context) -> Self {
        Self {
            invoker,
            ctx,
            conditions: ConditionSet::from_status(&invoker.status.conditions),
            dirty: false,
        }
    }

    fn set(&mut self, condition: cadence_common::crd::Condition) {
        self.dirty |= self.conditions.set(condition);
    }

    async fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let inv = self.invoker;
        self.ctx
            .kube
            .patch_conditions(inv.kind, &inv.namespace, &inv.name, self.conditions.as_slice())
            .await?;
        self.dirty = false;
        Ok(())
    }

    /// Persist conditions, then surface `err` together with any write failure
    async fn fail(&mut self, err: Error) -> Error {
        match self.flush().await {
            Ok(()) => err,
            Err(write_err) => Error::aggregate([err, write_err]),
        }
    }

    async fn record_observed_generation(&self) -> Result<()> {
        let inv = self.invoker;
        match inv.generation {
            Some(generation) if inv.status.observed_generation != Some(generation) => {
                self.ctx
                    .kube
                    .patch_observed_generation(inv.kind, &inv.namespace, &inv.name, generation)
                    .await
            }
            _ => Ok(()),
        }
    }

    async fn warn(&self, reason: &str, note: String) {
        self.ctx
            .events
            .warn(&self.invoker.object_ref(), reason, actions::RECONCILE, note)
            .await;
    }

    async fn run(&mut self) -> Result<Outcome> {
        if self.invoker.uses_repository() {
            let Some(repository) = self.check_repository().await? else {
                return Ok(Outcome::Waiting);
            };
            if !self.check_backend_secret(&repository).await? {
                return Ok(Outcome::Waiting);
            }
        }

        if !self.check_targets().await? {
            info!(invoker = %self.invoker.key(), "Waiting for backup targets");
            return Ok(Outcome::Waiting);
        }

        self.ensure_trigger().await?;
        Ok(Outcome::Ready)
    }

    async fn check_repository(&mut self) -> Result<Option<Repository>> {
        let inv = self.invoker;
        let generation = inv.generation;
        match self
            .ctx
            .kube
            .get_repository(&inv.namespace, &inv.repository)
            .await
        {
            Ok(Some(repository)) => {
                self.set(conditions::repository_found(generation, &inv.repository));
                Ok(Some(repository))
            }
            Ok(None) => {
                self.set(conditions::repository_not_found(generation, &inv.repository));
                self.warn(
                    reasons::REPOSITORY_NOT_FOUND,
                    format!("Repository {} does not exist", inv.repository),
                )
                .await;
                Ok(None)
            }
            Err(e) => {
                self.set(conditions::repository_unknown(
                    generation,
                    &inv.repository,
                    &e.to_string(),
                ));
                Err(self.fail(e).await)
            }
        }
    }

    async fn check_backend_secret(&mut self, repository: &Repository) -> Result<bool> {
        let inv = self.invoker;
        let generation = inv.generation;
        let secret_name = repository.spec.backend.storage_secret_name.as_str();
        if secret_name.is_empty() {
            self.set(conditions::secret_name_missing(generation, &inv.repository));
            let err = Error::configuration(
                &inv.name,
                format!("Repository {} is missing the storage secret name", inv.repository),
            );
            self.warn(reasons::BACKEND_SECRET_NOT_FOUND, err.to_string())
                .await;
            return Err(self.fail(err).await);
        }

        match self.ctx.kube.get_secret(&inv.namespace, secret_name).await {
            Ok(Some(_)) => {
                self.set(conditions::secret_found(generation, secret_name));
                Ok(true)
            }
            Ok(None) => {
                self.set(conditions::secret_not_found(generation, secret_name));
                self.warn(
                    reasons::BACKEND_SECRET_NOT_FOUND,
                    format!("Backend Secret {secret_name} does not exist"),
                )
                .await;
                Ok(false)
            }
            Err(e) => {
                self.set(conditions::secret_unknown(
                    generation,
                    secret_name,
                    &e.to_string(),
                ));
                Err(self.fail(e).await)
            }
        }
    }

    /// Returns false if any target is missing
    async fn check_targets(&mut self) -> Result<bool> {
        let inv = self.invoker;
        let generation = inv.generation;
        let mut all_found = true;
        let mut errors = Vec::new();

        for target in &inv.targets {
            let target_ref = target.target_ref();
            match self
                .ctx
                .dispatcher
                .target_exists(target_ref, &inv.namespace)
                .await
            {
                Err(e) => {
                    self.set(conditions::target_unknown(
                        generation,
                        target_ref,
                        &e.to_string(),
                    ));
                    errors.push(e);
                    return Err(self.fail(Error::aggregate(errors)).await);
                }
                Ok(false) => {
                    self.set(conditions::target_not_found(generation, target_ref));
                    self.warn(
                        reasons::BACKUP_TARGET_NOT_FOUND,
                        format!("Backup target {target_ref} does not exist"),
                    )
                    .await;
                    all_found = false;
                }
                Ok(true) => {
                    self.set(conditions::target_found(generation, target_ref));
                    if target.model == BackupModel::Sidecar && inv.uses_repository() {
                        if let Err(e) = self
                            .ctx
                            .dispatcher
                            .notify_target_changed(&target_ref.kind, &inv.namespace, &target_ref.name)
                            .await
                        {
                            self.warn(
                                reasons::WORKLOAD_CONTROLLER_TRIGGERING_FAILED,
                                format!("Failed to trigger workload controller for {target_ref}: {e}"),
                            )
                            .await;
                            errors.push(e);
                        }
                    }
                }
            }
        }

        if !errors.is_empty() {
            return Err(self.fail(Error::aggregate(errors)).await);
        }
        Ok(all_found)
    }

    async fn ensure_trigger(&mut self) -> Result<()> {
        let inv = self.invoker;
        match self.ctx.triggers.ensure_trigger_schedule(inv).await {
            Ok(()) => {
                self.set(conditions::trigger_created(inv.generation));
                Ok(())
            }
            Err(e) => {
                self.set(conditions::trigger_failed(inv.generation, &e.to_string()));
                self.warn(
                    reasons::TRIGGER_SCHEDULE_CREATION_FAILED,
                    format!("Failed to ensure backup trigger CronJob: {e}"),
                )
                .await;
                Err(self.fail(e).await)
            }
        }
    }
}
