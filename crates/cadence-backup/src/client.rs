//! Kubernetes access for the invoker controller and the backup scheduler
//!
//! Both are traits so reconcile logic can be tested with mockall mocks.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tracing::debug;

use cadence_common::crd::{
    BackupBatch, BackupConfiguration, BackupSession, Condition, Repository,
};
use cadence_common::error::is_not_found;
use cadence_common::{Error, Result, FIELD_MANAGER};

use crate::invoker::{BackupInvoker, InvokerKind, InvokerResource};

/// Kubernetes operations used by the invoker controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackupKubeClient: Send + Sync {
    /// Get a Repository, `None` if it does not exist
    async fn get_repository(&self, namespace: &str, name: &str) -> Result<Option<Repository>>;

    /// Get a Secret, `None` if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Add the finalizer to an invoker (no-op if present)
    async fn add_finalizer(
        &self,
        kind: InvokerKind,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()>;

    /// Remove the finalizer from an invoker (no-op if absent)
    async fn remove_finalizer(
        &self,
        kind: InvokerKind,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()>;

    /// Replace the invoker's status conditions
    async fn patch_conditions(
        &self,
        kind: InvokerKind,
        namespace: &str,
        name: &str,
        conditions: &[Condition],
    ) -> Result<()>;

    /// Record the generation a reconciliation pass observed
    async fn patch_observed_generation(
        &self,
        kind: InvokerKind,
        namespace: &str,
        name: &str,
        generation: i64,
    ) -> Result<()>;

    /// Get a CronJob, `None` if it does not exist
    async fn get_cron_job(&self, namespace: &str, name: &str) -> Result<Option<CronJob>>;

    /// Create a CronJob
    async fn create_cron_job(&self, cron_job: &CronJob) -> Result<()>;

    /// Replace a CronJob (optimistic concurrency on resourceVersion)
    async fn replace_cron_job(&self, cron_job: &CronJob) -> Result<()>;

    /// Server-side apply a ServiceAccount
    async fn apply_service_account(&self, service_account: &ServiceAccount) -> Result<()>;

    /// Server-side apply a Role
    async fn apply_role(&self, role: &Role) -> Result<()>;

    /// Server-side apply a RoleBinding
    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<()>;

    /// Delete a Role and the RoleBinding of the same name; absent objects are fine
    async fn delete_rbac(&self, namespace: &str, name: &str) -> Result<()>;

    /// Server-side apply a Secret
    async fn apply_secret(&self, secret: &Secret) -> Result<()>;
}

/// Kubernetes operations used by the backup scheduler and `create-backup-run`
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SchedulerKubeClient: Send + Sync {
    /// Read and normalize an invoker, `None` if it does not exist
    async fn get_invoker(
        &self,
        kind: InvokerKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BackupInvoker>>;

    /// Get a Repository, `None` if it does not exist
    async fn get_repository(&self, namespace: &str, name: &str) -> Result<Option<Repository>>;

    /// Get a Secret, `None` if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Create a BackupSession, returning the generated name
    async fn create_backup_session(&self, session: &BackupSession) -> Result<String>;
}

/// Production client for both traits
#[derive(Clone)]
pub struct KubeBackupClient {
    client: Client,
}

impl KubeBackupClient {
    /// Wrap a kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_opt<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply<K>(&self, obj: &K) -> Result<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + Serialize
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let namespace = obj
            .namespace()
            .ok_or_else(|| Error::internal_with_context("client", "object has no namespace"))?;
        let name = obj.name_any();
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(obj),
        )
        .await?;
        Ok(())
    }

    async fn invoker_finalizers<K: InvokerResource>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Vec<String>>> {
        Ok(self
            .get_opt::<K>(namespace, name)
            .await?
            .map(|obj| obj.finalizers().to_vec()))
    }

    async fn patch_invoker<K: InvokerResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn patch_invoker_status<K: InvokerResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn finalizers(
        &self,
        kind: InvokerKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Vec<String>>> {
        match kind {
            InvokerKind::BackupConfiguration => {
                self.invoker_finalizers::<BackupConfiguration>(namespace, name)
                    .await
            }
            InvokerKind::BackupBatch => {
                self.invoker_finalizers::<BackupBatch>(namespace, name)
                    .await
            }
        }
    }

    async fn patch_metadata(
        &self,
        kind: InvokerKind,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        match kind {
            InvokerKind::BackupConfiguration => {
                self.patch_invoker::<BackupConfiguration>(namespace, name, patch)
                    .await
            }
            InvokerKind::BackupBatch => {
                self.patch_invoker::<BackupBatch>(namespace, name, patch)
                    .await
            }
        }
    }

    async fn patch_status(
        &self,
        kind: InvokerKind,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        match kind {
            InvokerKind::BackupConfiguration => {
                self.patch_invoker_status::<BackupConfiguration>(namespace, name, patch)
                    .await
            }
            InvokerKind::BackupBatch => {
                self.patch_invoker_status::<BackupBatch>(namespace, name, patch)
                    .await
            }
        }
    }

    async fn delete_opt<K>(&self, namespace: &str, name: &str) -> Result<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BackupKubeClient for KubeBackupClient {
    async fn get_repository(&self, namespace: &str, name: &str) -> Result<Option<Repository>> {
        self.get_opt(namespace, name).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.get_opt(namespace, name).await
    }

    async fn add_finalizer(
        &self,
        kind: InvokerKind,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()> {
        let Some(mut finalizers) = self.finalizers(kind, namespace, name).await? else {
            return Ok(());
        };
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        self.patch_metadata(kind, namespace, name, &patch).await
    }

    async fn remove_finalizer(
        &self,
        kind: InvokerKind,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()> {
        let Some(finalizers) = self.finalizers(kind, namespace, name).await? else {
            return Ok(());
        };
        if !finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        let remaining: Vec<String> = finalizers.into_iter().filter(|f| f != finalizer).collect();
        let patch = serde_json::json!({ "metadata": { "finalizers": remaining } });
        self.patch_metadata(kind, namespace, name, &patch).await
    }

    async fn patch_conditions(
        &self,
        kind: InvokerKind,
        namespace: &str,
        name: &str,
        conditions: &[Condition],
    ) -> Result<()> {
        let patch = serde_json::json!({ "status": { "conditions": conditions } });
        self.patch_status(kind, namespace, name, &patch).await
    }

    async fn patch_observed_generation(
        &self,
        kind: InvokerKind,
        namespace: &str,
        name: &str,
        generation: i64,
    ) -> Result<()> {
        let patch = serde_json::json!({ "status": { "observedGeneration": generation } });
        self.patch_status(kind, namespace, name, &patch).await
    }

    async fn get_cron_job(&self, namespace: &str, name: &str) -> Result<Option<CronJob>> {
        self.get_opt(namespace, name).await
    }

    async fn create_cron_job(&self, cron_job: &CronJob) -> Result<()> {
        let namespace = cron_job.namespace().unwrap_or_default();
        let api: Api<CronJob> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), cron_job).await?;
        Ok(())
    }

    async fn replace_cron_job(&self, cron_job: &CronJob) -> Result<()> {
        let namespace = cron_job.namespace().unwrap_or_default();
        let api: Api<CronJob> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&cron_job.name_any(), &PostParams::default(), cron_job)
            .await?;
        Ok(())
    }

    async fn apply_service_account(&self, service_account: &ServiceAccount) -> Result<()> {
        self.apply(service_account).await
    }

    async fn apply_role(&self, role: &Role) -> Result<()> {
        self.apply(role).await
    }

    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<()> {
        self.apply(binding).await
    }

    async fn delete_rbac(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_opt::<RoleBinding>(namespace, name).await?;
        self.delete_opt::<Role>(namespace, name).await?;
        debug!(namespace = %namespace, name = %name, "Trigger RBAC removed");
        Ok(())
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<()> {
        self.apply(secret).await
    }
}

#[async_trait]
impl SchedulerKubeClient for KubeBackupClient {
    async fn get_invoker(
        &self,
        kind: InvokerKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BackupInvoker>> {
        match kind {
            InvokerKind::BackupConfiguration => self
                .get_opt::<BackupConfiguration>(namespace, name)
                .await?
                .map(|bc| bc.to_invoker())
                .transpose(),
            InvokerKind::BackupBatch => self
                .get_opt::<BackupBatch>(namespace, name)
                .await?
                .map(|bb| bb.to_invoker())
                .transpose(),
        }
    }

    async fn get_repository(&self, namespace: &str, name: &str) -> Result<Option<Repository>> {
        self.get_opt(namespace, name).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.get_opt(namespace, name).await
    }

    async fn create_backup_session(&self, session: &BackupSession) -> Result<String> {
        let namespace = session.namespace().unwrap_or_default();
        let api: Api<BackupSession> = Api::namespaced(self.client.clone(), &namespace);
        let created = api.create(&PostParams::default(), session).await?;
        Ok(created.name_any())
    }
}
