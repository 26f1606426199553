//! Trigger schedule
//!
//! Every invoker owns a CronJob that runs `create-backup-run` on the
//! invoker's schedule. The CronJob is built by mutating the live object so
//! fields defaulted by the API server survive and an unchanged invoker
//! produces no write.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, LocalObjectReference, ObjectFieldSelector, PodSpec,
    PodTemplateSpec, Secret, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use cadence_common::kube_utils::{
    ensure_owner_reference, upsert_map, valid_name_with_prefix, MAX_CRON_JOB_NAME_LEN,
};
use cadence_common::{
    Error, Result, ALLOW_DELETING_JOB_ON_COMPLETION, CADENCE_GROUP,
    LABEL_DELETE_JOB_ON_COMPLETION, LABEL_MANAGED_BY, LABEL_MANAGED_BY_CADENCE, TRIGGER_CONTAINER_NAME,
    TRIGGER_PREFIX,
};

use crate::client::BackupKubeClient;
use crate::invoker::BackupInvoker;

/// Environment variable the trigger container reads its namespace from
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";

/// Operator-level settings for trigger CronJobs
#[derive(Clone, Debug, Default)]
pub struct TriggerConfig {
    /// Image running `create-backup-run`
    pub image: String,
    /// Pull secrets in the operator namespace, copied to invoker namespaces
    pub image_pull_secrets: Vec<String>,
    /// Namespace the operator runs in
    pub operator_namespace: String,
}

/// Manages the trigger CronJob and its RBAC
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TriggerSchedules: Send + Sync {
    /// Create or update the trigger CronJob to match the invoker
    async fn ensure_trigger_schedule(&self, invoker: &BackupInvoker) -> Result<()>;

    /// Hand the CronJob to the garbage collector; no-op if absent
    async fn ensure_trigger_schedule_deleted(&self, invoker: &BackupInvoker) -> Result<()>;

    /// Delete the RBAC created for the trigger
    async fn ensure_rbac_deleted(&self, invoker: &BackupInvoker) -> Result<()>;
}

/// Name of the invoker's CronJob, ServiceAccount, Role and RoleBinding
pub fn trigger_name(invoker: &BackupInvoker) -> String {
    valid_name_with_prefix(
        TRIGGER_PREFIX,
        &invoker.name.replace('.', "-"),
        MAX_CRON_JOB_NAME_LEN,
    )
}

/// Production [`TriggerSchedules`]
pub struct TriggerScheduler {
    client: Arc<dyn BackupKubeClient>,
    config: TriggerConfig,
}

impl TriggerScheduler {
    /// Create a scheduler writing through `client`
    pub fn new(client: Arc<dyn BackupKubeClient>, config: TriggerConfig) -> Self {
        Self { client, config }
    }

    fn owned_meta(&self, invoker: &BackupInvoker, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(invoker.namespace.clone()),
            labels: Some(trigger_labels(invoker)),
            owner_references: Some(vec![invoker.owner_reference()]),
            ..Default::default()
        }
    }

    async fn ensure_service_account(&self, invoker: &BackupInvoker) -> Result<String> {
        let configured = invoker
            .runtime_settings
            .pod
            .as_ref()
            .and_then(|p| p.service_account_name.clone())
            .filter(|s| !s.is_empty());
        let name = match configured {
            Some(name) => name,
            None => {
                let name = trigger_name(invoker);
                let sa = ServiceAccount {
                    metadata: self.owned_meta(invoker, &name),
                    ..Default::default()
                };
                self.client.apply_service_account(&sa).await?;
                name
            }
        };
        self.ensure_rbac(invoker, &name).await?;
        Ok(name)
    }

    async fn ensure_rbac(&self, invoker: &BackupInvoker, service_account: &str) -> Result<()> {
        let name = trigger_name(invoker);
        let role = Role {
            metadata: self.owned_meta(invoker, &name),
            rules: Some(vec![
                PolicyRule {
                    api_groups: Some(vec![CADENCE_GROUP.to_string()]),
                    resources: Some(vec![
                        "backupconfigurations".to_string(),
                        "backupbatches".to_string(),
                    ]),
                    verbs: vec!["get".to_string()],
                    ..Default::default()
                },
                PolicyRule {
                    api_groups: Some(vec![CADENCE_GROUP.to_string()]),
                    resources: Some(vec!["backupsessions".to_string()]),
                    verbs: vec!["create".to_string()],
                    ..Default::default()
                },
            ]),
        };
        let binding = RoleBinding {
            metadata: self.owned_meta(invoker, &name),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: name.clone(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: service_account.to_string(),
                namespace: Some(invoker.namespace.clone()),
                api_group: None,
            }]),
        };
        self.client.apply_role(&role).await?;
        self.client.apply_role_binding(&binding).await?;
        Ok(())
    }

    /// Pull secrets for the trigger pod
    ///
    /// A pod-level override is used as-is. Otherwise the operator's pull
    /// secrets are copied into the invoker namespace.
    async fn ensure_image_pull_secrets(
        &self,
        invoker: &BackupInvoker,
    ) -> Result<Vec<LocalObjectReference>> {
        if let Some(secrets) = invoker
            .runtime_settings
            .pod
            .as_ref()
            .map(|p| &p.image_pull_secrets)
            .filter(|s| !s.is_empty())
        {
            return Ok(secrets.clone());
        }

        let mut refs = Vec::with_capacity(self.config.image_pull_secrets.len());
        for name in &self.config.image_pull_secrets {
            if invoker.namespace != self.config.operator_namespace {
                let source = self
                    .client
                    .get_secret(&self.config.operator_namespace, name)
                    .await?
                    .ok_or_else(|| {
                        Error::configuration(
                            &invoker.name,
                            format!(
                                "image pull secret {}/{} not found",
                                self.config.operator_namespace, name
                            ),
                        )
                    })?;
                let copy = Secret {
                    metadata: self.owned_meta(invoker, name),
                    type_: source.type_.clone(),
                    data: source.data.clone(),
                    ..Default::default()
                };
                self.client.apply_secret(&copy).await?;
            }
            refs.push(LocalObjectReference { name: name.clone() });
        }
        Ok(refs)
    }
}

#[async_trait]
impl TriggerSchedules for TriggerScheduler {
    async fn ensure_trigger_schedule(&self, invoker: &BackupInvoker) -> Result<()> {
        let service_account = self.ensure_service_account(invoker).await?;
        let pull_secrets = self.ensure_image_pull_secrets(invoker).await?;

        let name = trigger_name(invoker);
        let existing = self.client.get_cron_job(&invoker.namespace, &name).await?;
        let desired = build_cron_job(
            existing.clone(),
            invoker,
            &self.config.image,
            &service_account,
            &pull_secrets,
        );

        match existing {
            None => {
                info!(invoker = %invoker.key(), cron_job = %name, "Creating trigger CronJob");
                self.client.create_cron_job(&desired).await
            }
            Some(current) if current != desired => {
                info!(invoker = %invoker.key(), cron_job = %name, "Updating trigger CronJob");
                self.client.replace_cron_job(&desired).await
            }
            Some(_) => {
                debug!(invoker = %invoker.key(), cron_job = %name, "Trigger CronJob up to date");
                Ok(())
            }
        }
    }

    async fn ensure_trigger_schedule_deleted(&self, invoker: &BackupInvoker) -> Result<()> {
        let name = trigger_name(invoker);
        let Some(mut cron_job) = self.client.get_cron_job(&invoker.namespace, &name).await? else {
            return Ok(());
        };
        let owners = cron_job.metadata.owner_references.get_or_insert_with(Vec::new);
        if ensure_owner_reference(owners, &invoker.owner_reference()) {
            self.client.replace_cron_job(&cron_job).await?;
        }
        debug!(invoker = %invoker.key(), cron_job = %name, "Trigger CronJob left to garbage collection");
        Ok(())
    }

    async fn ensure_rbac_deleted(&self, invoker: &BackupInvoker) -> Result<()> {
        self.client
            .delete_rbac(&invoker.namespace, &trigger_name(invoker))
            .await
    }
}

fn trigger_labels(invoker: &BackupInvoker) -> BTreeMap<String, String> {
    let mut labels = invoker.labels.clone();
    labels.insert(
        LABEL_MANAGED_BY.to_string(),
        LABEL_MANAGED_BY_CADENCE.to_string(),
    );
    labels
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}

/// Apply the invoker's desired state onto `existing` (or a fresh CronJob)
pub fn build_cron_job(
    existing: Option<CronJob>,
    invoker: &BackupInvoker,
    image: &str,
    service_account: &str,
    image_pull_secrets: &[LocalObjectReference],
) -> CronJob {
    let mut cj = existing.unwrap_or_default();
    let labels = trigger_labels(invoker);

    cj.metadata.name = Some(trigger_name(invoker));
    cj.metadata.namespace = Some(invoker.namespace.clone());
    cj.metadata.labels = Some(upsert_map(cj.metadata.labels.as_ref(), &labels));
    ensure_owner_reference(
        cj.metadata.owner_references.get_or_insert_with(Vec::new),
        &invoker.owner_reference(),
    );

    let spec = cj.spec.get_or_insert_with(CronJobSpec::default);
    spec.schedule = invoker.schedule.clone();
    spec.suspend = Some(invoker.paused);

    let mut job_labels = labels.clone();
    job_labels.insert(
        LABEL_DELETE_JOB_ON_COMPLETION.to_string(),
        ALLOW_DELETING_JOB_ON_COMPLETION.to_string(),
    );
    let job_template: &mut JobTemplateSpec = &mut spec.job_template;
    let job_meta = job_template.metadata.get_or_insert_with(ObjectMeta::default);
    job_meta.labels = Some(upsert_map(job_meta.labels.as_ref(), &job_labels));

    let job_spec = job_template.spec.get_or_insert_with(JobSpec::default);
    let template: &mut PodTemplateSpec = &mut job_spec.template;
    let pod_meta = template.metadata.get_or_insert_with(ObjectMeta::default);
    pod_meta.labels = Some(upsert_map(pod_meta.labels.as_ref(), &labels));

    let pod = template.spec.get_or_insert_with(PodSpec::default);
    apply_trigger_container(&mut pod.containers, invoker, image);
    pod.restart_policy = Some("Never".to_string());
    pod.service_account_name = Some(service_account.to_string());
    pod.image_pull_secrets = non_empty(image_pull_secrets.to_vec());

    let pod_settings = invoker.runtime_settings.pod.clone().unwrap_or_default();
    pod.security_context = pod_settings.security_context;
    pod.node_selector = (!pod_settings.node_selector.is_empty()).then_some(pod_settings.node_selector);

    cj
}

fn apply_trigger_container(containers: &mut Vec<Container>, invoker: &BackupInvoker, image: &str) {
    let idx = match containers
        .iter()
        .position(|c| c.name == TRIGGER_CONTAINER_NAME)
    {
        Some(idx) => idx,
        None => {
            containers.push(Container {
                name: TRIGGER_CONTAINER_NAME.to_string(),
                ..Default::default()
            });
            containers.len() - 1
        }
    };
    let container = &mut containers[idx];

    container.image = Some(image.to_string());
    container.image_pull_policy = Some("IfNotPresent".to_string());
    container.args = Some(vec![
        "create-backup-run".to_string(),
        format!("--invoker-name={}", invoker.name),
        format!("--invoker-kind={}", invoker.kind),
    ]);

    let settings = invoker.runtime_settings.container.clone().unwrap_or_default();
    let mut env = vec![EnvVar {
        name: POD_NAMESPACE_ENV.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: Some("v1".to_string()),
                field_path: "metadata.namespace".to_string(),
            }),
            ..Default::default()
        }),
    }];
    env.extend(settings.env.into_iter().filter(|e| e.name != POD_NAMESPACE_ENV));
    container.env = Some(env);
    container.env_from = non_empty(settings.env_from);
    container.resources = Some(settings.resources.unwrap_or_default());
    container.security_context = settings.security_context;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockBackupKubeClient;
    use crate::invoker::tests::sample_invoker;
    use cadence_common::crd::{ContainerRuntimeSettings, PodRuntimeSettings};
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::sync::Mutex;

    fn config() -> TriggerConfig {
        TriggerConfig {
            image: "cadence/operator:v1".to_string(),
            image_pull_secrets: vec!["regcred".to_string()],
            operator_namespace: "cadence-system".to_string(),
        }
    }

    fn pod_spec(cj: &CronJob) -> &PodSpec {
        cj.spec
            .as_ref()
            .and_then(|s| s.job_template.spec.as_ref())
            .and_then(|j| j.template.spec.as_ref())
            .expect("pod spec")
    }

    #[test]
    fn trigger_name_replaces_dots_and_fits_cron_job_limit() {
        let mut inv = sample_invoker("nightly");
        assert_eq!(trigger_name(&inv), "cadence-trigger-nightly");
        inv.name = format!("db.{}", "x".repeat(60));
        let name = trigger_name(&inv);
        assert!(name.len() <= MAX_CRON_JOB_NAME_LEN);
        assert!(name.starts_with("cadence-trigger-db-"));
    }

    #[test]
    fn cron_job_mirrors_schedule_pause_and_invocation() {
        let mut inv = sample_invoker("nightly");
        inv.paused = true;
        let cj = build_cron_job(None, &inv, "img:1", "sa", &[]);

        let spec = cj.spec.as_ref().unwrap();
        assert_eq!(spec.schedule, "*/5 * * * *");
        assert_eq!(spec.suspend, Some(true));

        let owners = cj.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].uid, "uid-nightly");

        let job_labels = spec.job_template.metadata.as_ref().unwrap().labels.as_ref().unwrap();
        assert_eq!(
            job_labels.get(LABEL_DELETE_JOB_ON_COMPLETION).map(String::as_str),
            Some("true")
        );
        assert_eq!(job_labels.get("app").map(String::as_str), Some("web"));

        let pod = pod_spec(&cj);
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.service_account_name.as_deref(), Some("sa"));
        assert!(pod.image_pull_secrets.is_none());
        let container = &pod.containers[0];
        assert_eq!(container.name, TRIGGER_CONTAINER_NAME);
        assert_eq!(
            container.args.as_ref().unwrap(),
            &vec![
                "create-backup-run".to_string(),
                "--invoker-name=nightly".to_string(),
                "--invoker-kind=BackupConfiguration".to_string(),
            ]
        );
    }

    #[test]
    fn rebuilding_from_live_object_is_a_fixed_point() {
        let inv = sample_invoker("nightly");
        let secrets = vec![LocalObjectReference {
            name: "regcred".to_string(),
        }];
        let first = build_cron_job(None, &inv, "img:1", "sa", &secrets);

        // Server-side defaults and foreign labels survive rebuilding
        let mut live = first.clone();
        live.metadata.resource_version = Some("42".to_string());
        live.metadata
            .labels
            .as_mut()
            .unwrap()
            .insert("team".to_string(), "storage".to_string());
        live.spec.as_mut().unwrap().concurrency_policy = Some("Allow".to_string());

        let second = build_cron_job(Some(live.clone()), &inv, "img:1", "sa", &secrets);
        assert_eq!(second, live);
    }

    #[test]
    fn runtime_settings_reach_trigger_pod() {
        let mut inv = sample_invoker("nightly");
        inv.runtime_settings.container = Some(ContainerRuntimeSettings {
            resources: Some(ResourceRequirements {
                limits: Some(BTreeMap::from([(
                    "memory".to_string(),
                    Quantity("128Mi".to_string()),
                )])),
                ..Default::default()
            }),
            env: vec![EnvVar {
                name: "TZ".to_string(),
                value: Some("UTC".to_string()),
                value_from: None,
            }],
            ..Default::default()
        });
        inv.runtime_settings.pod = Some(PodRuntimeSettings {
            node_selector: BTreeMap::from([("disk".to_string(), "ssd".to_string())]),
            ..Default::default()
        });

        let cj = build_cron_job(None, &inv, "img:1", "sa", &[]);
        let pod = pod_spec(&cj);
        let container = &pod.containers[0];
        let env = container.env.as_ref().unwrap();
        assert_eq!(env[0].name, POD_NAMESPACE_ENV);
        assert_eq!(env[1].name, "TZ");
        assert!(container
            .resources
            .as_ref()
            .unwrap()
            .limits
            .as_ref()
            .unwrap()
            .contains_key("memory"));
        assert_eq!(
            pod.node_selector.as_ref().unwrap().get("disk").map(String::as_str),
            Some("ssd")
        );
    }

    fn expect_rbac(client: &mut MockBackupKubeClient) {
        client.expect_apply_role().returning(|_| Ok(()));
        client.expect_apply_role_binding().returning(|_| Ok(()));
    }

    #[tokio::test]
    async fn ensure_creates_once_then_no_mutation() {
        let stored: Arc<Mutex<Option<CronJob>>> = Arc::new(Mutex::new(None));
        let writes = Arc::new(Mutex::new(0u32));

        let mut client = MockBackupKubeClient::new();
        client.expect_apply_service_account().returning(|_| Ok(()));
        expect_rbac(&mut client);
        client.expect_get_secret().returning(|_, name| {
            Ok(Some(Secret {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                type_: Some("kubernetes.io/dockerconfigjson".to_string()),
                ..Default::default()
            }))
        });
        client.expect_apply_secret().returning(|_| Ok(()));
        let s = stored.clone();
        client
            .expect_get_cron_job()
            .returning(move |_, _| Ok(s.lock().unwrap().clone()));
        let (s, w) = (stored.clone(), writes.clone());
        client.expect_create_cron_job().returning(move |cj| {
            *s.lock().unwrap() = Some(cj.clone());
            *w.lock().unwrap() += 1;
            Ok(())
        });
        let (s, w) = (stored.clone(), writes.clone());
        client.expect_replace_cron_job().returning(move |cj| {
            *s.lock().unwrap() = Some(cj.clone());
            *w.lock().unwrap() += 1;
            Ok(())
        });

        let scheduler = TriggerScheduler::new(Arc::new(client), config());
        let inv = sample_invoker("nightly");

        scheduler.ensure_trigger_schedule(&inv).await.unwrap();
        scheduler.ensure_trigger_schedule(&inv).await.unwrap();
        assert_eq!(*writes.lock().unwrap(), 1);

        let mut paused = inv.clone();
        paused.paused = true;
        scheduler.ensure_trigger_schedule(&paused).await.unwrap();
        assert_eq!(*writes.lock().unwrap(), 2);
        let cj = stored.lock().unwrap().clone().unwrap();
        assert_eq!(cj.spec.unwrap().suspend, Some(true));
    }

    #[tokio::test]
    async fn configured_service_account_and_pull_secrets_are_reused() {
        let mut inv = sample_invoker("nightly");
        inv.runtime_settings.pod = Some(PodRuntimeSettings {
            service_account_name: Some("backup-sa".to_string()),
            image_pull_secrets: vec![LocalObjectReference {
                name: "own-cred".to_string(),
            }],
            ..Default::default()
        });

        let mut client = MockBackupKubeClient::new();
        client.expect_apply_service_account().never();
        client.expect_get_secret().never();
        client.expect_apply_secret().never();
        client.expect_apply_role().returning(|_| Ok(()));
        client
            .expect_apply_role_binding()
            .withf(|rb| {
                rb.subjects.as_ref().is_some_and(|s| s[0].name == "backup-sa")
            })
            .returning(|_| Ok(()));
        client.expect_get_cron_job().returning(|_, _| Ok(None));
        client
            .expect_create_cron_job()
            .withf(|cj| {
                let pod = pod_spec(cj);
                pod.service_account_name.as_deref() == Some("backup-sa")
                    && pod.image_pull_secrets.as_ref().is_some_and(|s| s[0].name == "own-cred")
            })
            .returning(|_| Ok(()));

        let scheduler = TriggerScheduler::new(Arc::new(client), config());
        scheduler.ensure_trigger_schedule(&inv).await.unwrap();
    }

    #[tokio::test]
    async fn missing_operator_pull_secret_is_configuration_error() {
        let mut client = MockBackupKubeClient::new();
        client.expect_apply_service_account().returning(|_| Ok(()));
        expect_rbac(&mut client);
        client.expect_get_secret().returning(|_, _| Ok(None));
        client.expect_create_cron_job().never();

        let scheduler = TriggerScheduler::new(Arc::new(client), config());
        let err = scheduler
            .ensure_trigger_schedule(&sample_invoker("nightly"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn deleting_absent_schedule_is_noop() {
        let mut client = MockBackupKubeClient::new();
        client.expect_get_cron_job().returning(|_, _| Ok(None));
        client.expect_replace_cron_job().never();

        let scheduler = TriggerScheduler::new(Arc::new(client), config());
        scheduler
            .ensure_trigger_schedule_deleted(&sample_invoker("nightly"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deleting_unowned_schedule_restores_owner_for_gc() {
        let inv = sample_invoker("nightly");
        let mut orphan = build_cron_job(None, &inv, "img:1", "sa", &[]);
        orphan.metadata.owner_references = None;

        let mut client = MockBackupKubeClient::new();
        client
            .expect_get_cron_job()
            .returning(move |_, _| Ok(Some(orphan.clone())));
        client
            .expect_replace_cron_job()
            .times(1)
            .withf(|cj| {
                cj.metadata
                    .owner_references
                    .as_ref()
                    .is_some_and(|o| o.len() == 1 && o[0].uid == "uid-nightly")
            })
            .returning(|_| Ok(()));

        let scheduler = TriggerScheduler::new(Arc::new(client), config());
        scheduler.ensure_trigger_schedule_deleted(&inv).await.unwrap();
    }
}
