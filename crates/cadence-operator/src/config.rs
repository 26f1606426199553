//! Command-line configuration
//!
//! Every flag can also be set through the environment. Library crates only
//! see the typed structs built here.

use std::path::PathBuf;

use clap::Args;

use cadence_backup::options::ExtraOptions;
use cadence_backup::sidecar::SchedulerOptions;
use cadence_backup::trigger::TriggerConfig;
use cadence_backup::InvokerKind;
use cadence_common::CADENCE_SYSTEM_NAMESPACE;

/// Host name used for replicated workloads whose pods share one snapshot history
pub const SHARED_HOST: &str = "host-0";

/// Settings of the operator (`cadence run`)
#[derive(Args, Clone, Debug)]
pub struct OperatorConfig {
    /// Registry hosting the operator image
    #[arg(long, env = "CADENCE_IMAGE_REGISTRY", default_value = "ghcr.io/cadence-dev")]
    pub image_registry: String,

    /// Operator image name, used by trigger CronJobs
    #[arg(long, env = "CADENCE_IMAGE", default_value = "cadence")]
    pub image: String,

    /// Operator image tag
    #[arg(long, env = "CADENCE_IMAGE_TAG", default_value = env!("CARGO_PKG_VERSION"))]
    pub image_tag: String,

    /// Pull secret in the operator namespace (repeatable)
    #[arg(long = "image-pull-secret", env = "CADENCE_IMAGE_PULL_SECRETS", value_delimiter = ',')]
    pub image_pull_secrets: Vec<String>,

    /// Consecutive failures before an invoker is dropped until it changes
    #[arg(long, env = "CADENCE_MAX_NUM_REQUEUES", default_value_t = 5)]
    pub max_num_requeues: u32,

    /// Concurrent reconciliations per controller
    #[arg(long, env = "CADENCE_NUM_THREADS", default_value_t = 2)]
    pub num_threads: u16,

    /// Namespace the operator runs in
    #[arg(long, env = "POD_NAMESPACE", default_value = CADENCE_SYSTEM_NAMESPACE)]
    pub operator_namespace: String,

    /// Also watch OpenShift DeploymentConfigs
    #[arg(long, env = "CADENCE_ENABLE_DEPLOYMENT_CONFIG")]
    pub enable_deployment_config: bool,
}

impl OperatorConfig {
    /// Full image reference, `<registry>/<image>:<tag>`
    pub fn image_ref(&self) -> String {
        let registry = self.image_registry.trim_end_matches('/');
        if registry.is_empty() {
            format!("{}:{}", self.image, self.image_tag)
        } else {
            format!("{registry}/{}:{}", self.image, self.image_tag)
        }
    }

    /// Settings for trigger CronJobs
    pub fn trigger_config(&self) -> TriggerConfig {
        TriggerConfig {
            image: self.image_ref(),
            image_pull_secrets: self
                .image_pull_secrets
                .iter()
                .filter(|s| !s.is_empty())
                .cloned()
                .collect(),
            operator_namespace: self.operator_namespace.clone(),
        }
    }
}

/// Settings of the backup scheduler (`cadence backup-scheduler`)
#[derive(Args, Clone, Debug)]
pub struct SchedulerArgs {
    /// Name of the backup invoker
    #[arg(long, env = "CADENCE_INVOKER_NAME")]
    pub invoker_name: String,

    /// Kind of the backup invoker
    #[arg(long, env = "CADENCE_INVOKER_KIND", default_value = "BackupConfiguration")]
    pub invoker_kind: InvokerKind,

    /// Namespace of the invoker and the workload
    #[arg(long, env = "POD_NAMESPACE")]
    pub namespace: String,

    /// Kind of the workload this pod belongs to
    #[arg(long, env = "CADENCE_WORKLOAD_KIND")]
    pub workload_kind: String,

    /// Name of the workload this pod belongs to
    #[arg(long, env = "CADENCE_WORKLOAD_NAME")]
    pub workload_name: String,

    /// This pod's name
    #[arg(long, env = "POD_NAME", default_value = "")]
    pub pod_name: String,

    /// Node this pod runs on
    #[arg(long, env = "NODE_NAME", default_value = "")]
    pub node_name: String,

    /// restic executable
    #[arg(long, env = "CADENCE_RESTIC_BINARY", default_value = "restic")]
    pub restic_binary: PathBuf,

    /// Prefix appended to the repository path for this workload
    #[arg(long, env = "CADENCE_SMART_PREFIX", default_value = "")]
    pub smart_prefix: String,

    /// Scratch space for the backup engine
    #[arg(long, env = "CADENCE_SCRATCH_DIR", default_value = "/tmp")]
    pub scratch_dir: PathBuf,

    /// Directory the repository secret is mounted at
    #[arg(long, env = "CADENCE_SECRET_DIR", default_value = "/etc/cadence/repository/secret")]
    pub secret_dir: PathBuf,

    /// CA bundle for the storage endpoint
    #[arg(long, env = "CADENCE_CACERT_FILE")]
    pub cacert_file: Option<PathBuf>,

    /// Keep the engine cache between runs
    #[arg(long, env = "CADENCE_ENABLE_CACHE")]
    pub enable_cache: bool,
}

impl SchedulerArgs {
    /// Typed options for the scheduler
    pub fn to_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            invoker_name: self.invoker_name.clone(),
            invoker_kind: self.invoker_kind,
            namespace: self.namespace.clone(),
            workload_kind: self.workload_kind.clone(),
            workload_name: self.workload_name.clone(),
            pod_name: self.pod_name.clone(),
            node_name: self.node_name.clone(),
            smart_prefix: self.smart_prefix.clone(),
            extra: ExtraOptions {
                host: backup_host(&self.workload_kind, &self.pod_name, &self.node_name),
                secret_dir: self.secret_dir.clone(),
                cacert_file: self.cacert_file.clone(),
                scratch_dir: self.scratch_dir.clone(),
                enable_cache: self.enable_cache,
            },
        }
    }
}

/// Host name snapshots of this pod are recorded under
///
/// StatefulSet pods keep their own history, DaemonSet pods are keyed by
/// node, and replicated workloads share a single host.
pub fn backup_host(workload_kind: &str, pod_name: &str, node_name: &str) -> String {
    match workload_kind {
        "StatefulSet" => pod_name.to_string(),
        "DaemonSet" => node_name.to_string(),
        _ => SHARED_HOST.to_string(),
    }
}

/// Arguments of `cadence create-backup-run`
#[derive(Args, Clone, Debug)]
pub struct CreateBackupRunArgs {
    /// Name of the backup invoker
    #[arg(long, env = "CADENCE_INVOKER_NAME")]
    pub invoker_name: String,

    /// Kind of the backup invoker
    #[arg(long, env = "CADENCE_INVOKER_KIND", default_value = "BackupConfiguration")]
    pub invoker_kind: InvokerKind,

    /// Namespace of the invoker
    #[arg(long, env = "POD_NAMESPACE")]
    pub namespace: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct OperatorCli {
        #[command(flatten)]
        args: OperatorConfig,
    }

    #[derive(Parser, Debug)]
    struct SchedulerCli {
        #[command(flatten)]
        args: SchedulerArgs,
    }

    #[derive(Parser, Debug)]
    struct CreateRunCli {
        #[command(flatten)]
        args: CreateBackupRunArgs,
    }

    fn argv<'a>(args: &[&'a str]) -> Vec<&'a str> {
        std::iter::once("cadence").chain(args.iter().copied()).collect()
    }

    fn operator(args: &[&str]) -> OperatorConfig {
        OperatorCli::try_parse_from(argv(args))
            .expect("valid arguments")
            .args
    }

    #[test]
    fn operator_defaults() {
        let cfg = operator(&["--operator-namespace", "backup-system"]);
        assert_eq!(cfg.max_num_requeues, 5);
        assert_eq!(cfg.num_threads, 2);
        assert!(!cfg.enable_deployment_config);
        assert_eq!(
            cfg.image_ref(),
            format!("ghcr.io/cadence-dev/cadence:{}", env!("CARGO_PKG_VERSION"))
        );
        assert_eq!(cfg.trigger_config().operator_namespace, "backup-system");
    }

    #[test]
    fn pull_secrets_repeat_and_split() {
        let cfg = operator(&[
            "--image-pull-secret",
            "regcred",
            "--image-pull-secret",
            "mirror,backup",
            "--image-registry",
            "registry.local/",
            "--image-tag",
            "v1.2.0",
        ]);
        let trigger = cfg.trigger_config();
        assert_eq!(trigger.image_pull_secrets, vec!["regcred", "mirror", "backup"]);
        assert_eq!(trigger.image, "registry.local/cadence:v1.2.0");
    }

    #[test]
    fn scheduler_args_build_options() {
        let args = SchedulerCli::try_parse_from(argv(&[
            "--invoker-name",
            "nightly",
            "--invoker-kind",
            "BackupBatch",
            "--namespace",
            "demo",
            "--workload-kind",
            "StatefulSet",
            "--workload-name",
            "db",
            "--pod-name",
            "db-1",
            "--smart-prefix",
            "statefulset/db",
        ]))
        .expect("valid arguments")
        .args;
        let opts = args.to_options();
        assert_eq!(opts.invoker_kind, InvokerKind::BackupBatch);
        assert_eq!(opts.extra.host, "db-1");
        assert_eq!(opts.smart_prefix, "statefulset/db");
        assert_eq!(opts.extra.scratch_dir, PathBuf::from("/tmp"));
        assert_eq!(opts.lease_name(), "cadence-lock-statefulset-db");
    }

    #[test]
    fn unknown_invoker_kind_is_rejected() {
        let result = CreateRunCli::try_parse_from(argv(&[
            "--invoker-name",
            "nightly",
            "--invoker-kind",
            "RestoreSession",
            "--namespace",
            "demo",
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn backup_host_per_workload_kind() {
        assert_eq!(backup_host("StatefulSet", "db-2", "node-a"), "db-2");
        assert_eq!(backup_host("DaemonSet", "agent-x", "node-a"), "node-a");
        assert_eq!(backup_host("Deployment", "web-abc", "node-a"), SHARED_HOST);
        assert_eq!(backup_host("ReplicaSet", "web-abc", "node-a"), SHARED_HOST);
    }
}
