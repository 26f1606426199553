//! Backup engine collaborator
//!
//! [`BackupExecutor`] is what the backup scheduler drives. [`ResticCli`]
//! implements it by running a `restic` binary, translating the Repository
//! backend and its credential Secret into restic's environment.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::{debug, info};

use cadence_common::crd::providers;
use cadence_common::crd::{Repository, RetentionPolicy};
use cadence_common::{Error, Result};

use crate::options::{setup_options_for_repository, BackupOptions, ExtraOptions, SetupOptions};

/// Secret key holding the repository encryption password
pub const RESTIC_PASSWORD: &str = "RESTIC_PASSWORD";
/// Secret key with a GCS service account JSON key
pub const GOOGLE_SERVICE_ACCOUNT_JSON_KEY: &str = "GOOGLE_SERVICE_ACCOUNT_JSON_KEY";

/// Secret keys passed through to restic unchanged, per provider
const CREDENTIAL_KEYS: &[(&str, &[&str])] = &[
    (providers::S3, &["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"]),
    (providers::GCS, &["GOOGLE_PROJECT_ID"]),
    (providers::AZURE, &["AZURE_ACCOUNT_NAME", "AZURE_ACCOUNT_KEY"]),
    (providers::LOCAL, &[]),
];

/// Operations of the backup engine
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackupExecutor: Send + Sync {
    /// Prepare the engine for `repository`, returning the repository prefix in use
    async fn setup_environment(
        &self,
        repository: &Repository,
        secret: &Secret,
        smart_prefix: &str,
    ) -> Result<String>;

    /// Initialize the repository unless it already exists
    async fn init_repository_if_absent(&self) -> Result<()>;

    /// Take a backup and apply retention
    async fn run_backup(&self, options: &BackupOptions, repository: &Repository) -> Result<()>;

    /// Verify repository integrity
    async fn run_check(&self) -> Result<()>;
}

#[derive(Clone, Debug, Default)]
struct ResticEnv {
    vars: BTreeMap<String, String>,
    global_args: Vec<String>,
}

/// [`BackupExecutor`] backed by the restic CLI
pub struct ResticCli {
    binary: PathBuf,
    extra: ExtraOptions,
    env: Mutex<Option<ResticEnv>>,
}

impl ResticCli {
    /// Use the restic binary at `binary`
    pub fn new(binary: impl Into<PathBuf>, extra: ExtraOptions) -> Self {
        Self {
            binary: binary.into(),
            extra,
            env: Mutex::new(None),
        }
    }

    fn current_env(&self, operation: &str) -> Result<ResticEnv> {
        self.env
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| Error::execution(operation, "restic environment is not set up"))
    }

    async fn restic(&self, operation: &str, args: &[String]) -> Result<String> {
        let env = self.current_env(operation)?;
        debug!(operation, args = ?args, "Running restic");
        let output = Command::new(&self.binary)
            .args(&env.global_args)
            .args(args)
            .envs(&env.vars)
            .output()
            .await
            .map_err(|e| Error::execution(operation, format!("failed to run restic: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::execution(
                operation,
                format!("restic exited with {}: {}", output.status, stderr.trim()),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl BackupExecutor for ResticCli {
    async fn setup_environment(
        &self,
        repository: &Repository,
        secret: &Secret,
        smart_prefix: &str,
    ) -> Result<String> {
        let setup = setup_options_for_repository(repository, &self.extra)?;
        let prefix = join_prefix(&setup.path, smart_prefix);
        let data = secret_strings(secret);

        let mut vars = credential_env(&setup.provider, &data)?;
        vars.insert(
            "RESTIC_REPOSITORY".to_string(),
            repository_url(&setup, &prefix),
        );
        if let Some(region) = &setup.region {
            vars.insert("AWS_DEFAULT_REGION".to_string(), region.clone());
        }
        if setup.enable_cache {
            vars.insert(
                "RESTIC_CACHE_DIR".to_string(),
                setup.scratch_dir.join("restic-cache").display().to_string(),
            );
        }
        if let Some(key) = data.get(GOOGLE_SERVICE_ACCOUNT_JSON_KEY) {
            let path = setup.scratch_dir.join("gcs-service-account.json");
            tokio::fs::write(&path, key).await.map_err(|e| {
                Error::execution("setup", format!("failed to write GCS credentials: {e}"))
            })?;
            vars.insert(
                "GOOGLE_APPLICATION_CREDENTIALS".to_string(),
                path.display().to_string(),
            );
        }

        *self.env.lock().unwrap_or_else(|e| e.into_inner()) = Some(ResticEnv {
            vars,
            global_args: global_args(&setup),
        });
        info!(provider = %setup.provider, prefix = %prefix, "Restic environment ready");
        Ok(prefix)
    }

    async fn init_repository_if_absent(&self) -> Result<()> {
        if self.restic("init", &["cat".to_string(), "config".to_string()]).await.is_ok() {
            debug!("Repository already initialized");
            return Ok(());
        }
        info!("Initializing repository");
        self.restic("init", &["init".to_string()]).await?;
        Ok(())
    }

    async fn run_backup(&self, options: &BackupOptions, repository: &Repository) -> Result<()> {
        info!(
            repository = %repository.metadata.name.as_deref().unwrap_or_default(),
            paths = ?options.backup_paths,
            "Running backup"
        );
        self.restic("backup", &backup_args(options)).await?;
        if let Some(args) = forget_args(&options.retention_policy, &options.host) {
            self.restic("forget", &args).await?;
        }
        Ok(())
    }

    async fn run_check(&self) -> Result<()> {
        self.restic("check", &["check".to_string()]).await?;
        Ok(())
    }
}

fn secret_strings(secret: &Secret) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(&v.0).into_owned()))
        .collect();
    for (k, v) in secret.string_data.iter().flatten() {
        out.insert(k.clone(), v.clone());
    }
    out
}

/// `<path>/<smart_prefix>` without stray slashes
pub fn join_prefix(path: &str, smart_prefix: &str) -> String {
    [path.trim_matches('/'), smart_prefix.trim_matches('/')]
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// restic repository URL for the backend
pub fn repository_url(setup: &SetupOptions, prefix: &str) -> String {
    match setup.provider.as_str() {
        providers::S3 => {
            let endpoint = setup
                .endpoint
                .as_deref()
                .filter(|e| !e.is_empty())
                .unwrap_or("s3.amazonaws.com")
                .trim_end_matches('/');
            format!("s3:{}/{}/{}", endpoint, setup.bucket, prefix)
        }
        providers::GCS => format!("gs:{}:/{}", setup.bucket, prefix),
        providers::AZURE => format!("azure:{}:/{}", setup.bucket, prefix),
        _ => {
            let base = setup.bucket.trim_end_matches('/');
            if prefix.is_empty() {
                base.to_string()
            } else {
                format!("{base}/{prefix}")
            }
        }
    }
}

/// Environment restic needs from the backend Secret
pub fn credential_env(
    provider: &str,
    data: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let password = data.get(RESTIC_PASSWORD).ok_or_else(|| {
        Error::configuration(
            "repository",
            format!("backend secret is missing {RESTIC_PASSWORD}"),
        )
    })?;
    let mut vars = BTreeMap::from([(RESTIC_PASSWORD.to_string(), password.clone())]);
    let keys = CREDENTIAL_KEYS
        .iter()
        .find(|(p, _)| *p == provider)
        .map(|(_, keys)| *keys)
        .unwrap_or_default();
    for key in keys {
        if let Some(value) = data.get(*key) {
            vars.insert((*key).to_string(), value.clone());
        }
    }
    Ok(vars)
}

/// Flags placed before every restic subcommand
pub fn global_args(setup: &SetupOptions) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(cacert) = &setup.cacert_file {
        args.push("--cacert".to_string());
        args.push(cacert.display().to_string());
    }
    if !setup.enable_cache {
        args.push("--no-cache".to_string());
    }
    if let Some(n) = setup.max_connections.filter(|n| *n > 0) {
        let option = match setup.provider.as_str() {
            providers::GCS => Some("gs.connections"),
            providers::AZURE => Some("azure.connections"),
            _ => None,
        };
        if let Some(option) = option {
            args.push("--option".to_string());
            args.push(format!("{option}={n}"));
        }
    }
    args
}

/// Arguments of `restic backup`
pub fn backup_args(options: &BackupOptions) -> Vec<String> {
    let mut args = vec!["backup".to_string()];
    args.extend(options.backup_paths.iter().cloned());
    if !options.host.is_empty() {
        args.push("--host".to_string());
        args.push(options.host.clone());
    }
    for pattern in &options.exclude {
        args.push("--exclude".to_string());
        args.push(pattern.clone());
    }
    args.extend(options.args.iter().cloned());
    args
}

/// Arguments of `restic forget`, `None` if the policy keeps everything
pub fn forget_args(retention: &RetentionPolicy, host: &str) -> Option<Vec<String>> {
    let keeps = [
        ("--keep-last", retention.keep_last),
        ("--keep-hourly", retention.keep_hourly),
        ("--keep-daily", retention.keep_daily),
        ("--keep-weekly", retention.keep_weekly),
        ("--keep-monthly", retention.keep_monthly),
        ("--keep-yearly", retention.keep_yearly),
    ];
    let mut args = vec!["forget".to_string()];
    for (flag, value) in keeps {
        if let Some(n) = value.filter(|n| *n > 0) {
            args.push(flag.to_string());
            args.push(n.to_string());
        }
    }
    for tag in &retention.keep_tags {
        args.push("--keep-tag".to_string());
        args.push(tag.clone());
    }
    if args.len() == 1 {
        return None;
    }
    if !host.is_empty() {
        args.push("--host".to_string());
        args.push(host.to_string());
    }
    if retention.prune {
        args.push("--prune".to_string());
    }
    if retention.dry_run {
        args.push("--dry-run".to_string());
    }
    Some(args)
}
