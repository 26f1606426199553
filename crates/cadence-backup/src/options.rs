//! Inputs for the backup engine
//!
//! Pure builders turning invoker, repository and restore rules into the
//! option structs [`crate::executor::BackupExecutor`] consumes.
//!
//! The backup scheduler uses the backup and setup builders. The restore
//! builders are public API for restore entrypoints built on this crate;
//! Cadence itself ships no restore command.

use std::path::PathBuf;

use cadence_common::crd::{BackupTarget, Repository, RetentionPolicy};
use cadence_common::Result;

/// Options that come from the process rather than from any resource
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExtraOptions {
    /// Host name snapshots are recorded under
    pub host: String,
    /// Directory the backend secret is mounted at
    pub secret_dir: PathBuf,
    /// CA bundle for the backend endpoint
    pub cacert_file: Option<PathBuf>,
    /// Scratch space for the engine
    pub scratch_dir: PathBuf,
    /// Keep a local cache between runs
    pub enable_cache: bool,
}

/// What to back up and how long to keep it
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BackupOptions {
    /// Host name snapshots are recorded under
    pub host: String,
    /// Paths to back up
    pub backup_paths: Vec<String>,
    /// Exclusion patterns
    pub exclude: Vec<String>,
    /// Extra engine arguments
    pub args: Vec<String>,
    /// Snapshot retention
    pub retention_policy: RetentionPolicy,
}

/// Restore rule as written on a restore request
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RestoreRule {
    /// Hosts this rule applies to; empty matches any host
    pub target_hosts: Vec<String>,
    /// Host whose snapshots are restored; defaults to the restoring host
    pub source_host: Option<String>,
    /// Paths to restore
    pub paths: Vec<String>,
    /// Specific snapshots to restore
    pub snapshots: Vec<String>,
    /// Inclusion patterns
    pub include: Vec<String>,
    /// Exclusion patterns
    pub exclude: Vec<String>,
}

/// What to restore on one host
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RestoreOptions {
    /// Host the data is restored on
    pub host: String,
    /// Host whose snapshots are restored
    pub source_host: String,
    /// Paths to restore
    pub restore_paths: Vec<String>,
    /// Specific snapshots to restore
    pub snapshots: Vec<String>,
    /// Inclusion patterns
    pub include: Vec<String>,
    /// Exclusion patterns
    pub exclude: Vec<String>,
}

/// Where the repository lives
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SetupOptions {
    /// Backend provider (s3, gcs, azure, local)
    pub provider: String,
    /// Bucket, container or mount path
    pub bucket: String,
    /// Prefix inside the bucket
    pub path: String,
    /// Custom endpoint (S3-compatible stores)
    pub endpoint: Option<String>,
    /// Bucket region
    pub region: Option<String>,
    /// CA bundle for the endpoint
    pub cacert_file: Option<PathBuf>,
    /// Directory the backend secret is mounted at
    pub secret_dir: PathBuf,
    /// Scratch space for the engine
    pub scratch_dir: PathBuf,
    /// Keep a local cache between runs
    pub enable_cache: bool,
    /// Parallel connections to the backend
    pub max_connections: Option<i64>,
}

/// Backup options for one target
pub fn backup_options_for_target(
    target: Option<&BackupTarget>,
    retention: &RetentionPolicy,
    extra: &ExtraOptions,
) -> BackupOptions {
    let mut opts = BackupOptions {
        host: extra.host.clone(),
        retention_policy: retention.clone(),
        ..Default::default()
    };
    if let Some(target) = target {
        opts.backup_paths = target.paths.clone();
        opts.exclude = target.exclude.clone();
        opts.args = target.args.clone();
    }
    opts
}

/// Restore options for `hostname`
///
/// Library API for restore entrypoints; nothing in the operator calls it.
///
/// A rule listing the host wins immediately. A rule with no target hosts
/// matches too, but later rules are still consulted and a later match
/// replaces it. No match gives empty options.
pub fn restore_options_for_host(hostname: &str, rules: &[RestoreRule]) -> RestoreOptions {
    let mut matched = RestoreOptions::default();
    for rule in rules {
        let applies =
            rule.target_hosts.is_empty() || rule.target_hosts.iter().any(|h| h == hostname);
        if !applies {
            continue;
        }
        matched = RestoreOptions {
            host: hostname.to_string(),
            source_host: rule
                .source_host
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| hostname.to_string()),
            restore_paths: rule.paths.clone(),
            snapshots: rule.snapshots.clone(),
            include: rule.include.clone(),
            exclude: rule.exclude.clone(),
        };
        if !rule.target_hosts.is_empty() {
            return matched;
        }
    }
    matched
}

/// Setup options for a repository
pub fn setup_options_for_repository(
    repository: &Repository,
    extra: &ExtraOptions,
) -> Result<SetupOptions> {
    let backend = &repository.spec.backend;
    Ok(SetupOptions {
        provider: backend.provider()?.to_string(),
        bucket: backend.container()?,
        path: backend.prefix()?,
        endpoint: backend.endpoint().map(str::to_string),
        region: backend.region().map(str::to_string),
        cacert_file: extra.cacert_file.clone(),
        secret_dir: extra.secret_dir.clone(),
        scratch_dir: extra.scratch_dir.clone(),
        enable_cache: extra.enable_cache,
        max_connections: backend.max_connections(),
    })
}
