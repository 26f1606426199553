//! Backup invoker controllers and the backup scheduler for Cadence
//!
//! - **invoker**: normalized view over BackupConfiguration and BackupBatch
//! - **conditions**: per-invoker condition store
//! - **controller**: reconciles invokers (dependency checks, trigger schedule, teardown)
//! - **trigger**: the CronJob that creates a BackupSession on each schedule tick
//! - **dispatcher**: routes target notifications to per-workload-kind queues
//! - **workload**: workload controllers that mark workloads needing a backup sidecar
//! - **scheduler**: run lock and in-process cron used by the backup sidecar
//! - **sidecar**: backup scheduler entrypoint with leader election
//! - **session**: creates BackupSessions for the trigger CronJob
//! - **executor** / **options**: the backup engine collaborator and its inputs

pub mod client;
pub mod conditions;
pub mod controller;
pub mod dispatcher;
pub mod executor;
pub mod invoker;
pub mod options;
pub mod scheduler;
pub mod session;
pub mod sidecar;
pub mod trigger;
pub mod workload;

pub use invoker::{BackupInvoker, BackupModel, InvokerKind, InvokerResource, TargetInfo};
