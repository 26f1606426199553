//! Condition store for backup invokers
//!
//! Conditions are keyed by (type, target). Each type is set independently;
//! no condition implies another.

use cadence_common::crd::{Condition, ConditionStatus, TargetRef};

/// The referenced Repository exists
pub const REPOSITORY_FOUND: &str = "RepositoryFound";
/// The Repository's storage Secret exists
pub const BACKEND_SECRET_FOUND: &str = "BackendSecretFound";
/// A backup target exists (one entry per target)
pub const BACKUP_TARGET_FOUND: &str = "BackupTargetFound";
/// The trigger CronJob is in its desired state
pub const TRIGGER_SCHEDULE_CREATED: &str = "TriggerScheduleCreated";

/// Condition reasons
pub mod reasons {
    /// Repository lookup succeeded
    pub const REPOSITORY_AVAILABLE: &str = "RepositoryAvailable";
    /// Repository does not exist
    pub const REPOSITORY_NOT_FOUND: &str = "RepositoryNotFound";
    /// Repository lookup failed
    pub const UNABLE_TO_CHECK_REPOSITORY: &str = "UnableToCheckRepositoryAvailability";
    /// Backend secret lookup succeeded
    pub const BACKEND_SECRET_AVAILABLE: &str = "BackendSecretAvailable";
    /// Backend secret does not exist
    pub const BACKEND_SECRET_NOT_FOUND: &str = "BackendSecretNotFound";
    /// Backend secret lookup failed
    pub const UNABLE_TO_CHECK_BACKEND_SECRET: &str = "UnableToCheckBackendSecretAvailability";
    /// Target lookup succeeded
    pub const TARGET_AVAILABLE: &str = "TargetAvailable";
    /// Target does not exist
    pub const TARGET_NOT_FOUND: &str = "TargetNotFound";
    /// Target lookup failed
    pub const UNABLE_TO_CHECK_TARGET: &str = "UnableToCheckTargetAvailability";
    /// CronJob created or updated
    pub const CRON_JOB_CREATED: &str = "CronJobCreated";
    /// CronJob could not be created or updated
    pub const CRON_JOB_CREATION_FAILED: &str = "CronJobCreationFailed";
}

/// Conditions of one invoker
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConditionSet {
    conditions: Vec<Condition>,
}

impl ConditionSet {
    /// Start from the conditions stored on the invoker
    pub fn from_status(conditions: &[Condition]) -> Self {
        Self {
            conditions: conditions.to_vec(),
        }
    }

    /// Insert or overwrite the entry for (type, target)
    ///
    /// Returns true if anything changed. The transition time is carried over
    /// when the status did not change.
    pub fn set(&mut self, mut condition: Condition) -> bool {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_ && c.target == condition.target)
        {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                if *existing == condition {
                    return false;
                }
                *existing = condition;
                true
            }
            None => {
                self.conditions.push(condition);
                true
            }
        }
    }

    /// Entry for (type, target)
    pub fn get(&self, type_: &str, target: Option<&TargetRef>) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.type_ == type_ && c.target.as_ref() == target)
    }

    /// Status for (type, target), `Unknown` if never set
    pub fn status(&self, type_: &str, target: Option<&TargetRef>) -> ConditionStatus {
        self.get(type_, target)
            .map(|c| c.status)
            .unwrap_or(ConditionStatus::Unknown)
    }

    /// All entries
    pub fn as_slice(&self) -> &[Condition] {
        &self.conditions
    }
}

pub(crate) fn repository_found(generation: Option<i64>, repo: &str) -> Condition {
    Condition::new(
        REPOSITORY_FOUND,
        ConditionStatus::True,
        reasons::REPOSITORY_AVAILABLE,
        format!("Repository {repo} exists."),
    )
    .observed_at(generation)
}

pub(crate) fn repository_not_found(generation: Option<i64>, repo: &str) -> Condition {
    Condition::new(
        REPOSITORY_FOUND,
        ConditionStatus::False,
        reasons::REPOSITORY_NOT_FOUND,
        format!("Repository {repo} does not exist."),
    )
    .observed_at(generation)
}

pub(crate) fn repository_unknown(generation: Option<i64>, repo: &str, err: &str) -> Condition {
    Condition::new(
        REPOSITORY_FOUND,
        ConditionStatus::Unknown,
        reasons::UNABLE_TO_CHECK_REPOSITORY,
        format!("Failed to check whether Repository {repo} exists: {err}"),
    )
    .observed_at(generation)
}

pub(crate) fn secret_found(generation: Option<i64>, secret: &str) -> Condition {
    Condition::new(
        BACKEND_SECRET_FOUND,
        ConditionStatus::True,
        reasons::BACKEND_SECRET_AVAILABLE,
        format!("Backend Secret {secret} exists."),
    )
    .observed_at(generation)
}

pub(crate) fn secret_not_found(generation: Option<i64>, secret: &str) -> Condition {
    Condition::new(
        BACKEND_SECRET_FOUND,
        ConditionStatus::False,
        reasons::BACKEND_SECRET_NOT_FOUND,
        format!("Backend Secret {secret} does not exist."),
    )
    .observed_at(generation)
}

pub(crate) fn secret_name_missing(generation: Option<i64>, repo: &str) -> Condition {
    Condition::new(
        BACKEND_SECRET_FOUND,
        ConditionStatus::False,
        reasons::BACKEND_SECRET_NOT_FOUND,
        format!("Repository {repo} does not name a storage Secret."),
    )
    .observed_at(generation)
}

pub(crate) fn secret_unknown(generation: Option<i64>, secret: &str, err: &str) -> Condition {
    Condition::new(
        BACKEND_SECRET_FOUND,
        ConditionStatus::Unknown,
        reasons::UNABLE_TO_CHECK_BACKEND_SECRET,
        format!("Failed to check whether Backend Secret {secret} exists: {err}"),
    )
    .observed_at(generation)
}

pub(crate) fn target_found(generation: Option<i64>, target: &TargetRef) -> Condition {
    Condition::new(
        BACKUP_TARGET_FOUND,
        ConditionStatus::True,
        reasons::TARGET_AVAILABLE,
        format!("Backup target {target} found."),
    )
    .for_target(target.clone())
    .observed_at(generation)
}

pub(crate) fn target_not_found(generation: Option<i64>, target: &TargetRef) -> Condition {
    Condition::new(
        BACKUP_TARGET_FOUND,
        ConditionStatus::False,
        reasons::TARGET_NOT_FOUND,
        format!("Backup target {target} does not exist."),
    )
    .for_target(target.clone())
    .observed_at(generation)
}

pub(crate) fn target_unknown(generation: Option<i64>, target: &TargetRef, err: &str) -> Condition {
    Condition::new(
        BACKUP_TARGET_FOUND,
        ConditionStatus::Unknown,
        reasons::UNABLE_TO_CHECK_TARGET,
        format!("Unable to verify whether backup target {target} exists: {err}"),
    )
    .for_target(target.clone())
    .observed_at(generation)
}

pub(crate) fn trigger_created(generation: Option<i64>) -> Condition {
    Condition::new(
        TRIGGER_SCHEDULE_CREATED,
        ConditionStatus::True,
        reasons::CRON_JOB_CREATED,
        "Backup trigger CronJob has been created successfully.",
    )
    .observed_at(generation)
}

pub(crate) fn trigger_failed(generation: Option<i64>, err: &str) -> Condition {
    Condition::new(
        TRIGGER_SCHEDULE_CREATED,
        ConditionStatus::False,
        reasons::CRON_JOB_CREATION_FAILED,
        format!("Failed to create backup trigger CronJob. Reason: {err}"),
    )
    .observed_at(generation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web() -> TargetRef {
        TargetRef::new("apps/v1", "Deployment", "web")
    }

    fn db() -> TargetRef {
        TargetRef::new("apps/v1", "StatefulSet", "db")
    }

    #[test]
    fn set_is_idempotent_for_identical_content() {
        let mut set = ConditionSet::default();
        assert!(set.set(repository_found(Some(1), "repo")));
        assert!(!set.set(repository_found(Some(1), "repo")));
        assert_eq!(set.as_slice().len(), 1);
    }

    #[test]
    fn different_status_overwrites_and_moves_transition_time() {
        let mut set = ConditionSet::default();
        let mut first = repository_not_found(Some(1), "repo");
        first.last_transition_time = chrono::Utc::now() - chrono::Duration::minutes(10);
        let original_time = first.last_transition_time;
        set.set(first);

        assert!(set.set(repository_found(Some(1), "repo")));
        let current = set.get(REPOSITORY_FOUND, None).unwrap();
        assert_eq!(current.status, ConditionStatus::True);
        assert_ne!(current.last_transition_time, original_time);
    }

    #[test]
    fn same_status_keeps_transition_time() {
        let mut set = ConditionSet::default();
        let mut first = target_not_found(Some(1), &web());
        first.last_transition_time = chrono::Utc::now() - chrono::Duration::minutes(10);
        let original_time = first.last_transition_time;
        set.set(first);

        // New generation changes content but not status
        assert!(set.set(target_not_found(Some(2), &web())));
        let current = set.get(BACKUP_TARGET_FOUND, Some(&web())).unwrap();
        assert_eq!(current.last_transition_time, original_time);
        assert_eq!(current.observed_generation, Some(2));
    }

    #[test]
    fn one_entry_per_type_and_target() {
        let mut set = ConditionSet::default();
        set.set(target_found(Some(1), &web()));
        set.set(target_not_found(Some(1), &db()));
        set.set(target_not_found(Some(1), &web()));

        assert_eq!(set.as_slice().len(), 2);
        assert_eq!(
            set.status(BACKUP_TARGET_FOUND, Some(&web())),
            ConditionStatus::False
        );
        assert_eq!(
            set.status(BACKUP_TARGET_FOUND, Some(&db())),
            ConditionStatus::False
        );
    }

    #[test]
    fn types_are_independent() {
        let mut set = ConditionSet::default();
        set.set(repository_found(Some(1), "repo"));
        set.set(secret_not_found(Some(1), "creds"));

        assert_eq!(set.status(REPOSITORY_FOUND, None), ConditionStatus::True);
        assert_eq!(set.status(BACKEND_SECRET_FOUND, None), ConditionStatus::False);
        assert_eq!(
            set.status(TRIGGER_SCHEDULE_CREATED, None),
            ConditionStatus::Unknown
        );
    }
}
