//! BackupSession Custom Resource Definition
//!
//! One BackupSession is created per scheduled backup run. The trigger
//! CronJob creates them; the backup sidecar or job picks them up.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference from a session to the invoker that triggered it
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvokerRef {
    /// API group of the invoker
    pub api_group: String,
    /// Kind of the invoker (BackupConfiguration or BackupBatch)
    pub kind: String,
    /// Name of the invoker in the session's namespace
    pub name: String,
}

/// Lifecycle phase of a backup session
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BackupSessionPhase {
    /// Session created, not yet picked up
    #[default]
    Pending,
    /// Backup in progress
    Running,
    /// Backup finished successfully
    Succeeded,
    /// Backup failed
    Failed,
    /// Session skipped (e.g., another run was in progress)
    Skipped,
}

impl std::fmt::Display for BackupSessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Skipped => write!(f, "Skipped"),
        }
    }
}

/// Status of a BackupSession
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSessionStatus {
    /// Current phase
    #[serde(default)]
    pub phase: BackupSessionPhase,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Specification for a BackupSession
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cadence.dev",
    version = "v1beta1",
    kind = "BackupSession",
    plural = "backupsessions",
    namespaced,
    status = "BackupSessionStatus",
    printcolumn = r#"{"name":"Invoker","type":"string","jsonPath":".spec.invoker.name"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSessionSpec {
    /// Invoker this session runs for
    pub invoker: InvokerRef,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        assert_eq!(BackupSessionPhase::default().to_string(), "Pending");
        assert_eq!(BackupSessionPhase::Skipped.to_string(), "Skipped");
    }

    #[test]
    fn test_session_spec_camel_case() {
        let spec = BackupSessionSpec {
            invoker: InvokerRef {
                api_group: "cadence.dev".to_string(),
                kind: "BackupConfiguration".to_string(),
                name: "nightly".to_string(),
            },
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["invoker"]["apiGroup"], "cadence.dev");
    }
}
