//! Repository Custom Resource Definition
//!
//! A Repository names the storage backend snapshots are written to and the
//! Secret that holds its credentials.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// S3 (or S3-compatible) backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3Spec {
    /// Endpoint URL (e.g., "s3.amazonaws.com" or a MinIO address)
    pub endpoint: String,
    /// Bucket name
    pub bucket: String,
    /// Path prefix inside the bucket
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    /// Bucket region
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
}

/// Google Cloud Storage backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GcsSpec {
    /// Bucket name
    pub bucket: String,
    /// Path prefix inside the bucket
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    /// Maximum concurrent connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<i64>,
}

/// Azure Blob Storage backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureSpec {
    /// Container name
    pub container: String,
    /// Path prefix inside the container
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    /// Maximum concurrent connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<i64>,
}

/// Local (mounted volume) backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalSpec {
    /// Where the volume is mounted
    pub mount_path: String,
    /// Sub-directory inside the volume
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub_path: String,
}

/// Storage backend for a Repository
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    /// Secret in the repository namespace holding backend credentials
    #[serde(default)]
    pub storage_secret_name: String,

    /// S3 configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Spec>,

    /// GCS configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs: Option<GcsSpec>,

    /// Azure configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureSpec>,

    /// Local volume configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalSpec>,
}

/// Storage provider identifiers understood by the backup engine
pub mod providers {
    /// Amazon S3 and compatibles
    pub const S3: &str = "s3";
    /// Google Cloud Storage
    pub const GCS: &str = "gcs";
    /// Azure Blob Storage
    pub const AZURE: &str = "azure";
    /// Local volume
    pub const LOCAL: &str = "local";
}

impl Backend {
    fn missing(&self) -> Error {
        Error::configuration("repository", "no storage backend specified")
    }

    /// Provider identifier of the configured backend
    pub fn provider(&self) -> Result<&'static str> {
        if self.s3.is_some() {
            Ok(providers::S3)
        } else if self.gcs.is_some() {
            Ok(providers::GCS)
        } else if self.azure.is_some() {
            Ok(providers::AZURE)
        } else if self.local.is_some() {
            Ok(providers::LOCAL)
        } else {
            Err(self.missing())
        }
    }

    /// Bucket, container or mount path holding the repository
    pub fn container(&self) -> Result<String> {
        if let Some(s3) = &self.s3 {
            Ok(s3.bucket.clone())
        } else if let Some(gcs) = &self.gcs {
            Ok(gcs.bucket.clone())
        } else if let Some(azure) = &self.azure {
            Ok(azure.container.clone())
        } else if let Some(local) = &self.local {
            Ok(local.mount_path.clone())
        } else {
            Err(self.missing())
        }
    }

    /// Path prefix inside the container
    pub fn prefix(&self) -> Result<String> {
        if let Some(s3) = &self.s3 {
            Ok(s3.prefix.clone())
        } else if let Some(gcs) = &self.gcs {
            Ok(gcs.prefix.clone())
        } else if let Some(azure) = &self.azure {
            Ok(azure.prefix.clone())
        } else if let Some(local) = &self.local {
            Ok(local.sub_path.clone())
        } else {
            Err(self.missing())
        }
    }

    /// Endpoint URL; only S3 has one
    pub fn endpoint(&self) -> Option<&str> {
        self.s3.as_ref().map(|s3| s3.endpoint.as_str())
    }

    /// Bucket region; only S3 has one
    pub fn region(&self) -> Option<&str> {
        self.s3
            .as_ref()
            .map(|s3| s3.region.as_str())
            .filter(|r| !r.is_empty())
    }

    /// Connection cap for backends that support one
    pub fn max_connections(&self) -> Option<i64> {
        self.gcs
            .as_ref()
            .and_then(|g| g.max_connections)
            .or_else(|| self.azure.as_ref().and_then(|a| a.max_connections))
    }
}

/// Specification for a Repository
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cadence.dev",
    version = "v1alpha1",
    kind = "Repository",
    plural = "repositories",
    shortname = "repo",
    namespaced,
    printcolumn = r#"{"name":"Secret","type":"string","jsonPath":".spec.backend.storageSecretName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySpec {
    /// Where snapshots are stored
    pub backend: Backend,

    /// Remove the backend data when the Repository is deleted
    #[serde(default)]
    pub wipe_out: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_spec(yaml: &str) -> RepositorySpec {
        serde_yaml::from_str(yaml).expect("parse spec")
    }

    #[test]
    fn test_s3_backend_accessors() {
        let spec = parse_spec(
            r#"
backend:
  storageSecretName: s3-secret
  s3:
    endpoint: s3.amazonaws.com
    bucket: backups
    prefix: demo
    region: us-east-1
"#,
        );
        let backend = &spec.backend;
        assert_eq!(backend.storage_secret_name, "s3-secret");
        assert_eq!(backend.provider().unwrap(), providers::S3);
        assert_eq!(backend.container().unwrap(), "backups");
        assert_eq!(backend.prefix().unwrap(), "demo");
        assert_eq!(backend.endpoint(), Some("s3.amazonaws.com"));
        assert_eq!(backend.region(), Some("us-east-1"));
        assert_eq!(backend.max_connections(), None);
    }

    #[test]
    fn test_gcs_backend_accessors() {
        let spec = parse_spec(
            r#"
backend:
  storageSecretName: gcs-secret
  gcs:
    bucket: cadence
    maxConnections: 4
"#,
        );
        assert_eq!(spec.backend.provider().unwrap(), providers::GCS);
        assert_eq!(spec.backend.prefix().unwrap(), "");
        assert_eq!(spec.backend.endpoint(), None);
        assert_eq!(spec.backend.max_connections(), Some(4));
    }

    #[test]
    fn test_missing_backend_is_configuration_error() {
        let backend = Backend {
            storage_secret_name: "s".to_string(),
            ..Default::default()
        };
        assert!(matches!(backend.provider(), Err(Error::Configuration { .. })));
        assert!(backend.container().is_err());
        assert!(backend.prefix().is_err());
    }
}
