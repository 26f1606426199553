//! Error types for the Cadence operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each error variant includes contextual information like invoker names,
//! the operation that failed, and underlying causes.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Cadence operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {invoker}: {message}")]
    Validation {
        /// Name of the invoker with invalid configuration
        invoker: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.schedule")
        field: Option<String>,
    },

    /// Configuration that cannot heal without an external change
    #[error("configuration error for {invoker}: {message}")]
    Configuration {
        /// Name of the invoker or policy that is misconfigured
        invoker: String,
        /// Description of what is missing or wrong
        message: String,
    },

    /// Backup, check or repository operation failed in the execution engine
    #[error("execution error [{operation}]: {message}")]
    Execution {
        /// Operation that failed (setup, init, backup, check)
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "dispatcher")
        context: String,
    },

    /// Several independent failures surfaced together
    #[error("{}", join_errors(.errors))]
    Aggregate {
        /// The collected errors, never nested
        errors: Vec<Error>,
    },
}

fn join_errors(errors: &[Error]) -> String {
    match errors.len() {
        0 => String::new(),
        1 => errors[0].to_string(),
        _ => format!(
            "[{}]",
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            invoker: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with invoker context and field path
    pub fn validation_for_field(
        invoker: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            invoker: invoker.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a permanent configuration error for an invoker
    pub fn configuration(invoker: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            invoker: invoker.into(),
            message: msg.into(),
        }
    }

    /// Create an execution error for the given operation
    pub fn execution(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Execution {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Combine several errors into one
    ///
    /// Nested aggregates are flattened. A single error is returned as-is.
    pub fn aggregate(errors: impl IntoIterator<Item = Error>) -> Self {
        let mut flat = Vec::new();
        for err in errors {
            match err {
                Error::Aggregate { errors } => flat.extend(errors),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            return flat.remove(0);
        }
        Self::Aggregate { errors: flat }
    }

    /// Check if this error is retryable
    ///
    /// Validation, configuration and serialization errors require a spec fix.
    /// Kubernetes 4xx errors are not retried; transport failures are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Validation { .. } => false,
            Error::Configuration { .. } => false,
            Error::Execution { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
            Error::Aggregate { errors } => errors.iter().any(Error::is_retryable),
        }
    }

    /// Get the invoker name if this error is associated with a specific invoker
    pub fn invoker(&self) -> Option<&str> {
        match self {
            Error::Validation { invoker, .. } => Some(invoker),
            Error::Configuration { invoker, .. } => Some(invoker),
            _ => None,
        }
    }
}

/// Returns true when the API server answered 404 for the request
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Returns true when the API server rejected a write with 409 Conflict
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("code {}", code),
            reason: "Test".to_string(),
            code,
        })
    }

    /// Story: a missing repository is not a process error but a lookup
    /// failure is, and the two must be distinguishable
    #[test]
    fn story_not_found_is_distinct_from_lookup_failure() {
        assert!(is_not_found(&api_error(404)));
        assert!(!is_not_found(&api_error(500)));
        assert!(is_conflict(&api_error(409)));
        assert!(!is_conflict(&api_error(404)));
    }

    #[test]
    fn story_permanent_errors_are_not_retried() {
        assert!(!Error::configuration("bc", "missing repository secret name").is_retryable());
        assert!(!Error::validation("bad schedule").is_retryable());
        assert!(!Error::serialization("bad json").is_retryable());
        assert!(Error::execution("backup", "restic exited 1").is_retryable());
        assert!(Error::internal("queue closed").is_retryable());
    }

    #[test]
    fn kube_client_errors_are_not_retried_but_server_errors_are() {
        let err: Error = api_error(403).into();
        assert!(!err.is_retryable());
        let err: Error = api_error(503).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn aggregate_flattens_and_joins() {
        let inner = Error::aggregate(vec![Error::internal("a"), Error::internal("b")]);
        let outer = Error::aggregate(vec![inner, Error::validation("c")]);
        match &outer {
            Error::Aggregate { errors } => assert_eq!(errors.len(), 3),
            _ => panic!("Expected Aggregate variant"),
        }
        let msg = outer.to_string();
        assert!(msg.starts_with('['));
        assert!(msg.contains("internal error [unknown]: a"));
        assert!(msg.contains("validation error for unknown: c"));
    }

    #[test]
    fn aggregate_of_one_is_the_error_itself() {
        let err = Error::aggregate(vec![Error::configuration("bc", "no secret")]);
        assert!(matches!(err, Error::Configuration { .. }));
        assert_eq!(err.invoker(), Some("bc"));
    }

    #[test]
    fn aggregate_is_retryable_if_any_member_is() {
        let err = Error::aggregate(vec![Error::validation("x"), Error::internal("y")]);
        assert!(err.is_retryable());
        let err = Error::aggregate(vec![Error::validation("x"), Error::serialization("y")]);
        assert!(!err.is_retryable());
    }

    #[test]
    fn validation_with_field_keeps_path() {
        let err = Error::validation_for_field("nightly", "spec.schedule", "invalid cron");
        match &err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("spec.schedule")),
            _ => panic!("Expected Validation variant"),
        }
        assert!(err.to_string().contains("nightly"));
    }
}
