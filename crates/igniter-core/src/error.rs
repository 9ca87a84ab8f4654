//! Unified error taxonomy for the store and job queue.
//!
//! Every error carries a stable machine-readable code, an HTTP status hint
//! for callers that surface errors over an API, and optional structured
//! diagnostics (e.g. schema validation issues).

use crate::schema::SchemaIssue;
use serde_json::Value;
use thiserror::Error;

/// Result alias used across all Igniter crates.
pub type IgniterResult<T> = Result<T, IgniterError>;

/// Unified error type for the store and job queue.
#[derive(Debug, Error)]
pub enum IgniterError {
    // ============ Store configuration ============
    /// A store was built without a driver.
    #[error("Store requires an adapter")]
    AdapterRequired,

    /// A store was built without a service name.
    #[error("Store requires a service name")]
    ServiceRequired,

    // ============ Store naming ============
    /// Event namespace fails the naming rules.
    #[error("Invalid event namespace: {namespace}")]
    InvalidNamespace { namespace: String },

    /// Event namespace collides with a reserved prefix.
    #[error("Reserved event namespace: {namespace}")]
    ReservedNamespace { namespace: String },

    /// Event namespace registered twice.
    #[error("Duplicate event namespace: {namespace}")]
    DuplicateNamespace { namespace: String },

    /// Event name registered twice within its group.
    #[error("Duplicate event: {path}")]
    DuplicateEvent { path: String },

    /// Event name fails the naming rules.
    #[error("Invalid event name: {name}")]
    InvalidEventName { name: String },

    /// Scope key already present in the chain.
    #[error("Duplicate scope key: {key}")]
    DuplicateScope { key: String },

    /// Scope key not in the configured allow-list, or malformed.
    #[error("Invalid scope key: {key}")]
    InvalidScopeKey { key: String },

    // ============ Store scoping ============
    /// Empty scope key.
    #[error("Scope key is required")]
    ScopeKeyRequired,

    /// Empty scope identifier.
    #[error("Scope identifier is required")]
    ScopeIdentifierRequired,

    // ============ Store data ============
    /// A payload failed schema validation on publish or subscribe.
    #[error("Schema validation failed for '{path}'")]
    SchemaValidationFailed {
        path: String,
        issues: Vec<SchemaIssue>,
    },

    // ============ Job broker ============
    /// A job name was dispatched that no router registered.
    #[error("Job not registered: {name}")]
    JobNotRegistered { name: String },

    /// No known queue owns the given job id.
    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: String },

    /// Unknown namespace or job accessed through the executor.
    #[error("Invalid job: {path}")]
    InvalidJob { path: String },

    /// Job input failed validation against the definition's schema.
    #[error("Invalid payload for job '{job}'")]
    InvalidPayload { job: String, issues: Vec<SchemaIssue> },

    /// The injected context factory failed.
    #[error("Context factory failed: {0}")]
    InvalidContext(String),

    /// Duplicate namespace in a router merge.
    #[error("Invalid namespace: {namespace}")]
    InvalidJobNamespace { namespace: String },

    // ============ Cron ============
    /// Cron expression is structurally invalid.
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    /// Minute field out of the 0-59 range.
    #[error("Invalid minute value in cron expression: {value}")]
    InvalidMinuteValue { value: String },

    /// Hour field out of the 0-23 range.
    #[error("Invalid hour value in cron expression: {value}")]
    InvalidHourValue { value: String },

    /// A cron field contains characters outside `0-9 * / , -`.
    #[error("Invalid cron field: {field}")]
    InvalidCronField { field: String },

    // ============ Scheduling ============
    /// Conflicting or malformed schedule options.
    #[error("Invalid schedule options: {0}")]
    InvalidScheduleOptions(String),

    /// `at` resolves to a time in the past.
    #[error("Invalid schedule time: {0}")]
    InvalidScheduleTime(String),

    // ============ Infrastructure ============
    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IgniterError {
    /// Returns the stable machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AdapterRequired => "STORE_ADAPTER_REQUIRED",
            Self::ServiceRequired => "STORE_SERVICE_REQUIRED",
            Self::InvalidNamespace { .. } => "STORE_INVALID_NAMESPACE",
            Self::ReservedNamespace { .. } => "STORE_RESERVED_NAMESPACE",
            Self::DuplicateNamespace { .. } => "STORE_DUPLICATE_NAMESPACE",
            Self::DuplicateEvent { .. } => "STORE_DUPLICATE_EVENT",
            Self::InvalidEventName { .. } => "STORE_INVALID_EVENT_NAME",
            Self::DuplicateScope { .. } => "STORE_DUPLICATE_SCOPE",
            Self::InvalidScopeKey { .. } => "STORE_INVALID_SCOPE_KEY",
            Self::ScopeKeyRequired => "STORE_SCOPE_KEY_REQUIRED",
            Self::ScopeIdentifierRequired => "STORE_SCOPE_IDENTIFIER_REQUIRED",
            Self::SchemaValidationFailed { .. } => "STORE_SCHEMA_VALIDATION_FAILED",
            Self::JobNotRegistered { .. } => "JOB_NOT_REGISTERED",
            Self::JobNotFound { .. } => "JOB_NOT_FOUND",
            Self::InvalidJob { .. } => "INVALID_JOB",
            Self::InvalidPayload { .. } => "INVALID_PAYLOAD",
            Self::InvalidContext(_) => "INVALID_CONTEXT",
            Self::InvalidJobNamespace { .. } => "INVALID_NAMESPACE",
            Self::InvalidCronExpression { .. } => "INVALID_CRON_EXPRESSION",
            Self::InvalidMinuteValue { .. } => "INVALID_MINUTE_VALUE",
            Self::InvalidHourValue { .. } => "INVALID_HOUR_VALUE",
            Self::InvalidCronField { .. } => "INVALID_CRON_FIELD",
            Self::InvalidScheduleOptions(_) => "INVALID_SCHEDULE_OPTIONS",
            Self::InvalidScheduleTime(_) => "INVALID_SCHEDULE_TIME",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Redis(_) => "REDIS_ERROR",
            Self::Pool(_) => "REDIS_POOL_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns the HTTP status hint for this error.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::JobNotFound { .. } => 404,
            Self::DuplicateNamespace { .. }
            | Self::DuplicateEvent { .. }
            | Self::DuplicateScope { .. }
            | Self::InvalidJobNamespace { .. } => 409,
            Self::AdapterRequired
            | Self::ServiceRequired
            | Self::Serialization(_)
            | Self::Redis(_)
            | Self::Pool(_)
            | Self::Internal(_) => 500,
            _ => 400,
        }
    }

    /// Returns structured diagnostics where the error carries any.
    #[must_use]
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::SchemaValidationFailed { issues, .. }
            | Self::InvalidPayload { issues, .. } => serde_json::to_value(issues).ok(),
            _ => None,
        }
    }

    /// Guard: checks this error against a stable code.
    #[must_use]
    pub fn is(&self, code: &str) -> bool {
        self.code() == code
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_codes() {
        assert_eq!(IgniterError::AdapterRequired.code(), "STORE_ADAPTER_REQUIRED");
        assert_eq!(
            IgniterError::InvalidNamespace { namespace: "a.b".into() }.code(),
            "STORE_INVALID_NAMESPACE"
        );
        assert_eq!(
            IgniterError::InvalidJobNamespace { namespace: "dup".into() }.code(),
            "INVALID_NAMESPACE"
        );
        assert_eq!(
            IgniterError::JobNotFound { job_id: "1".into() }.code(),
            "JOB_NOT_FOUND"
        );
    }

    #[test]
    fn test_is_guard() {
        let err = IgniterError::InvalidScheduleOptions("at and delay".into());
        assert!(err.is("INVALID_SCHEDULE_OPTIONS"));
        assert!(!err.is("INVALID_SCHEDULE_TIME"));
    }

    #[test]
    fn test_status_hints() {
        assert_eq!(IgniterError::JobNotFound { job_id: "x".into() }.status_code(), 404);
        assert_eq!(
            IgniterError::DuplicateNamespace { namespace: "user".into() }.status_code(),
            409
        );
        assert_eq!(IgniterError::ScopeKeyRequired.status_code(), 400);
        assert_eq!(IgniterError::internal("boom").status_code(), 500);
    }

    #[test]
    fn test_validation_details() {
        let err = IgniterError::SchemaValidationFailed {
            path: "user:created".into(),
            issues: vec![SchemaIssue::new("userId", "expected string")],
        };
        let details = err.details().unwrap();
        assert_eq!(details[0]["path"], "userId");
        assert!(IgniterError::ScopeKeyRequired.details().is_none());
    }
}
