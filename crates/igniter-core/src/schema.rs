//! Payload schema seam.
//!
//! Event and job payload schemas are opaque validators: anything that can
//! inspect a JSON value and report issues. Adapters are provided for plain
//! serde deserialization and for `validator`-derived types.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use validator::Validate;

/// A single validation issue, carried as error diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaIssue {
    /// Path into the payload that failed (empty for whole-value issues).
    pub path: String,
    /// Human-readable description of the failure.
    pub message: String,
}

impl SchemaIssue {
    /// Creates a new issue.
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Opaque payload validator.
///
/// Registered against event names and job definitions; invoked on publish,
/// subscribe, and enqueue depending on the configured validation options.
pub trait PayloadSchema: Send + Sync {
    /// Validates a payload, returning the collected issues on failure.
    fn validate(&self, value: &Value) -> Result<(), Vec<SchemaIssue>>;
}

/// Shared schema handle.
pub type SchemaRef = Arc<dyn PayloadSchema>;

/// Schema that accepts any payload.
pub struct AnySchema;

impl PayloadSchema for AnySchema {
    fn validate(&self, _value: &Value) -> Result<(), Vec<SchemaIssue>> {
        Ok(())
    }
}

/// Schema backed by serde deserialization into `T`.
///
/// The payload is valid when it deserializes; the serde error message is
/// reported as a single whole-value issue otherwise.
pub struct TypedSchema<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for TypedSchema<T> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned + Send + Sync> PayloadSchema for TypedSchema<T> {
    fn validate(&self, value: &Value) -> Result<(), Vec<SchemaIssue>> {
        match serde_json::from_value::<T>(value.clone()) {
            Ok(_) => Ok(()),
            Err(e) => Err(vec![SchemaIssue::new("", e.to_string())]),
        }
    }
}

/// Schema backed by serde deserialization plus `validator` field rules.
pub struct ValidatedSchema<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for ValidatedSchema<T> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned + Validate + Send + Sync> PayloadSchema for ValidatedSchema<T> {
    fn validate(&self, value: &Value) -> Result<(), Vec<SchemaIssue>> {
        let parsed: T = serde_json::from_value(value.clone())
            .map_err(|e| vec![SchemaIssue::new("", e.to_string())])?;

        parsed.validate().map_err(|errors| {
            errors
                .field_errors()
                .into_iter()
                .flat_map(|(field, errs)| {
                    errs.iter().map(move |e| {
                        let message = e
                            .message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| e.code.to_string());
                        SchemaIssue::new(field.to_string(), message)
                    })
                })
                .collect()
        })
    }
}

/// Schema accepting any payload.
#[must_use]
pub fn any() -> SchemaRef {
    Arc::new(AnySchema)
}

/// Schema requiring the payload to deserialize as `T`.
#[must_use]
pub fn typed<T: DeserializeOwned + Send + Sync + 'static>() -> SchemaRef {
    Arc::new(TypedSchema::<T>::default())
}

/// Schema requiring deserialization as `T` plus `T`'s field rules.
#[must_use]
pub fn validated<T: DeserializeOwned + Validate + Send + Sync + 'static>() -> SchemaRef {
    Arc::new(ValidatedSchema::<T>::default())
}
