//! Value serialization for the store.
//!
//! The store persists everything as strings; the serializer decides the
//! encoding. The default is self-describing JSON with a fallback: if a stored
//! string does not decode, it is returned verbatim so legacy unstructured
//! values remain readable.

use igniter_core::IgniterResult;
use serde_json::Value;
use std::sync::Arc;

/// Pluggable value codec.
pub trait Serializer: Send + Sync {
    /// Encodes a value to its stored string form.
    fn encode(&self, value: &Value) -> IgniterResult<String>;

    /// Decodes a stored string back into a value.
    ///
    /// A custom serializer may fail here; consumers on the pub/sub path log
    /// the failure and drop the message.
    fn decode(&self, raw: &str) -> IgniterResult<Value>;
}

/// Shared serializer handle.
pub type SerializerRef = Arc<dyn Serializer>;

/// Default JSON serializer.
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, value: &Value) -> IgniterResult<String> {
        Ok(serde_json::to_string(value)?)
    }

    fn decode(&self, raw: &str) -> IgniterResult<Value> {
        // Legacy values written without the serializer stay readable.
        Ok(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
    }
}

/// The default serializer.
#[must_use]
pub fn default_serializer() -> SerializerRef {
    Arc::new(JsonSerializer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip() {
        let s = JsonSerializer;
        let value = json!({"name": "Alice", "age": 30});
        let encoded = s.encode(&value).unwrap();
        assert_eq!(s.decode(&encoded).unwrap(), value);
    }

    #[test]
    fn test_legacy_fallback() {
        let s = JsonSerializer;
        assert_eq!(
            s.decode("not json at all {").unwrap(),
            Value::String("not json at all {".into())
        );
    }

    #[test]
    fn test_plain_scalars() {
        let s = JsonSerializer;
        assert_eq!(s.decode("42").unwrap(), json!(42));
        assert_eq!(s.decode("\"hello\"").unwrap(), json!("hello"));
    }
}
