//! Injected per-job context production.
//!
//! The application supplies a factory that builds the context value handed
//! to every handler invocation (database handles, request-scoped data, …).
//! A factory failure fails the job with `INVALID_CONTEXT`.

use async_trait::async_trait;
use futures::future::BoxFuture;
use igniter_core::{IgniterError, IgniterResult};
use serde_json::Value;
use std::sync::Arc;

/// Producer of the per-execution context value.
#[async_trait]
pub trait ContextFactory: Send + Sync {
    /// Builds the context for one handler invocation.
    async fn create(&self) -> IgniterResult<Value>;
}

/// Shared factory handle.
pub type ContextFactoryRef = Arc<dyn ContextFactory>;

/// Factory producing `null` for applications without shared context.
pub struct NullContextFactory;

#[async_trait]
impl ContextFactory for NullContextFactory {
    async fn create(&self) -> IgniterResult<Value> {
        Ok(Value::Null)
    }
}

/// Adapter turning a closure into a [`ContextFactory`].
pub struct FnContextFactory {
    f: Box<dyn Fn() -> BoxFuture<'static, IgniterResult<Value>> + Send + Sync>,
}

impl FnContextFactory {
    /// Wraps an async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = IgniterResult<Value>> + Send + 'static,
    {
        Self {
            f: Box::new(move || Box::pin(f())),
        }
    }
}

#[async_trait]
impl ContextFactory for FnContextFactory {
    async fn create(&self) -> IgniterResult<Value> {
        (self.f)()
            .await
            .map_err(|e| IgniterError::InvalidContext(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_null_factory() {
        assert_eq!(NullContextFactory.create().await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_fn_factory() {
        let factory = FnContextFactory::new(|| async { Ok(json!({"db": "ready"})) });
        assert_eq!(factory.create().await.unwrap(), json!({"db": "ready"}));
    }

    #[tokio::test]
    async fn test_fn_factory_failure_maps_to_invalid_context() {
        let factory = FnContextFactory::new(|| async { Err(IgniterError::internal("no db")) });
        let err = factory.create().await.unwrap_err();
        assert!(err.is("INVALID_CONTEXT"));
    }
}
