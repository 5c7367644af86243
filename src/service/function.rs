//! In-process services built from async closures.

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use super::{Service, ServiceError, ServiceRequest};

/// A [`Service`] backed by a closure.
#[derive(Clone)]
pub struct FnService<F> {
    f: F,
}

/// Wraps an async closure as a [`Service`].
///
/// ```
/// use conductor::service::{service_fn, ServiceRegistry, ServiceRequest};
///
/// let registry = ServiceRegistry::new()
///     .with("echo", service_fn(|req: ServiceRequest| async move { Ok(req.payload) }));
/// assert!(registry.contains("echo"));
/// ```
pub fn service_fn<F, Fut>(f: F) -> FnService<F>
where
    F: Fn(ServiceRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ServiceError>> + Send,
{
    FnService { f }
}

#[async_trait]
impl<F, Fut> Service for FnService<F>
where
    F: Fn(ServiceRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ServiceError>> + Send,
{
    async fn call(&self, request: ServiceRequest) -> Result<Value, ServiceError> {
        (self.f)(request).await
    }
}
