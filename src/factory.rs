//! External service instance factory.

use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::endpoint::Endpoint;

/// Creates and destroys the per-endpoint client instances the pool hands
/// to callbacks.
///
/// An instance is whatever concrete client object talks to one endpoint —
/// an HTTP client bound to a base URL, a connection handle, etc. The pool
/// never inspects instances; it caches them per endpoint and shares them
/// behind `Arc` so that an in-flight caller can finish with an instance
/// that has already been scheduled for destruction.
#[async_trait]
pub trait InstanceFactory<S>: Send + Sync {
    /// The name of the service this factory builds clients for.
    fn service_name(&self) -> &str;

    /// Create a new instance connected to the given endpoint.
    ///
    /// Failures propagate to the checkout caller unwrapped; the cache
    /// does not retry creation. Retry is the dispatcher's responsibility.
    async fn create(&self, endpoint: &Endpoint) -> Result<S>;

    /// Tear down an instance.
    ///
    /// Best effort: destruction happens asynchronously long after the
    /// originating call returned, so errors are logged by the cache and
    /// never surfaced to a caller. A holder that leaked an extra `Arc`
    /// clone keeps the value alive past this call; implementations should
    /// release resources through `&self` methods on the instance.
    async fn destroy(&self, endpoint: &Endpoint, instance: Arc<S>) -> Result<()>;

    /// Probe whether the endpoint is currently healthy.
    ///
    /// The default implementation reports every endpoint healthy, for
    /// factories whose service exposes no health endpoint.
    async fn is_healthy(&self, _endpoint: &Endpoint) -> bool {
        true
    }
}
