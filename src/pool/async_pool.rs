//! Detached execution on an explicitly owned runtime.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;

use super::dispatcher::{EndpointResult, ServicePool};
use crate::Result;
use crate::retry::RetryPolicy;

/// A service pool whose calls run detached on a caller-supplied runtime.
///
/// The runtime handle is passed in explicitly at construction: the pool
/// owns no global executor and its lifecycle is the caller's, not the
/// process's. Dropping the returned [`JoinHandle`] detaches the call;
/// aborting it cancels the call at its next await point.
pub struct AsyncServicePool<S> {
    pool: Arc<ServicePool<S>>,
    runtime: tokio::runtime::Handle,
}

impl<S: Send + Sync + 'static> AsyncServicePool<S> {
    /// Wrap a pool with a runtime handle for detached execution.
    pub fn new(pool: Arc<ServicePool<S>>, runtime: tokio::runtime::Handle) -> Self {
        Self { pool, runtime }
    }

    /// The underlying synchronous pool.
    pub fn pool(&self) -> &Arc<ServicePool<S>> {
        &self.pool
    }

    /// Execute a callback against one endpoint, detached.
    ///
    /// Runs the same state machine as [`ServicePool::execute`], on a
    /// worker instead of the caller's task.
    pub fn execute<R, F, Fut>(
        &self,
        retry: Arc<dyn RetryPolicy>,
        callback: F,
    ) -> JoinHandle<Result<R>>
    where
        R: Send + 'static,
        F: Fn(Arc<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let pool = self.pool.clone();
        self.runtime
            .spawn(async move { pool.execute(retry.as_ref(), callback).await })
    }

    /// Execute a callback once per valid endpoint, detached.
    pub fn execute_on_all<R, F, Fut>(
        &self,
        retry: Arc<dyn RetryPolicy>,
        callback: F,
    ) -> JoinHandle<Vec<EndpointResult<R>>>
    where
        R: Send + 'static,
        F: Fn(Arc<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let pool = self.pool.clone();
        self.runtime
            .spawn(async move { pool.execute_on_all(retry.as_ref(), callback).await })
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
