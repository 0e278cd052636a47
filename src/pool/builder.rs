//! Builder for assembling service pools.

use std::sync::Arc;
use std::time::Duration;

use super::async_pool::AsyncServicePool;
use super::cache::{DEFAULT_SWEEP_INTERVAL, InstanceCache};
use super::dispatcher::ServicePool;
use super::policy::CachingPolicy;
use crate::balance::{LoadBalanceAlgorithm, RandomAlgorithm};
use crate::discovery::HostDiscovery;
use crate::factory::InstanceFactory;
use crate::partition::{IdentityPartitionFilter, PartitionFilter};
use crate::{PoolError, Result};

/// Builder for [`ServicePool`].
///
/// A host discovery and an instance factory are required; everything else
/// has defaults: unbounded blocking cache, random load balancing, no
/// partition filtering, 30s sweep interval.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use bifrost::pool::{ServicePoolBuilder, CachingPolicy};
/// # use bifrost::discovery::FixedHostDiscovery;
/// # use bifrost::endpoint::Endpoint;
/// # struct NullFactory;
/// # #[async_trait::async_trait]
/// # impl bifrost::InstanceFactory<()> for NullFactory {
/// #     fn service_name(&self) -> &str { "null" }
/// #     async fn create(&self, _: &Endpoint) -> bifrost::Result<()> { Ok(()) }
/// #     async fn destroy(&self, _: &Endpoint, _: Arc<()>) -> bifrost::Result<()> { Ok(()) }
/// # }
/// # async fn build() -> bifrost::Result<()> {
/// let pool = ServicePoolBuilder::new()
///     .host_discovery(Arc::new(FixedHostDiscovery::empty()))
///     .instance_factory(Arc::new(NullFactory))
///     .caching_policy(CachingPolicy::default())
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ServicePoolBuilder<S> {
    discovery: Option<Arc<dyn HostDiscovery>>,
    factory: Option<Arc<dyn InstanceFactory<S>>>,
    caching_policy: CachingPolicy,
    balance: Arc<dyn LoadBalanceAlgorithm>,
    partition_filter: Arc<dyn PartitionFilter>,
    sweep_interval: Duration,
}

impl<S: Send + Sync + 'static> ServicePoolBuilder<S> {
    /// Create a builder with all optional components defaulted.
    pub fn new() -> Self {
        Self {
            discovery: None,
            factory: None,
            caching_policy: CachingPolicy::default(),
            balance: Arc::new(RandomAlgorithm::new()),
            partition_filter: Arc::new(IdentityPartitionFilter),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// Set the membership source. Required.
    pub fn host_discovery(mut self, discovery: Arc<dyn HostDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Set the instance factory. Required.
    pub fn instance_factory<F>(mut self, factory: Arc<F>) -> Self
    where
        F: InstanceFactory<S> + 'static,
    {
        self.factory = Some(factory);
        self
    }

    /// Set the caching policy. Default: [`CachingPolicy::default`].
    pub fn caching_policy(mut self, policy: CachingPolicy) -> Self {
        self.caching_policy = policy;
        self
    }

    /// Set the load balance algorithm. Default: random.
    pub fn load_balance(mut self, balance: Arc<dyn LoadBalanceAlgorithm>) -> Self {
        self.balance = balance;
        self
    }

    /// Set the partition filter. Default: identity (no narrowing).
    pub fn partition_filter(mut self, filter: Arc<dyn PartitionFilter>) -> Self {
        self.partition_filter = filter;
        self
    }

    /// Set the background eviction sweep interval. Default: 30s.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Build the pool and start its background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Arc<ServicePool<S>>> {
        let discovery = self
            .discovery
            .ok_or_else(|| PoolError::Configuration("host discovery is required".into()))?;
        let factory = self
            .factory
            .ok_or_else(|| PoolError::Configuration("instance factory is required".into()))?;
        let cache = InstanceCache::from_shared(
            factory.clone(),
            self.caching_policy,
            self.sweep_interval,
        );
        Ok(ServicePool::new(
            discovery,
            factory,
            cache,
            self.balance,
            self.partition_filter,
        ))
    }

    /// Build an [`AsyncServicePool`] that spawns calls onto the given
    /// runtime handle.
    pub fn build_async(self, runtime: tokio::runtime::Handle) -> Result<AsyncServicePool<S>> {
        Ok(AsyncServicePool::new(self.build()?, runtime))
    }
}

impl<S: Send + Sync + 'static> Default for ServicePoolBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}
