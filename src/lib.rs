//! Bifrost - client-side service pool for dynamic endpoint sets
//!
//! This crate lets a caller invoke a service distributed across a changing
//! set of network endpoints without knowing which endpoint is healthy,
//! which is in use, or how to recover from a failed call. A
//! [`ServicePool`] tracks endpoint membership, selects an endpoint per
//! call, caches per-endpoint client instances, and retries failed calls
//! according to a pluggable [`RetryPolicy`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bifrost::{
//!     Endpoint, FixedHostDiscovery, PoolError, RetryNTimes, ServicePoolBuilder,
//! };
//!
//! # struct CalculatorClient;
//! # impl CalculatorClient { async fn add(&self, _a: i64, _b: i64) -> Result<i64, std::io::Error> { Ok(3) } }
//! # struct CalculatorFactory;
//! # #[async_trait::async_trait]
//! # impl bifrost::InstanceFactory<CalculatorClient> for CalculatorFactory {
//! #     fn service_name(&self) -> &str { "calculator" }
//! #     async fn create(&self, _: &Endpoint) -> bifrost::Result<CalculatorClient> { Ok(CalculatorClient) }
//! #     async fn destroy(&self, _: &Endpoint, _: Arc<CalculatorClient>) -> bifrost::Result<()> { Ok(()) }
//! # }
//! #[tokio::main]
//! async fn main() -> bifrost::Result<()> {
//!     let discovery = Arc::new(FixedHostDiscovery::new([
//!         Endpoint::builder().service_name("calculator").id("10.0.0.1:8080").build()?,
//!         Endpoint::builder().service_name("calculator").id("10.0.0.2:8080").build()?,
//!     ]));
//!
//!     let pool = ServicePoolBuilder::new()
//!         .host_discovery(discovery)
//!         .instance_factory(Arc::new(CalculatorFactory))
//!         .build()?;
//!
//!     let sum = pool
//!         .execute(&RetryNTimes::new(3), |calculator| async move {
//!             calculator.add(1, 2).await.map_err(PoolError::service)
//!         })
//!         .await?;
//!
//!     println!("{sum}");
//!     pool.close().await;
//!     Ok(())
//! }
//! ```
//!
//! Callbacks classify their own failures: [`PoolError::service`] marks the
//! endpoint bad and drives the retry loop, [`PoolError::application`]
//! propagates immediately without retry.
//!
//! # Presenting a pool as a service interface
//!
//! Instead of dynamic proxies, write a small adapter whose methods
//! delegate to [`ServicePool::execute`]:
//!
//! ```rust,ignore
//! struct PooledCalculator {
//!     pool: Arc<ServicePool<CalculatorClient>>,
//!     retry: RetryNTimes,
//! }
//!
//! impl PooledCalculator {
//!     async fn add(&self, a: i64, b: i64) -> bifrost::Result<i64> {
//!         self.pool
//!             .execute(&self.retry, move |c| async move {
//!                 c.add(a, b).await.map_err(PoolError::service)
//!             })
//!             .await
//!     }
//! }
//! ```

pub mod balance;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod factory;
pub mod health;
pub mod partition;
pub mod pool;
pub mod retry;
pub mod telemetry;

// Re-export main types at crate root
pub use balance::{LoadBalanceAlgorithm, PoolStatistics, RandomAlgorithm};
pub use discovery::{EndpointEvent, FixedHostDiscovery, HostDiscovery};
pub use endpoint::{Endpoint, EndpointBuilder, EndpointKey};
pub use error::{BoxError, PoolError, Result};
pub use factory::InstanceFactory;
pub use health::{HealthCheckResult, HealthCheckResults};
pub use partition::{
    ConsistentHashPartitionFilter, IdentityPartitionFilter, PartitionContext,
    PartitionContextBuilder, PartitionFilter,
};
pub use pool::{
    AsyncServicePool, CachingPolicy, CachingPolicyBuilder, EndpointResult, ExhaustionAction,
    InstanceCache, ServiceHandle, ServicePool, ServicePoolBuilder,
};
pub use retry::{ExponentialBackoffRetry, RetryNTimes, RetryPolicy};
