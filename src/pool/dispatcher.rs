//! The service pool dispatcher.
//!
//! `ServicePool` orchestrates the other components: on each call it polls
//! membership, filters out bad endpoints, applies the partition filter and
//! the load balance algorithm, checks an instance out of the cache, runs
//! the caller's callback against it, classifies the outcome and retries
//! per policy.
//!
//! # Call flow
//!
//! ```text
//! execute(retry, callback)
//!     │
//!     ▼
//! ┌──────────────┐  candidates   ┌─────────────────┐  subset  ┌───────────┐
//! │ HostDiscovery│ ─────────────►│ PartitionFilter │ ────────►│  Balance  │
//! └──────────────┘  minus bad    └─────────────────┘          └─────┬─────┘
//!                                                                   │ one
//!                                                                   ▼
//!                              ┌────────────┐  instance   ┌───────────────┐
//!                              │  callback  │ ◄────────── │ InstanceCache │
//!                              └─────┬──────┘   checkout  └───────────────┘
//!                                    │ classify: success / service / app
//!                                    ▼
//!                              RetryPolicy ── allow? ──► loop, or done
//! ```
//!
//! Only application failures and `NoAvailableHosts` cross this boundary
//! directly; every other failure is absorbed into the retry loop and
//! resurfaces wrapped in `RetriesExhausted` once the policy gives up.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::cache::InstanceCache;
use crate::balance::{LoadBalanceAlgorithm, PoolStatistics};
use crate::discovery::{EndpointEvent, HostDiscovery};
use crate::endpoint::{Endpoint, EndpointKey};
use crate::factory::InstanceFactory;
use crate::health::{HealthCheckResult, HealthCheckResults};
use crate::partition::{PartitionContext, PartitionFilter};
use crate::retry::RetryPolicy;
use crate::telemetry;
use crate::{PoolError, Result};

/// Locks a mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Outcome of a broadcast execution against one endpoint.
#[derive(Debug)]
pub struct EndpointResult<R> {
    /// The endpoint the callback ran against.
    pub endpoint: Arc<Endpoint>,
    /// The callback's result, or the exhaustion failure for this endpoint.
    pub result: Result<R>,
}

/// A pool of cached service instances across a dynamic endpoint set.
///
/// Create one through [`ServicePoolBuilder`](super::ServicePoolBuilder).
/// Multiple callers may execute concurrently; unrelated calls never
/// serialize against each other.
pub struct ServicePool<S> {
    service_name: String,
    discovery: Arc<dyn HostDiscovery>,
    factory: Arc<dyn InstanceFactory<S>>,
    cache: Arc<InstanceCache<S>>,
    balance: Arc<dyn LoadBalanceAlgorithm>,
    partition_filter: Arc<dyn PartitionFilter>,
    /// Endpoints excluded from selection after a classified service
    /// failure, until membership changes or a healthy probe clears them.
    bad_endpoints: Mutex<HashSet<EndpointKey>>,
    membership_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<S: Send + Sync + 'static> ServicePool<S> {
    pub(crate) fn new(
        discovery: Arc<dyn HostDiscovery>,
        factory: Arc<dyn InstanceFactory<S>>,
        cache: Arc<InstanceCache<S>>,
        balance: Arc<dyn LoadBalanceAlgorithm>,
        partition_filter: Arc<dyn PartitionFilter>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            service_name: factory.service_name().to_owned(),
            discovery,
            factory,
            cache,
            balance,
            partition_filter,
            bad_endpoints: Mutex::new(HashSet::new()),
            membership_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let events = pool.discovery.subscribe();
        let handle = tokio::spawn(Self::membership_loop(Arc::downgrade(&pool), events));
        *lock(&pool.membership_task) = Some(handle);
        pool
    }

    /// The service name this pool was built for.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Execute a callback against one endpoint of the service, retrying
    /// per `retry` on service-level failures.
    ///
    /// The callback receives a shared handle to the checked-out instance
    /// and classifies its own failures: return
    /// [`PoolError::ServiceFailure`] for "this endpoint misbehaved, try
    /// another" and [`PoolError::Application`] for business errors that
    /// must propagate immediately.
    pub async fn execute<R, F, Fut>(&self, retry: &dyn RetryPolicy, callback: F) -> Result<R>
    where
        F: Fn(Arc<S>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.execute_partitioned(retry, &PartitionContext::empty(), callback)
            .await
    }

    /// Execute a callback against an endpoint eligible for the partition
    /// described by `context`.
    #[instrument(skip_all, fields(service = %self.service_name))]
    pub async fn execute_partitioned<R, F, Fut>(
        &self,
        retry: &dyn RetryPolicy,
        context: &PartitionContext,
        callback: F,
    ) -> Result<R>
    where
        F: Fn(Arc<S>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let start = Instant::now();
        let mut attempts: u32 = 0;
        // Endpoints that failed during *this* call; consulted on top of
        // the pool-level bad set so a retry never lands on the endpoint
        // that just failed.
        let mut call_bad: HashSet<EndpointKey> = HashSet::new();
        loop {
            attempts += 1;
            match self.attempt(context, &callback, &mut call_bad).await {
                Ok(value) => {
                    self.record_request(start, true);
                    return Ok(value);
                }
                Err(err) if err.is_retryable() => {
                    metrics::counter!(telemetry::RETRIES_TOTAL,
                        "service" => self.service_name.clone(),
                    )
                    .increment(1);
                    if retry.allow_retry(attempts, start.elapsed()).await {
                        continue;
                    }
                    self.record_request(start, false);
                    return Err(PoolError::RetriesExhausted {
                        attempts,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    self.record_request(start, false);
                    return Err(err);
                }
            }
        }
    }

    /// One attempt of the call state machine: select, check out, invoke,
    /// classify.
    async fn attempt<R, F, Fut>(
        &self,
        context: &PartitionContext,
        callback: &F,
        call_bad: &mut HashSet<EndpointKey>,
    ) -> Result<R>
    where
        F: Fn(Arc<S>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let candidates = self.candidates(call_bad);
        let candidates = self.partition_filter.filter(&candidates, context);
        let stats: &dyn PoolStatistics = self.cache.as_ref();
        let Some(endpoint) = self.balance.choose(&candidates, stats) else {
            return Err(PoolError::NoAvailableHosts {
                service: self.service_name.clone(),
            });
        };

        let handle = match self.cache.check_out(&endpoint).await {
            Ok(handle) => handle,
            Err(err) => {
                // Exhaustion and creation failures burn this endpoint for
                // the rest of the call, but are not held against it
                // pool-wide.
                if err.is_retryable() {
                    call_bad.insert(endpoint.key());
                }
                return Err(err);
            }
        };

        match callback(handle.instance()).await {
            Ok(value) => {
                self.cache.check_in(handle).await;
                Ok(value)
            }
            Err(err @ PoolError::Application(_)) => {
                // Business failure: the endpoint is fine, the request is
                // not. Propagates without marking anything bad.
                self.cache.check_in(handle).await;
                Err(err)
            }
            Err(err) => {
                self.cache.check_in(handle).await;
                if err.is_retryable() {
                    self.mark_bad(&endpoint, call_bad);
                }
                Err(err)
            }
        }
    }

    /// Execute a callback once per currently valid endpoint, concurrently.
    ///
    /// Each endpoint gets its own independent retry loop; no backoff state
    /// is shared across endpoints. The result carries one entry per
    /// endpoint, success or exhaustion failure.
    pub async fn execute_on_all<R, F, Fut>(
        &self,
        retry: &dyn RetryPolicy,
        callback: F,
    ) -> Vec<EndpointResult<R>>
    where
        F: Fn(Arc<S>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.execute_on_some(retry, |_| true, callback).await
    }

    /// Execute a callback against every valid endpoint matching the
    /// predicate, concurrently.
    pub async fn execute_on_some<R, F, Fut>(
        &self,
        retry: &dyn RetryPolicy,
        predicate: impl Fn(&Endpoint) -> bool,
        callback: F,
    ) -> Vec<EndpointResult<R>>
    where
        F: Fn(Arc<S>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let endpoints: Vec<Arc<Endpoint>> = self
            .candidates(&HashSet::new())
            .into_iter()
            .filter(|ep| predicate(ep))
            .collect();

        let futures = endpoints.into_iter().map(|endpoint| async {
            let result = self.execute_on_endpoint(retry, &endpoint, &callback).await;
            EndpointResult { endpoint, result }
        });
        futures_util::future::join_all(futures).await
    }

    /// The per-endpoint attempt loop used by broadcast execution.
    async fn execute_on_endpoint<R, F, Fut>(
        &self,
        retry: &dyn RetryPolicy,
        endpoint: &Arc<Endpoint>,
        callback: &F,
    ) -> Result<R>
    where
        F: Fn(Arc<S>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let start = Instant::now();
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let result = self.attempt_on_endpoint(endpoint, callback).await;
            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    if retry.allow_retry(attempts, start.elapsed()).await {
                        continue;
                    }
                    return Err(PoolError::RetriesExhausted {
                        attempts,
                        last: Box::new(err),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt_on_endpoint<R, F, Fut>(&self, endpoint: &Arc<Endpoint>, callback: &F) -> Result<R>
    where
        F: Fn(Arc<S>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        let handle = self.cache.check_out(endpoint).await?;
        match callback(handle.instance()).await {
            Ok(value) => {
                self.cache.check_in(handle).await;
                Ok(value)
            }
            Err(err) => {
                self.cache.check_in(handle).await;
                Err(err)
            }
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Number of endpoints currently eligible for selection.
    pub fn num_valid_end_points(&self) -> usize {
        self.candidates(&HashSet::new()).len()
    }

    /// Number of current members excluded after service failures.
    pub fn num_bad_end_points(&self) -> usize {
        let bad = lock(&self.bad_endpoints);
        self.discovery
            .hosts()
            .iter()
            .filter(|ep| bad.contains(&ep.key()))
            .count()
    }

    /// Probe endpoints for health until a healthy one is found.
    ///
    /// A healthy probe clears the endpoint's bad mark; an unhealthy one
    /// sets it, biasing future selection away from the endpoint.
    pub async fn check_for_healthy_end_point(&self) -> HealthCheckResults {
        let mut results = HealthCheckResults::new();
        for endpoint in self.discovery.hosts() {
            let start = Instant::now();
            let healthy = self.factory.is_healthy(&endpoint).await;
            let elapsed = start.elapsed();
            {
                let mut bad = lock(&self.bad_endpoints);
                if healthy {
                    bad.remove(&endpoint.key());
                } else {
                    bad.insert(endpoint.key());
                }
            }
            results.add(HealthCheckResult::new(healthy, endpoint.id(), elapsed));
            if healthy {
                break;
            }
        }
        results
    }

    /// Close the pool: stop membership tracking and release the cache.
    ///
    /// Idempotent. In-flight calls observe [`PoolError::Closed`] on their
    /// next attempt.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = lock(&self.membership_task).take() {
            handle.abort();
        }
        self.cache.close().await;
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Current membership minus pool-level and call-level bad endpoints.
    ///
    /// Membership is re-polled on every attempt; the result is never
    /// cached across attempts.
    fn candidates(&self, call_bad: &HashSet<EndpointKey>) -> Vec<Arc<Endpoint>> {
        let bad = lock(&self.bad_endpoints);
        self.discovery
            .hosts()
            .into_iter()
            .filter(|ep| {
                let key = ep.key();
                !bad.contains(&key) && !call_bad.contains(&key)
            })
            .collect()
    }

    fn mark_bad(&self, endpoint: &Arc<Endpoint>, call_bad: &mut HashSet<EndpointKey>) {
        call_bad.insert(endpoint.key());
        let newly_bad = lock(&self.bad_endpoints).insert(endpoint.key());
        if newly_bad {
            warn!(service = %self.service_name, endpoint = %endpoint, "marking endpoint bad");
            metrics::counter!(telemetry::BAD_ENDPOINTS_TOTAL,
                "service" => self.service_name.clone(),
            )
            .increment(1);
        }
    }

    fn record_request(&self, start: Instant, ok: bool) {
        let status = if ok { "ok" } else { "error" };
        metrics::counter!(telemetry::REQUESTS_TOTAL,
            "service" => self.service_name.clone(),
            "status" => status,
        )
        .increment(1);
        metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS,
            "service" => self.service_name.clone(),
        )
        .record(start.elapsed().as_secs_f64());
    }

    /// Applies membership events to the cache and the bad-endpoint set.
    ///
    /// Add and remove notifications for a single endpoint arrive in the
    /// order they occurred; either kind clears a stale bad mark.
    async fn membership_loop(
        pool: Weak<Self>,
        mut events: tokio::sync::broadcast::Receiver<EndpointEvent>,
    ) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let Some(pool) = pool.upgrade() else { break };
                    pool.apply_membership_event(event);
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "membership event stream lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    fn apply_membership_event(&self, event: EndpointEvent) {
        match event {
            EndpointEvent::Added(endpoint) => {
                debug!(endpoint = %endpoint, "endpoint added");
                self.cache.register(&endpoint);
                lock(&self.bad_endpoints).remove(&endpoint.key());
            }
            EndpointEvent::Removed(endpoint) => {
                debug!(endpoint = %endpoint, "endpoint removed");
                self.cache.evict(&endpoint);
                lock(&self.bad_endpoints).remove(&endpoint.key());
            }
        }
    }
}
