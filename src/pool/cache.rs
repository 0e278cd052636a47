//! Per-endpoint service instance cache.
//!
//! The `InstanceCache` owns the lifecycle of every service instance the
//! pool hands out: checkout, checkin, eviction, deferred destruction and
//! exhaustion policy enforcement. Each instance moves through
//! `ACTIVE → EVICTED → PENDING_DELETION → DESTROYED`.
//!
//! # Concurrency
//!
//! The live endpoint→slots map is read on every checkout and written only
//! on membership changes, so writes install a fully-new copy (copy-on-
//! write via `ArcSwap`): concurrent readers never observe a partially
//! updated map and never take a lock on the hot read path. Registration,
//! eviction and close are serialized against each other through a single
//! admin mutex so that map swap plus bookkeeping stays atomic as a unit;
//! reads never block on that mutex. Per-endpoint idle lists have their own
//! short-lived locks, so callers hitting different endpoints never
//! serialize against each other.
//!
//! # Staged destruction
//!
//! Evicting an endpoint does not destroy its instances: a consumer that
//! checked one out before the eviction must be able to finish its
//! in-flight call. Idle instances first sit in an *evicted* stage for the
//! configured idle/eviction duration, then in a *pending-deletion* stage
//! for a fixed grace delay, and only then does the background sweeper run
//! the factory's destroy hook. Destroy failures are logged and swallowed
//! so the sweeper never dies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::handle::ServiceHandle;
use super::policy::{CachingPolicy, ExhaustionAction};
use crate::balance::PoolStatistics;
use crate::endpoint::{Endpoint, EndpointKey};
use crate::factory::InstanceFactory;
use crate::telemetry;
use crate::{PoolError, Result};

/// How often the background sweeper runs.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Fixed grace delay in the pending-deletion stage before an instance is
/// destroyed. Independent of configuration: this is headroom for in-flight
/// holders, not a tuning knob.
const PENDING_DELETION_GRACE: Duration = Duration::from_secs(30);

/// Upper bound on tracked recent registrations (duplicate suppression).
const RECENT_REGISTRATION_CAPACITY: u64 = 10_000;

type LiveMap<S> = HashMap<EndpointKey, Arc<EndpointSlots<S>>>;

/// An idle instance waiting for reuse.
struct IdleInstance<S> {
    instance: Arc<S>,
    idle_since: Instant,
}

/// Live state for one endpoint: its idle instances plus counters.
struct EndpointSlots<S> {
    endpoint: Arc<Endpoint>,
    generation: u64,
    idle: Mutex<Vec<IdleInstance<S>>>,
    /// Instances currently checked out.
    num_active: AtomicUsize,
    /// Instances attributed to this endpoint (idle + active), for cap
    /// accounting.
    num_total: AtomicUsize,
    /// Signalled on checkin so WAIT-policy checkouts can wake up.
    returned: Notify,
}

impl<S> EndpointSlots<S> {
    fn new(endpoint: Arc<Endpoint>, generation: u64) -> Self {
        Self {
            endpoint,
            generation,
            idle: Mutex::new(Vec::new()),
            num_active: AtomicUsize::new(0),
            num_total: AtomicUsize::new(0),
            returned: Notify::new(),
        }
    }

    fn pop_idle(&self) -> Option<IdleInstance<S>> {
        lock(&self.idle).pop()
    }
}

/// An instance in one of the two deferred-destruction stages.
struct Staged<S> {
    endpoint: Arc<Endpoint>,
    instance: Arc<S>,
    staged_at: Instant,
}

/// Cache of per-endpoint service instances with staged destruction.
pub struct InstanceCache<S> {
    factory: Arc<dyn InstanceFactory<S>>,
    policy: CachingPolicy,
    service_name: String,
    sweep_interval: Duration,

    live: ArcSwap<LiveMap<S>>,
    /// Serializes register/evict/close so map swap plus staging is atomic.
    admin: Mutex<()>,
    next_generation: AtomicU64,
    /// Global count of live (idle + active) instances.
    total_instances: AtomicUsize,
    /// Endpoints registered or given a new instance within the duplicate-
    /// registration window; presence suppresses a refresh.
    recent_registrations: moka::sync::Cache<EndpointKey, ()>,

    evicted: Mutex<Vec<Staged<S>>>,
    pending_deletion: Mutex<Vec<Staged<S>>>,

    closed: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Locks a mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl<S: Send + Sync + 'static> InstanceCache<S> {
    /// Create a cache and start its background sweeper.
    ///
    /// Must be called from within a tokio runtime. The sweeper holds only
    /// a weak reference, so dropping the cache without calling
    /// [`close`](Self::close) also stops it.
    pub fn new<F>(factory: Arc<F>, policy: CachingPolicy) -> Arc<Self>
    where
        F: InstanceFactory<S> + 'static,
    {
        Self::with_sweep_interval(factory, policy, DEFAULT_SWEEP_INTERVAL)
    }

    /// Create a cache with a custom sweep interval.
    pub fn with_sweep_interval<F>(
        factory: Arc<F>,
        policy: CachingPolicy,
        sweep_interval: Duration,
    ) -> Arc<Self>
    where
        F: InstanceFactory<S> + 'static,
    {
        Self::from_shared(factory, policy, sweep_interval)
    }

    pub(crate) fn from_shared(
        factory: Arc<dyn InstanceFactory<S>>,
        policy: CachingPolicy,
        sweep_interval: Duration,
    ) -> Arc<Self> {
        let window = policy.duplicate_registration_window();
        let recent_registrations = moka::sync::Cache::builder()
            .max_capacity(RECENT_REGISTRATION_CAPACITY)
            .time_to_live(window.max(Duration::from_millis(1)))
            .build();
        let service_name = factory.service_name().to_owned();
        let cache = Arc::new(Self {
            factory,
            policy,
            service_name,
            sweep_interval,
            live: ArcSwap::from_pointee(HashMap::new()),
            admin: Mutex::new(()),
            next_generation: AtomicU64::new(1),
            total_instances: AtomicUsize::new(0),
            recent_registrations,
            evicted: Mutex::new(Vec::new()),
            pending_deletion: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        });

        let weak = Arc::downgrade(&cache);
        let handle = tokio::spawn(Self::sweep_loop(weak, sweep_interval));
        *lock(&cache.sweeper) = Some(handle);
        cache
    }

    /// The caching policy this cache enforces.
    pub fn policy(&self) -> &CachingPolicy {
        &self.policy
    }

    // ========================================================================
    // Checkout / checkin
    // ========================================================================

    /// Check out an instance for the endpoint.
    ///
    /// Returns an idle instance when one exists; otherwise creates a new
    /// one through the factory, subject to the caps and the policy's
    /// exhaustion action. Under `Wait` this blocks until a checkin makes
    /// an instance available — without any cache-imposed timeout; dropping
    /// the future cancels the wait.
    pub async fn check_out(&self, endpoint: &Arc<Endpoint>) -> Result<ServiceHandle<S>> {
        let mut wait_started: Option<Instant> = None;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(PoolError::Closed);
            }
            let entry = self.entry_for(endpoint);

            if let Some(idle) = entry.pop_idle() {
                entry.num_active.fetch_add(1, Ordering::AcqRel);
                self.record_wait(wait_started);
                return Ok(ServiceHandle::new(
                    idle.instance,
                    entry.endpoint.clone(),
                    entry.generation,
                ));
            }

            if self.try_reserve(&entry) {
                self.record_wait(wait_started);
                return self.create_instance(&entry).await;
            }

            match self.policy.exhaustion_action() {
                ExhaustionAction::Fail => {
                    return Err(PoolError::CacheExhausted {
                        endpoint_id: endpoint.id().to_owned(),
                    });
                }
                ExhaustionAction::Grow => {
                    entry.num_total.fetch_add(1, Ordering::AcqRel);
                    self.total_instances.fetch_add(1, Ordering::AcqRel);
                    self.record_wait(wait_started);
                    return self.create_instance(&entry).await;
                }
                ExhaustionAction::Wait => {
                    let notified = entry.returned.notified();
                    // An instance may have been returned between the
                    // failed reservation and registering interest.
                    if let Some(idle) = entry.pop_idle() {
                        entry.num_active.fetch_add(1, Ordering::AcqRel);
                        self.record_wait(wait_started);
                        return Ok(ServiceHandle::new(
                            idle.instance,
                            entry.endpoint.clone(),
                            entry.generation,
                        ));
                    }
                    wait_started.get_or_insert_with(Instant::now);
                    notified.await;
                }
            }
        }
    }

    /// Return a checked-out instance to the cache.
    ///
    /// Safe to call even if the endpoint was evicted (or refreshed) while
    /// the instance was out: the instance is then routed to deferred
    /// destruction instead of being reused.
    pub async fn check_in(&self, handle: ServiceHandle<S>) {
        let (instance, endpoint, generation) = handle.into_parts();

        if self.closed.load(Ordering::Acquire) {
            // Sweeper is gone; destroy inline.
            self.destroy_now(&endpoint, instance).await;
            return;
        }

        let key = endpoint.key();
        let map = self.live.load();
        match map.get(&key) {
            Some(entry) if entry.generation == generation => {
                entry.num_active.fetch_sub(1, Ordering::AcqRel);
                if self.over_caps(entry) {
                    // Surplus created under GROW; retire it now that the
                    // call is done.
                    entry.num_total.fetch_sub(1, Ordering::AcqRel);
                    self.total_instances.fetch_sub(1, Ordering::AcqRel);
                    self.stage_pending(endpoint, instance);
                } else {
                    lock(&entry.idle).push(IdleInstance {
                        instance,
                        idle_since: Instant::now(),
                    });
                    entry.returned.notify_one();
                    if self.closed.load(Ordering::Acquire) {
                        // close() ran between our closed check and the
                        // push; reclaim so the instance is not orphaned.
                        if let Some(idle) = entry.pop_idle() {
                            let ep = entry.endpoint.clone();
                            self.destroy_now(&ep, idle.instance).await;
                        }
                    }
                }
            }
            _ => {
                // Evicted or refreshed while checked out. The instance is
                // no longer attributed to any live entry.
                self.release_total();
                self.stage_pending(endpoint, instance);
            }
        }
    }

    // ========================================================================
    // Membership lifecycle
    // ========================================================================

    /// Register an endpoint, creating or refreshing its slot entry.
    ///
    /// A repeated registration within the duplicate-registration window is
    /// a no-op, so watcher re-delivery storms do not thrash the factory.
    /// Outside the window, an existing entry is refreshed: its idle
    /// instances move to deferred destruction and future checkouts create
    /// fresh ones.
    pub fn register(&self, endpoint: &Arc<Endpoint>) {
        let _admin = lock(&self.admin);
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let key = endpoint.key();
        if self.recent_registrations.contains_key(&key) {
            debug!(endpoint = %endpoint, "suppressing duplicate registration");
            return;
        }
        self.recent_registrations.insert(key.clone(), ());

        // A re-registration cancels any eviction staging for the endpoint:
        // those instances will never be reused, move them on to deletion.
        {
            let mut evicted = lock(&self.evicted);
            let mut pending = lock(&self.pending_deletion);
            let now = Instant::now();
            let mut kept = Vec::with_capacity(evicted.len());
            for staged in evicted.drain(..) {
                if staged.endpoint.key() == key {
                    pending.push(Staged {
                        staged_at: now,
                        ..staged
                    });
                } else {
                    kept.push(staged);
                }
            }
            *evicted = kept;
        }

        let map = self.live.load_full();
        let mut new_map = (*map).clone();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        if let Some(existing) = new_map.get(&key) {
            self.retire_idle(existing);
            existing.returned.notify_waiters();
            debug!(endpoint = %endpoint, generation, "refreshing registered endpoint");
        } else {
            debug!(endpoint = %endpoint, generation, "registering endpoint");
        }
        new_map.insert(
            key,
            Arc::new(EndpointSlots::new(endpoint.clone(), generation)),
        );
        self.live.store(Arc::new(new_map));
    }

    /// Evict an endpoint: all of its instances leave the live map
    /// immediately and future checkouts create fresh ones.
    ///
    /// Idle instances enter the evicted stage; checked-out instances are
    /// staged when their holders check them in.
    pub fn evict(&self, endpoint: &Endpoint) {
        let _admin = lock(&self.admin);
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let key = endpoint.key();
        let map = self.live.load_full();
        if !map.contains_key(&key) {
            return;
        }
        let mut new_map = (*map).clone();
        let entry = new_map.remove(&key).expect("checked contains_key above");
        self.live.store(Arc::new(new_map));

        let drained: Vec<IdleInstance<S>> = {
            let mut idle = lock(&entry.idle);
            idle.drain(..).collect()
        };
        if !drained.is_empty() {
            entry.num_total.fetch_sub(drained.len(), Ordering::AcqRel);
            self.total_instances.fetch_sub(drained.len(), Ordering::AcqRel);
            let now = Instant::now();
            let mut evicted = lock(&self.evicted);
            for idle in drained {
                evicted.push(Staged {
                    endpoint: entry.endpoint.clone(),
                    instance: idle.instance,
                    staged_at: now,
                });
            }
        }
        debug!(endpoint = %endpoint, "evicted endpoint");
        // Wake WAIT-policy blockers so they re-evaluate against the new
        // state (a fresh entry with fresh capacity).
        entry.returned.notify_waiters();
    }

    /// Close the cache: stop the sweeper and destroy every instance.
    ///
    /// Grace windows do not apply at shutdown. Idempotent.
    pub async fn close(&self) {
        let to_destroy: Vec<Staged<S>> = {
            let _admin = lock(&self.admin);
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            if let Some(handle) = lock(&self.sweeper).take() {
                handle.abort();
            }
            let map = self.live.swap(Arc::new(HashMap::new()));
            let now = Instant::now();
            let mut all = Vec::new();
            for entry in map.values() {
                for idle in lock(&entry.idle).drain(..) {
                    all.push(Staged {
                        endpoint: entry.endpoint.clone(),
                        instance: idle.instance,
                        staged_at: now,
                    });
                }
                entry.returned.notify_waiters();
            }
            all.extend(lock(&self.evicted).drain(..));
            all.extend(lock(&self.pending_deletion).drain(..));
            self.total_instances.store(0, Ordering::Release);
            all
        };
        for staged in to_destroy {
            self.destroy_now(&staged.endpoint, staged.instance).await;
        }
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Number of idle instances cached for the endpoint.
    pub fn num_idle_instances(&self, endpoint: &Endpoint) -> usize {
        self.live
            .load()
            .get(&endpoint.key())
            .map_or(0, |entry| lock(&entry.idle).len())
    }

    /// Number of instances currently checked out for the endpoint.
    pub fn num_active_instances(&self, endpoint: &Endpoint) -> usize {
        self.live
            .load()
            .get(&endpoint.key())
            .map_or(0, |entry| entry.num_active.load(Ordering::Acquire))
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// The live entry for the endpoint, created on demand.
    fn entry_for(&self, endpoint: &Arc<Endpoint>) -> Arc<EndpointSlots<S>> {
        let key = endpoint.key();
        if let Some(entry) = self.live.load().get(&key) {
            return entry.clone();
        }
        let _admin = lock(&self.admin);
        let map = self.live.load_full();
        if let Some(entry) = map.get(&key) {
            return entry.clone();
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(EndpointSlots::new(endpoint.clone(), generation));
        let mut new_map = (*map).clone();
        new_map.insert(key, entry.clone());
        self.live.store(Arc::new(new_map));
        entry
    }

    /// Reserve capacity for one new instance, respecting both caps.
    fn try_reserve(&self, entry: &EndpointSlots<S>) -> bool {
        let per_cap = self.policy.max_instances_per_endpoint();
        loop {
            let current = entry.num_total.load(Ordering::Acquire);
            if let Some(cap) = per_cap
                && current >= cap
            {
                return false;
            }
            if entry
                .num_total
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        let global_cap = self.policy.max_total_instances();
        loop {
            let current = self.total_instances.load(Ordering::Acquire);
            if let Some(cap) = global_cap
                && current >= cap
            {
                entry.num_total.fetch_sub(1, Ordering::AcqRel);
                return false;
            }
            if self
                .total_instances
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Create an instance against already-reserved capacity.
    async fn create_instance(&self, entry: &Arc<EndpointSlots<S>>) -> Result<ServiceHandle<S>> {
        match self.factory.create(&entry.endpoint).await {
            Ok(instance) => {
                entry.num_active.fetch_add(1, Ordering::AcqRel);
                self.recent_registrations.insert(entry.endpoint.key(), ());
                metrics::counter!(telemetry::INSTANCES_CREATED_TOTAL,
                    "service" => self.service_name.clone(),
                )
                .increment(1);
                Ok(ServiceHandle::new(
                    Arc::new(instance),
                    entry.endpoint.clone(),
                    entry.generation,
                ))
            }
            Err(err) => {
                entry.num_total.fetch_sub(1, Ordering::AcqRel);
                self.total_instances.fetch_sub(1, Ordering::AcqRel);
                // Creation failures propagate unwrapped; retry is the
                // dispatcher's responsibility.
                Err(err)
            }
        }
    }

    /// Whether the entry (or the cache globally) holds more instances than
    /// configured.
    fn over_caps(&self, entry: &EndpointSlots<S>) -> bool {
        let over_per = self
            .policy
            .max_instances_per_endpoint()
            .is_some_and(|cap| entry.num_total.load(Ordering::Acquire) > cap);
        let over_global = self
            .policy
            .max_total_instances()
            .is_some_and(|cap| self.total_instances.load(Ordering::Acquire) > cap);
        over_per || over_global
    }

    /// Move an entry's idle instances to the pending-deletion stage.
    fn retire_idle(&self, entry: &EndpointSlots<S>) {
        let drained: Vec<IdleInstance<S>> = lock(&entry.idle).drain(..).collect();
        if drained.is_empty() {
            return;
        }
        entry.num_total.fetch_sub(drained.len(), Ordering::AcqRel);
        self.total_instances.fetch_sub(drained.len(), Ordering::AcqRel);
        let now = Instant::now();
        let mut pending = lock(&self.pending_deletion);
        for idle in drained {
            pending.push(Staged {
                endpoint: entry.endpoint.clone(),
                instance: idle.instance,
                staged_at: now,
            });
        }
    }

    /// Decrement the global instance count without underflowing.
    ///
    /// Checkins can race with `close()`, which resets the counter to zero
    /// while instances are still out.
    fn release_total(&self) {
        let mut current = self.total_instances.load(Ordering::Acquire);
        while current > 0 {
            match self.total_instances.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn stage_pending(&self, endpoint: Arc<Endpoint>, instance: Arc<S>) {
        lock(&self.pending_deletion).push(Staged {
            endpoint,
            instance,
            staged_at: Instant::now(),
        });
    }

    /// Destroy an instance now, logging and swallowing any error.
    async fn destroy_now(&self, endpoint: &Arc<Endpoint>, instance: Arc<S>) {
        if let Err(err) = self.factory.destroy(endpoint, instance).await {
            warn!(endpoint = %endpoint, error = %err, "instance destroy failed");
        }
        metrics::counter!(telemetry::INSTANCES_DESTROYED_TOTAL,
            "service" => self.service_name.clone(),
        )
        .increment(1);
    }

    fn record_wait(&self, wait_started: Option<Instant>) {
        if let Some(started) = wait_started {
            metrics::histogram!(telemetry::CHECKOUT_WAIT_SECONDS,
                "service" => self.service_name.clone(),
            )
            .record(started.elapsed().as_secs_f64());
        }
    }

    // ========================================================================
    // Background sweeping
    // ========================================================================

    async fn sweep_loop(cache: Weak<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(cache) = cache.upgrade() else {
                break;
            };
            cache.sweep().await;
        }
    }

    /// One sweep pass over the idle lists and the two staged structures.
    async fn sweep(&self) {
        self.expire_idle_instances();
        self.advance_evicted_stage();

        let due: Vec<Staged<S>> = {
            let mut pending = lock(&self.pending_deletion);
            let mut kept = Vec::with_capacity(pending.len());
            let mut due = Vec::new();
            for staged in pending.drain(..) {
                if staged.staged_at.elapsed() >= PENDING_DELETION_GRACE {
                    due.push(staged);
                } else {
                    kept.push(staged);
                }
            }
            *pending = kept;
            due
        };
        for staged in due {
            self.destroy_now(&staged.endpoint, staged.instance).await;
        }
    }

    /// Move idle instances past their idle TTL into the evicted stage.
    fn expire_idle_instances(&self) {
        let Some(max_idle) = self.policy.max_idle_time() else {
            return;
        };
        let map = self.live.load_full();
        for entry in map.values() {
            let expired: Vec<IdleInstance<S>> = {
                let mut idle = lock(&entry.idle);
                let mut kept = Vec::with_capacity(idle.len());
                let mut expired = Vec::new();
                for instance in idle.drain(..) {
                    if instance.idle_since.elapsed() >= max_idle {
                        expired.push(instance);
                    } else {
                        kept.push(instance);
                    }
                }
                *idle = kept;
                expired
            };
            if expired.is_empty() {
                continue;
            }
            entry.num_total.fetch_sub(expired.len(), Ordering::AcqRel);
            self.total_instances.fetch_sub(expired.len(), Ordering::AcqRel);
            let now = Instant::now();
            let mut evicted = lock(&self.evicted);
            for instance in expired {
                evicted.push(Staged {
                    endpoint: entry.endpoint.clone(),
                    instance: instance.instance,
                    staged_at: now,
                });
            }
        }
    }

    /// Move evicted-stage entries past their TTL into pending deletion.
    fn advance_evicted_stage(&self) {
        let ttl = self
            .policy
            .max_idle_time()
            .unwrap_or(self.sweep_interval);
        let mut evicted = lock(&self.evicted);
        let mut pending = lock(&self.pending_deletion);
        let now = Instant::now();
        let mut kept = Vec::with_capacity(evicted.len());
        for staged in evicted.drain(..) {
            if staged.staged_at.elapsed() >= ttl {
                pending.push(Staged {
                    staged_at: now,
                    ..staged
                });
            } else {
                kept.push(staged);
            }
        }
        *evicted = kept;
    }
}

impl<S: Send + Sync + 'static> PoolStatistics for InstanceCache<S> {
    fn num_idle_instances(&self, endpoint: &Endpoint) -> usize {
        InstanceCache::num_idle_instances(self, endpoint)
    }

    fn num_active_instances(&self, endpoint: &Endpoint) -> usize {
        InstanceCache::num_active_instances(self, endpoint)
    }
}
