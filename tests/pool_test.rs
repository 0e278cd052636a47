use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_test::assert_ok;
use bifrost::{
    CachingPolicy, Endpoint, FixedHostDiscovery, InstanceFactory, LoadBalanceAlgorithm, PoolError,
    PoolStatistics, Result, RetryNTimes, ServicePoolBuilder,
};

/// Client instance handed to callbacks; remembers which endpoint it talks
/// to and its creation serial.
struct TestClient {
    endpoint_id: String,
    serial: u32,
}

/// Factory producing [`TestClient`]s, with scriptable health answers.
struct TestFactory {
    created: AtomicU32,
    destroyed: AtomicU32,
    unhealthy: Mutex<HashMap<String, bool>>,
}

impl TestFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            created: AtomicU32::new(0),
            destroyed: AtomicU32::new(0),
            unhealthy: Mutex::new(HashMap::new()),
        })
    }

    fn set_unhealthy(&self, endpoint_id: &str, unhealthy: bool) {
        self.unhealthy
            .lock()
            .unwrap()
            .insert(endpoint_id.to_string(), unhealthy);
    }
}

#[async_trait]
impl InstanceFactory<TestClient> for TestFactory {
    fn service_name(&self) -> &str {
        "test-service"
    }

    async fn create(&self, endpoint: &Endpoint) -> Result<TestClient> {
        Ok(TestClient {
            endpoint_id: endpoint.id().to_string(),
            serial: self.created.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn destroy(&self, _endpoint: &Endpoint, _instance: Arc<TestClient>) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_healthy(&self, endpoint: &Endpoint) -> bool {
        !self
            .unhealthy
            .lock()
            .unwrap()
            .get(endpoint.id())
            .copied()
            .unwrap_or(false)
    }
}

/// Deterministic load balancing: picks candidates in a fixed id order.
struct PreferOrder {
    order: Vec<&'static str>,
}

impl LoadBalanceAlgorithm for PreferOrder {
    fn choose(
        &self,
        candidates: &[Arc<Endpoint>],
        _statistics: &dyn PoolStatistics,
    ) -> Option<Arc<Endpoint>> {
        self.order
            .iter()
            .find_map(|id| candidates.iter().find(|ep| ep.id() == *id).cloned())
            .or_else(|| candidates.first().cloned())
    }
}

fn endpoint(id: &str) -> Endpoint {
    Endpoint::builder()
        .service_name("test-service")
        .id(id)
        .build()
        .unwrap()
}

/// Lets spawned membership/background tasks run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn fails_over_to_healthy_endpoint_after_exactly_two_attempts() {
    let discovery = Arc::new(FixedHostDiscovery::new([endpoint("a"), endpoint("b")]));
    let pool = ServicePoolBuilder::new()
        .host_discovery(discovery)
        .instance_factory(TestFactory::new())
        .load_balance(Arc::new(PreferOrder {
            order: vec!["a", "b"],
        }))
        .build()
        .unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let result = pool
        .execute(&RetryNTimes::new(3), move |client: Arc<TestClient>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if client.endpoint_id == "a" {
                    Err(PoolError::service("endpoint a is down"))
                } else {
                    Ok(client.endpoint_id.clone())
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(result, "b");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    pool.close().await;
}

#[tokio::test]
async fn application_failure_propagates_without_retry_or_bad_marking() {
    let discovery = Arc::new(FixedHostDiscovery::new([endpoint("a"), endpoint("b")]));
    let pool = ServicePoolBuilder::new()
        .host_discovery(discovery)
        .instance_factory(TestFactory::new())
        .build()
        .unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let err = pool
        .execute(&RetryNTimes::new(5), move |_client: Arc<TestClient>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(PoolError::application("invalid request"))
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, PoolError::Application(_)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(pool.num_bad_end_points(), 0);
    pool.close().await;
}

#[tokio::test]
async fn empty_pool_fails_immediately_with_no_available_hosts() {
    let pool = ServicePoolBuilder::new()
        .host_discovery(Arc::new(FixedHostDiscovery::empty()))
        .instance_factory(TestFactory::new())
        .build()
        .unwrap();

    let err = pool
        .execute(&RetryNTimes::new(5), |_client: Arc<TestClient>| async move {
            Ok::<(), _>(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, PoolError::NoAvailableHosts { .. }));
    pool.close().await;
}

#[tokio::test]
async fn retries_exhausted_wraps_the_last_failure() {
    let discovery = Arc::new(FixedHostDiscovery::new([endpoint("a"), endpoint("b")]));
    let pool = ServicePoolBuilder::new()
        .host_discovery(discovery)
        .instance_factory(TestFactory::new())
        .build()
        .unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let err = pool
        .execute(&RetryNTimes::new(2), move |_client: Arc<TestClient>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(PoolError::service("everything is down"))
            }
        })
        .await
        .unwrap_err();

    match err {
        PoolError::RetriesExhausted { attempts: n, last } => {
            assert_eq!(n, 2);
            assert!(matches!(*last, PoolError::ServiceFailure(_)));
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    pool.close().await;
}

#[tokio::test]
async fn service_failures_mark_endpoints_bad() {
    let discovery = Arc::new(FixedHostDiscovery::new([endpoint("a"), endpoint("b")]));
    let pool = ServicePoolBuilder::new()
        .host_discovery(discovery)
        .instance_factory(TestFactory::new())
        .load_balance(Arc::new(PreferOrder {
            order: vec!["a", "b"],
        }))
        .build()
        .unwrap();

    assert_eq!(pool.num_valid_end_points(), 2);
    assert_eq!(pool.num_bad_end_points(), 0);

    pool.execute(&RetryNTimes::new(3), |client: Arc<TestClient>| async move {
        if client.endpoint_id == "a" {
            Err(PoolError::service("a is down"))
        } else {
            Ok(())
        }
    })
    .await
    .unwrap();

    assert_eq!(pool.num_valid_end_points(), 1);
    assert_eq!(pool.num_bad_end_points(), 1);
    pool.close().await;
}

#[tokio::test]
async fn healthy_probe_clears_bad_marks() {
    let factory = TestFactory::new();
    let discovery = Arc::new(FixedHostDiscovery::new([endpoint("a")]));
    let pool = ServicePoolBuilder::new()
        .host_discovery(discovery)
        .instance_factory(factory.clone())
        .build()
        .unwrap();

    factory.set_unhealthy("a", true);
    let results = pool.check_for_healthy_end_point().await;
    assert!(!results.has_healthy_result());
    assert_eq!(results.unhealthy_results().count(), 1);
    assert_eq!(pool.num_bad_end_points(), 1);

    factory.set_unhealthy("a", false);
    let results = pool.check_for_healthy_end_point().await;
    assert!(results.has_healthy_result());
    assert_eq!(results.healthy_result().unwrap().endpoint_id(), "a");
    assert_eq!(pool.num_bad_end_points(), 0);
    pool.close().await;
}

#[tokio::test]
async fn removed_endpoint_is_no_longer_selected() {
    let discovery = Arc::new(FixedHostDiscovery::new([endpoint("a"), endpoint("b")]));
    let pool = ServicePoolBuilder::new()
        .host_discovery(discovery.clone())
        .instance_factory(TestFactory::new())
        .build()
        .unwrap();

    discovery.remove(&endpoint("b"));
    settle().await;
    assert_eq!(pool.num_valid_end_points(), 1);

    for _ in 0..10 {
        let id = pool
            .execute(&RetryNTimes::new(1), |client: Arc<TestClient>| async move {
                Ok(client.endpoint_id.clone())
            })
            .await
            .unwrap();
        assert_eq!(id, "a");
    }
    pool.close().await;
}

#[tokio::test]
async fn eviction_mid_call_completes_then_creates_fresh_instance() {
    let factory = TestFactory::new();
    let discovery = Arc::new(FixedHostDiscovery::new([endpoint("a")]));
    let pool = ServicePoolBuilder::new()
        .host_discovery(discovery.clone())
        .instance_factory(factory.clone())
        .build()
        .unwrap();

    // The endpoint is removed from membership while the callback still
    // holds its instance; the in-flight call must complete.
    let evicting_discovery = discovery.clone();
    let serial = pool
        .execute(&RetryNTimes::new(1), move |client: Arc<TestClient>| {
            let discovery = evicting_discovery.clone();
            async move {
                discovery.remove(&endpoint("a"));
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(client.serial)
            }
        })
        .await
        .unwrap();

    discovery.add(endpoint("a"));
    settle().await;

    let fresh = pool
        .execute(&RetryNTimes::new(1), |client: Arc<TestClient>| async move {
            Ok(client.serial)
        })
        .await
        .unwrap();
    assert_ne!(serial, fresh);
    pool.close().await;
}

#[tokio::test]
async fn execute_on_all_runs_one_loop_per_endpoint() {
    let discovery = Arc::new(FixedHostDiscovery::new([
        endpoint("a"),
        endpoint("b"),
        endpoint("c"),
    ]));
    let pool = ServicePoolBuilder::new()
        .host_discovery(discovery)
        .instance_factory(TestFactory::new())
        .build()
        .unwrap();

    let results = pool
        .execute_on_all(&RetryNTimes::new(2), |client: Arc<TestClient>| async move {
            if client.endpoint_id == "c" {
                Err(PoolError::service("c is down"))
            } else {
                Ok(client.endpoint_id.clone())
            }
        })
        .await;

    assert_eq!(results.len(), 3);
    for entry in &results {
        match entry.endpoint.id() {
            "c" => {
                let err = entry.result.as_ref().unwrap_err();
                assert!(matches!(err, PoolError::RetriesExhausted { attempts: 2, .. }));
            }
            id => assert_eq!(entry.result.as_ref().unwrap(), id),
        }
    }
    pool.close().await;
}

#[tokio::test]
async fn execute_on_some_honours_the_predicate() {
    let discovery = Arc::new(FixedHostDiscovery::new([endpoint("a"), endpoint("b")]));
    let pool = ServicePoolBuilder::new()
        .host_discovery(discovery)
        .instance_factory(TestFactory::new())
        .build()
        .unwrap();

    let results = pool
        .execute_on_some(
            &RetryNTimes::new(1),
            |ep| ep.id() == "b",
            |client: Arc<TestClient>| async move { Ok(client.endpoint_id.clone()) },
        )
        .await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].endpoint.id(), "b");
    assert_eq!(results[0].result.as_ref().unwrap(), "b");
    pool.close().await;
}

#[tokio::test]
async fn async_pool_runs_detached() {
    let discovery = Arc::new(FixedHostDiscovery::new([endpoint("a")]));
    let pool = ServicePoolBuilder::new()
        .host_discovery(discovery)
        .instance_factory(TestFactory::new())
        .build_async(tokio::runtime::Handle::current())
        .unwrap();

    let handle = pool.execute(
        Arc::new(RetryNTimes::new(2)),
        |client: Arc<TestClient>| async move { Ok(client.endpoint_id.clone()) },
    );
    let result = handle.await.unwrap().unwrap();
    assert_eq!(result, "a");
    pool.close().await;
}

#[tokio::test]
async fn closed_pool_rejects_calls_and_close_is_idempotent() {
    let factory = TestFactory::new();
    let discovery = Arc::new(FixedHostDiscovery::new([endpoint("a")]));
    let pool = ServicePoolBuilder::new()
        .host_discovery(discovery)
        .instance_factory(factory.clone())
        .caching_policy(CachingPolicy::default())
        .build()
        .unwrap();

    pool.execute(&RetryNTimes::new(1), |_client: Arc<TestClient>| async move {
        Ok::<(), _>(())
    })
    .await
    .unwrap();

    pool.close().await;
    pool.close().await;
    assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);

    let err = pool
        .execute(&RetryNTimes::new(1), |_client: Arc<TestClient>| async move {
            Ok::<(), _>(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Closed));
}

#[tokio::test]
async fn partitioned_execution_routes_a_fixed_key_to_one_endpoint() {
    use bifrost::{ConsistentHashPartitionFilter, PartitionContext};

    let discovery = Arc::new(FixedHostDiscovery::new([
        endpoint("a"),
        endpoint("b"),
        endpoint("c"),
    ]));
    let pool = ServicePoolBuilder::new()
        .host_discovery(discovery)
        .instance_factory(TestFactory::new())
        .partition_filter(Arc::new(ConsistentHashPartitionFilter::new()))
        .build()
        .unwrap();

    let context = PartitionContext::of("tenant-42");
    let mut seen = std::collections::HashSet::new();
    for _ in 0..20 {
        let id = pool
            .execute_partitioned(
                &RetryNTimes::new(1),
                &context,
                |client: Arc<TestClient>| async move { Ok(client.endpoint_id.clone()) },
            )
            .await
            .unwrap();
        seen.insert(id);
    }
    // Consistent hashing pins the key to exactly one endpoint.
    assert_eq!(seen.len(), 1);
    pool.close().await;
}

/// The adapter pattern replacing dynamic proxies: a plain struct whose
/// methods delegate to `execute`.
struct PooledEcho {
    pool: Arc<bifrost::ServicePool<TestClient>>,
    retry: RetryNTimes,
}

impl PooledEcho {
    async fn echo(&self, message: &str) -> Result<String> {
        let message = message.to_string();
        self.pool
            .execute(&self.retry, move |client: Arc<TestClient>| {
                let message = message.clone();
                async move { Ok(format!("{message} via {}", client.endpoint_id)) }
            })
            .await
    }
}

#[tokio::test]
async fn adapter_presents_the_pool_as_a_service_interface() {
    let discovery = Arc::new(FixedHostDiscovery::new([endpoint("a")]));
    let pool = ServicePoolBuilder::new()
        .host_discovery(discovery)
        .instance_factory(TestFactory::new())
        .build()
        .unwrap();

    let service = PooledEcho {
        pool: pool.clone(),
        retry: RetryNTimes::new(3),
    };
    let reply = tokio_test::assert_ok!(service.echo("hello").await);
    assert_eq!(reply, "hello via a");
    pool.close().await;
}
