use std::sync::Arc;

use bifrost::{
    ConsistentHashPartitionFilter, Endpoint, IdentityPartitionFilter, PartitionContext,
    PartitionFilter,
};

fn endpoint(id: &str) -> Arc<Endpoint> {
    Arc::new(
        Endpoint::builder()
            .service_name("sharded")
            .id(id)
            .build()
            .unwrap(),
    )
}

fn endpoint_with_payload(id: &str, payload: &str) -> Arc<Endpoint> {
    Arc::new(
        Endpoint::builder()
            .service_name("sharded")
            .id(id)
            .payload(payload)
            .build()
            .unwrap(),
    )
}

/// Finds a partition key that the filter routes to the given endpoint id,
/// so the duplicate-id tests do not depend on hard-coded hash values.
fn key_routing_to(
    filter: &ConsistentHashPartitionFilter,
    candidates: &[Arc<Endpoint>],
    id: &str,
) -> String {
    for n in 0..1_000 {
        let key = format!("key-{n}");
        let result = filter.filter(candidates, &PartitionContext::of(key.as_str()));
        if result.len() == 1 && result[0].id() == id {
            return key;
        }
    }
    panic!("no key found routing to {id}");
}

#[test]
fn identity_filter_never_narrows() {
    let candidates = vec![endpoint("foo"), endpoint("bar")];
    let filter = IdentityPartitionFilter;
    assert_eq!(
        filter.filter(&candidates, &PartitionContext::of("anything")),
        candidates
    );
}

#[test]
fn repeated_calls_with_fixed_key_are_identical() {
    let filter = ConsistentHashPartitionFilter::new();
    let candidates = vec![endpoint("foo"), endpoint("bar")];
    let context = PartitionContext::of("fixed-key");

    let first = filter.filter(&candidates, &context);
    assert_eq!(first.len(), 1);
    for _ in 0..100 {
        assert_eq!(filter.filter(&candidates, &context), first);
    }
}

#[test]
fn last_occurrence_wins_on_duplicate_ids() {
    let filter = ConsistentHashPartitionFilter::new();
    let foo = endpoint("foo");
    let foo2 = endpoint_with_payload("foo", "2");
    let bar = endpoint("bar");

    let base = vec![foo.clone(), bar.clone()];
    let key = key_routing_to(&filter, &base, "foo");
    let context = PartitionContext::of(key.as_str());

    // foo listed last: the original foo keeps the ring slot.
    let result = filter.filter(&[foo2.clone(), foo.clone(), bar.clone()], &context);
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].payload(), None);

    // foo2 listed last: the replacement wins the slot.
    let result = filter.filter(&[foo.clone(), foo2.clone(), bar.clone()], &context);
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].payload(), Some("2"));

    // With the original foo gone entirely, foo2 must be discovered even
    // though the set of endpoint ids did not change. A stale ring would
    // get this wrong.
    let result = filter.filter(&[foo2.clone(), bar.clone()], &context);
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].payload(), Some("2"));
}

#[test]
fn key_keeps_routing_to_surviving_endpoint() {
    let filter = ConsistentHashPartitionFilter::new();
    let foo = endpoint("foo");
    let bar = endpoint("bar");

    let base = vec![foo.clone(), bar.clone()];
    let key = key_routing_to(&filter, &base, "foo");
    let context = PartitionContext::of(key.as_str());

    // Removing an endpoint the key does not map to must not reshuffle it.
    let result = filter.filter(&[foo.clone()], &context);
    assert_eq!(result[0].id(), "foo");
}

#[test]
fn named_key_filter_ignores_unrelated_context() {
    let filter = ConsistentHashPartitionFilter::with_keys(["cluster", "ensemble", "group"]);
    let candidates = vec![endpoint("foo"), endpoint("bar")];

    let irrelevant = PartitionContext::of_named("partition", "aaa");
    assert_eq!(filter.filter(&candidates, &irrelevant), candidates);

    let relevant = PartitionContext::of_named("ensemble", "aaa");
    assert_eq!(filter.filter(&candidates, &relevant).len(), 1);

    let mixed = PartitionContext::builder()
        .put("partition", "aaa")
        .put("group", "bbb")
        .build();
    assert_eq!(filter.filter(&candidates, &mixed).len(), 1);
}

#[test]
fn empty_candidates_stay_empty() {
    let filter = ConsistentHashPartitionFilter::new();
    let result = filter.filter(&[], &PartitionContext::of("key"));
    assert!(result.is_empty());
}
