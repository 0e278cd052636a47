//! Checkout tokens.

use std::sync::Arc;

use crate::endpoint::Endpoint;

/// A checked-out service instance bound to the endpoint that produced it.
///
/// Returned by [`InstanceCache::check_out`](super::InstanceCache::check_out)
/// and surrendered back through
/// [`InstanceCache::check_in`](super::InstanceCache::check_in). The
/// generation tag lets the cache detect that the endpoint was evicted or
/// refreshed while the instance was out, and route the instance to
/// deferred destruction instead of reusing it.
#[derive(Debug)]
pub struct ServiceHandle<S> {
    instance: Arc<S>,
    endpoint: Arc<Endpoint>,
    generation: u64,
}

impl<S> ServiceHandle<S> {
    pub(crate) fn new(instance: Arc<S>, endpoint: Arc<Endpoint>, generation: u64) -> Self {
        Self {
            instance,
            endpoint,
            generation,
        }
    }

    /// The service instance.
    pub fn instance(&self) -> Arc<S> {
        self.instance.clone()
    }

    /// The endpoint this instance talks to.
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn into_parts(self) -> (Arc<S>, Arc<Endpoint>, u64) {
        (self.instance, self.endpoint, self.generation)
    }
}
