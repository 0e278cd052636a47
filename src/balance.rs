//! Load balancing across candidate endpoints.

use std::sync::Arc;

use rand::Rng;

use crate::endpoint::Endpoint;

/// Usage statistics about the pool's endpoints, supplied to load balance
/// algorithms that need knowledge of the pool's state.
///
/// The numbers only describe activity between this pool and the endpoint;
/// other pools or applications talking to the same service are invisible
/// here.
pub trait PoolStatistics: Send + Sync {
    /// Number of cached service instances not currently in use for the
    /// given endpoint.
    fn num_idle_instances(&self, endpoint: &Endpoint) -> usize;

    /// Number of service instances currently executing callbacks for the
    /// given endpoint.
    fn num_active_instances(&self, endpoint: &Endpoint) -> usize;
}

/// Strategy for selecting which endpoint a call should go to.
pub trait LoadBalanceAlgorithm: Send + Sync {
    /// Select an endpoint from the candidates, or `None` if no endpoint
    /// can be chosen (e.g. the candidate list is empty).
    fn choose(
        &self,
        candidates: &[Arc<Endpoint>],
        statistics: &dyn PoolStatistics,
    ) -> Option<Arc<Endpoint>>;
}

/// Uniformly random endpoint selection. The default algorithm.
///
/// Ignores pool statistics. A single-element candidate list is returned
/// directly without consulting the RNG.
#[derive(Debug, Default)]
pub struct RandomAlgorithm;

impl RandomAlgorithm {
    /// Create a new random algorithm.
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalanceAlgorithm for RandomAlgorithm {
    fn choose(
        &self,
        candidates: &[Arc<Endpoint>],
        _statistics: &dyn PoolStatistics,
    ) -> Option<Arc<Endpoint>> {
        match candidates {
            [] => None,
            [only] => Some(only.clone()),
            _ => {
                let index = rand::thread_rng().gen_range(0..candidates.len());
                Some(candidates[index].clone())
            }
        }
    }
}
