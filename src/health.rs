//! Health check results.
//!
//! The pool can probe endpoints through the factory's health check and
//! report the outcomes as an aggregate. Selection uses the results to
//! bias away from unhealthy endpoints; callers use them to answer "is
//! anyone out there healthy right now".

use std::time::Duration;

/// The result of a health check on one endpoint.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    healthy: bool,
    endpoint_id: String,
    response_time: Duration,
}

impl HealthCheckResult {
    /// Record a health check outcome.
    pub fn new(healthy: bool, endpoint_id: impl Into<String>, response_time: Duration) -> Self {
        Self {
            healthy,
            endpoint_id: endpoint_id.into(),
            response_time,
        }
    }

    /// Whether the endpoint answered as healthy.
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// The id of the endpoint this result is for.
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// How long the health check took to run, or ran until it failed.
    pub fn response_time(&self) -> Duration {
        self.response_time
    }
}

/// A container for multiple health check results.
///
/// May be empty, in which case there is no healthy result and all
/// accessors return empty iterators or `None`.
#[derive(Debug, Clone, Default)]
pub struct HealthCheckResults {
    results: Vec<HealthCheckResult>,
}

impl HealthCheckResults {
    /// Create an empty aggregate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a result to the aggregate.
    pub fn add(&mut self, result: HealthCheckResult) {
        self.results.push(result);
    }

    /// Whether any result in the aggregate is healthy.
    pub fn has_healthy_result(&self) -> bool {
        self.results.iter().any(HealthCheckResult::is_healthy)
    }

    /// All results, regardless of health.
    pub fn all_results(&self) -> impl Iterator<Item = &HealthCheckResult> {
        self.results.iter()
    }

    /// A healthy result, if there is one. When several results are
    /// healthy there is no guarantee which gets returned.
    pub fn healthy_result(&self) -> Option<&HealthCheckResult> {
        self.results.iter().find(|r| r.is_healthy())
    }

    /// All unhealthy results.
    pub fn unhealthy_results(&self) -> impl Iterator<Item = &HealthCheckResult> {
        self.results.iter().filter(|r| !r.is_healthy())
    }
}
