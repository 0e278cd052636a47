//! Instance caching policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{PoolError, Result};

/// Default suppression window for duplicate endpoint registrations.
///
/// Directory watchers can re-deliver add notifications in quick bursts;
/// refreshing the endpoint's instances on each one would thrash the
/// factory.
pub const DEFAULT_DUPLICATE_REGISTRATION_WINDOW: Duration = Duration::from_secs(1);

/// What to do when a checkout cannot be satisfied within the configured
/// instance caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExhaustionAction {
    /// Fail the checkout with a cache-exhaustion error.
    Fail,
    /// Create a new instance anyway, temporarily exceeding the caps.
    Grow,
    /// Block until an instance is returned to the cache. The cache itself
    /// imposes no timeout; bounding the wait is the caller's job (the
    /// dispatcher's retry loop tracks elapsed time).
    Wait,
}

/// Configuration snapshot governing how the instance cache behaves.
///
/// Immutable once built. `None` caps mean unbounded growth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachingPolicy {
    max_total_instances: Option<usize>,
    max_instances_per_endpoint: Option<usize>,
    max_idle_time: Option<Duration>,
    exhaustion_action: ExhaustionAction,
    duplicate_registration_window: Duration,
}

impl CachingPolicy {
    /// Start building a policy.
    pub fn builder() -> CachingPolicyBuilder {
        CachingPolicyBuilder::default()
    }

    /// A policy that effectively disables caching: one instance globally,
    /// one per endpoint, failing when exhausted.
    pub fn no_caching() -> Self {
        Self {
            max_total_instances: Some(1),
            max_instances_per_endpoint: Some(1),
            max_idle_time: None,
            exhaustion_action: ExhaustionAction::Fail,
            duplicate_registration_window: DEFAULT_DUPLICATE_REGISTRATION_WINDOW,
        }
    }

    /// Global cap on live instances across all endpoints, `None` if
    /// unbounded.
    pub fn max_total_instances(&self) -> Option<usize> {
        self.max_total_instances
    }

    /// Per-endpoint cap on live instances, `None` if unbounded.
    pub fn max_instances_per_endpoint(&self) -> Option<usize> {
        self.max_instances_per_endpoint
    }

    /// How long an instance may sit idle before becoming eligible (not
    /// guaranteed) for eviction. `None` disables idle-based eviction.
    ///
    /// There is no guaranteed eviction time: an idle instance is evicted
    /// no earlier than this, whenever the background sweep next runs.
    pub fn max_idle_time(&self) -> Option<Duration> {
        self.max_idle_time
    }

    /// What a checkout does when the caps are reached.
    pub fn exhaustion_action(&self) -> ExhaustionAction {
        self.exhaustion_action
    }

    /// Window within which a repeated registration of the same endpoint
    /// is treated as a no-op.
    pub fn duplicate_registration_window(&self) -> Duration {
        self.duplicate_registration_window
    }
}

impl Default for CachingPolicy {
    /// Unbounded growth, no idle eviction, blocking exhaustion.
    fn default() -> Self {
        Self {
            max_total_instances: None,
            max_instances_per_endpoint: None,
            max_idle_time: None,
            exhaustion_action: ExhaustionAction::Wait,
            duplicate_registration_window: DEFAULT_DUPLICATE_REGISTRATION_WINDOW,
        }
    }
}

/// Builder for [`CachingPolicy`].
///
/// ```rust
/// # use bifrost::pool::{CachingPolicy, ExhaustionAction};
/// # use std::time::Duration;
/// let policy = CachingPolicy::builder()
///     .max_total_instances(20)
///     .max_instances_per_endpoint(5)
///     .max_idle_time(Duration::from_secs(60))
///     .exhaustion_action(ExhaustionAction::Wait)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Default)]
pub struct CachingPolicyBuilder {
    max_total_instances: Option<usize>,
    max_instances_per_endpoint: Option<usize>,
    max_idle_time: Option<Duration>,
    exhaustion_action: Option<ExhaustionAction>,
    duplicate_registration_window: Option<Duration>,
}

impl CachingPolicyBuilder {
    /// Set the global instance cap. Unset means unbounded.
    pub fn max_total_instances(mut self, max: usize) -> Self {
        self.max_total_instances = Some(max);
        self
    }

    /// Set the per-endpoint instance cap. Unset means growth bounded only
    /// by the global cap.
    ///
    /// Must be less than or equal to the global cap, unless either is
    /// unbounded.
    pub fn max_instances_per_endpoint(mut self, max: usize) -> Self {
        self.max_instances_per_endpoint = Some(max);
        self
    }

    /// Set the idle time after which an instance may be evicted. Unset
    /// means instances never expire solely due to idle time.
    pub fn max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.max_idle_time = Some(max_idle_time);
        self
    }

    /// Set the exhaustion action. Default: [`ExhaustionAction::Wait`].
    pub fn exhaustion_action(mut self, action: ExhaustionAction) -> Self {
        self.exhaustion_action = Some(action);
        self
    }

    /// Set the duplicate-registration suppression window. Default: 1s.
    pub fn duplicate_registration_window(mut self, window: Duration) -> Self {
        self.duplicate_registration_window = Some(window);
        self
    }

    /// Build the policy, validating cap consistency.
    pub fn build(self) -> Result<CachingPolicy> {
        if let (Some(total), Some(per_endpoint)) =
            (self.max_total_instances, self.max_instances_per_endpoint)
            && per_endpoint > total
        {
            return Err(PoolError::Configuration(format!(
                "per-endpoint cap {per_endpoint} exceeds global cap {total}"
            )));
        }
        Ok(CachingPolicy {
            max_total_instances: self.max_total_instances,
            max_instances_per_endpoint: self.max_instances_per_endpoint,
            max_idle_time: self.max_idle_time,
            exhaustion_action: self.exhaustion_action.unwrap_or(ExhaustionAction::Wait),
            duplicate_registration_window: self
                .duplicate_registration_window
                .unwrap_or(DEFAULT_DUPLICATE_REGISTRATION_WINDOW),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_unbounded_and_blocking() {
        let policy = CachingPolicy::default();
        assert_eq!(policy.max_total_instances(), None);
        assert_eq!(policy.max_instances_per_endpoint(), None);
        assert_eq!(policy.exhaustion_action(), ExhaustionAction::Wait);
    }

    #[test]
    fn per_endpoint_cap_must_fit_global_cap() {
        let err = CachingPolicy::builder()
            .max_total_instances(2)
            .max_instances_per_endpoint(5)
            .build();
        assert!(err.is_err());

        // Unbounded global cap lifts the restriction.
        let ok = CachingPolicy::builder()
            .max_instances_per_endpoint(5)
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn no_caching_preset() {
        let policy = CachingPolicy::no_caching();
        assert_eq!(policy.max_total_instances(), Some(1));
        assert_eq!(policy.max_instances_per_endpoint(), Some(1));
        assert_eq!(policy.exhaustion_action(), ExhaustionAction::Fail);
    }
}
