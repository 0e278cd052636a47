//! Telemetry metric name constants.
//!
//! Centralised metric names for bifrost operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `bifrost_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `service` — service name the pool was built for
//! - `status` — outcome: "ok" or "error"

/// Total calls dispatched through the pool.
///
/// Labels: `service`, `status` ("ok" | "error").
pub const REQUESTS_TOTAL: &str = "bifrost_requests_total";

/// Call duration in seconds, including all retry attempts.
///
/// Labels: `service`.
pub const REQUEST_DURATION_SECONDS: &str = "bifrost_request_duration_seconds";

/// Total retry attempts (not counting the initial attempt).
///
/// Labels: `service`.
pub const RETRIES_TOTAL: &str = "bifrost_retries_total";

/// Total service instances created by the factory.
///
/// Labels: `service`.
pub const INSTANCES_CREATED_TOTAL: &str = "bifrost_instances_created_total";

/// Total service instances destroyed (including failed destroys).
///
/// Labels: `service`.
pub const INSTANCES_DESTROYED_TOTAL: &str = "bifrost_instances_destroyed_total";

/// Time spent blocked in a WAIT-policy checkout, in seconds.
///
/// Labels: `service`.
pub const CHECKOUT_WAIT_SECONDS: &str = "bifrost_checkout_wait_seconds";

/// Total endpoints marked bad after a service-level failure.
///
/// Labels: `service`.
pub const BAD_ENDPOINTS_TOTAL: &str = "bifrost_bad_endpoints_total";
