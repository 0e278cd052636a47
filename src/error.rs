//! Bifrost error types

/// Boxed error type carried inside service/application failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Bifrost error types
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No candidate endpoint survived filtering and selection.
    ///
    /// Terminal: there is nothing to retry against, so the dispatcher
    /// raises this immediately instead of entering the retry loop.
    #[error("no available hosts for service '{service}'")]
    NoAvailableHosts {
        /// Name of the service that had no candidates.
        service: String,
    },

    /// A FAIL-policy checkout found the cache at capacity.
    ///
    /// Terminal on the `InstanceCache` API; the dispatcher treats it as a
    /// retryable attempt failure instead.
    #[error("instance cache exhausted for end point '{endpoint_id}'")]
    CacheExhausted {
        /// Id of the endpoint whose slots were all in use.
        endpoint_id: String,
    },

    /// The remote endpoint misbehaved during the callback.
    ///
    /// Retryable: drives bad-endpoint marking and the retry loop.
    #[error("service failure: {0}")]
    ServiceFailure(#[source] BoxError),

    /// A business-level callback failure.
    ///
    /// Never retried; propagates immediately without marking the endpoint
    /// bad.
    #[error("application failure: {0}")]
    Application(#[source] BoxError),

    /// Instance creation failed in the external factory.
    ///
    /// Creation failures are retryable attempt failures. Destruction
    /// failures never surface through this variant; they are logged and
    /// swallowed because destruction runs long after the originating call
    /// returned.
    #[error("instance factory failure: {0}")]
    Factory(#[source] BoxError),

    /// The retry policy declined a further attempt.
    ///
    /// Wraps the last retryable failure seen; intermediate failures are
    /// not accumulated.
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// Number of attempts made before giving up.
        attempts: u32,
        /// The failure that terminated the final attempt.
        #[source]
        last: Box<PoolError>,
    },

    /// Operation on a pool or cache that was already closed.
    #[error("pool is closed")]
    Closed,

    /// Invalid construction input (endpoint charset, cap mismatch, etc.)
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl PoolError {
    /// Whether the dispatcher may retry the attempt after this error.
    ///
    /// `ServiceFailure`, `CacheExhausted` and `Factory` creation errors
    /// are absorbed into the retry loop; everything else crosses the
    /// dispatcher boundary on first occurrence.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::ServiceFailure(_) | PoolError::CacheExhausted { .. } | PoolError::Factory(_)
        )
    }

    /// Convenience constructor for a retryable service-level failure.
    pub fn service<E: Into<BoxError>>(err: E) -> Self {
        PoolError::ServiceFailure(err.into())
    }

    /// Convenience constructor for a terminal application-level failure.
    pub fn application<E: Into<BoxError>>(err: E) -> Self {
        PoolError::Application(err.into())
    }
}

/// Result type alias for bifrost operations
pub type Result<T> = std::result::Result<T, PoolError>;
