//! Endpoint membership sources.
//!
//! A [`HostDiscovery`] supplies the live set of endpoints for a service
//! and notifies subscribers when endpoints come and go. The pool polls
//! `hosts()` at the start of every selection attempt and never caches the
//! result across calls, since membership can change between attempts.
//!
//! [`FixedHostDiscovery`] is the simplest implementation: an in-process
//! set mutated through `add`/`remove`. It doubles as the standard test
//! double and as a production source for statically configured clusters.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use crate::endpoint::Endpoint;

/// Capacity of the membership event channel.
///
/// Slow subscribers that fall more than this many events behind observe a
/// `Lagged` error and should resynchronise from `hosts()`.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A membership change observed by a discovery source.
///
/// Events for a single endpoint are delivered in the order the changes
/// occurred.
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    /// The endpoint joined the membership set.
    Added(Arc<Endpoint>),
    /// The endpoint left the membership set.
    Removed(Arc<Endpoint>),
}

/// Strategy that provides the set of reachable endpoints for a service.
///
/// Callers must not cache the result of [`hosts`](Self::hosts):
/// implementations are free to change the available set based on an
/// external mechanism (e.g. a directory watcher).
pub trait HostDiscovery: Send + Sync + 'static {
    /// Retrieve the currently available endpoints.
    fn hosts(&self) -> Vec<Arc<Endpoint>>;

    /// Subscribe to membership change events.
    fn subscribe(&self) -> broadcast::Receiver<EndpointEvent>;
}

/// A discovery source over a fixed, manually mutated endpoint set.
pub struct FixedHostDiscovery {
    endpoints: RwLock<HashSet<Arc<Endpoint>>>,
    events: broadcast::Sender<EndpointEvent>,
}

impl FixedHostDiscovery {
    /// Create a discovery source with an initial endpoint set.
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            endpoints: RwLock::new(endpoints.into_iter().map(Arc::new).collect()),
            events,
        }
    }

    /// Create an empty discovery source.
    pub fn empty() -> Self {
        Self::new([])
    }

    /// Add an endpoint, notifying subscribers if it was not present.
    pub fn add(&self, endpoint: Endpoint) {
        let endpoint = Arc::new(endpoint);
        let added = {
            let mut set = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
            set.insert(endpoint.clone())
        };
        if added {
            let _ = self.events.send(EndpointEvent::Added(endpoint));
        }
    }

    /// Remove an endpoint, notifying subscribers if it was present.
    pub fn remove(&self, endpoint: &Endpoint) {
        let removed = {
            let mut set = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
            set.take(endpoint)
        };
        if let Some(endpoint) = removed {
            let _ = self.events.send(EndpointEvent::Removed(endpoint));
        }
    }

    /// Whether the endpoint is currently a member.
    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(endpoint)
    }
}

impl HostDiscovery for FixedHostDiscovery {
    fn hosts(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.events.subscribe()
    }
}
