//! The service pool: instance cache, dispatcher, and builders.

mod async_pool;
mod builder;
mod cache;
mod dispatcher;
mod handle;
mod policy;

pub use async_pool::AsyncServicePool;
pub use builder::ServicePoolBuilder;
pub use cache::{DEFAULT_SWEEP_INTERVAL, InstanceCache};
pub use dispatcher::{EndpointResult, ServicePool};
pub use handle::ServiceHandle;
pub use policy::{
    CachingPolicy, CachingPolicyBuilder, DEFAULT_DUPLICATE_REGISTRATION_WINDOW, ExhaustionAction,
};
