#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod limiter;
mod middleware;
pub mod policy;

pub use backend::{CounterEntry, CounterStore, Increment};
pub use config::RateLimitConfig;
pub use error::Error;
pub use identity::IdentifierResolver;
pub use limiter::builder::RateLimiterBuilder;
pub use limiter::{Decision, RateLimiter};
pub use middleware::{DeniedBody, RateLimit, RateLimitMiddleware, DENIED_MESSAGE};
pub use policy::{Policy, PolicyResolver};
