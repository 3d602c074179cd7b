use thiserror::Error;

/// Errors raised by counter stores and while loading configuration.
///
/// None of these escape [RateLimiter::check](crate::RateLimiter::check); the limiter logs them
/// and allows the request.
#[derive(Debug, Error)]
pub enum Error {
    #[cfg(feature = "redis")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
    #[error("Redis error: {0}")]
    Redis(
        #[source]
        #[from]
        redis::RedisError,
    ),
    #[cfg(feature = "redis")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
    #[error("Not connected to Redis")]
    Disconnected,
    #[error("Counter store did not respond within {0:?}")]
    Timeout(std::time::Duration),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(
        #[source]
        #[from]
        std::io::Error,
    ),
}

pub type Result<T> = std::result::Result<T, Error>;
