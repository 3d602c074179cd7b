//! Startup configuration.
//!
//! Everything the limiter needs is read once, before the first request: which counter store to
//! use, how to verify session tokens, and the policy table.

use crate::backend::memory::InMemoryStore;
use crate::backend::CounterStore;
use crate::error::{Error, Result};
use crate::identity::token::{Hs256Verifier, TokenVerifier};
use crate::identity::{IdentifierResolver, DEFAULT_TOKEN_COOKIE};
use crate::limiter::RateLimiter;
use crate::policy::{Policy, PolicyResolver, DEFAULT_LIMIT, DEFAULT_WINDOW_MS};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const REDIS_URL_VAR: &str = "REDIS_URL";
pub const TOKEN_SECRET_VAR: &str = "JWT_SECRET";

/// Main configuration for the rate limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Counter store selection
    #[serde(default)]
    pub store: StoreConfig,

    /// Session token handling
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Quota for endpoints without a policy of their own
    #[serde(default)]
    pub default_policy: DefaultPolicy,

    /// Endpoint policies. When absent the stock table is used.
    #[serde(default)]
    pub policies: Option<Vec<Policy>>,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL. Without one, counters are kept in process memory.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Namespace for Redis keys
    #[serde(default)]
    pub key_prefix: Option<String>,

    /// Upper bound on each Redis round trip, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// How often the in-memory store drops expired windows, in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: None,
            timeout_ms: default_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    500
}

fn default_sweep_interval_secs() -> u64 {
    60
}

/// Identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Shared secret for HS256 session tokens. Without it, every client is identified by address.
    #[serde(default)]
    pub token_secret: Option<String>,

    /// Cookie carrying the session token
    #[serde(default = "default_token_cookie")]
    pub token_cookie: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            token_secret: None,
            token_cookie: default_token_cookie(),
        }
    }
}

fn default_token_cookie() -> String {
    DEFAULT_TOKEN_COOKIE.to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultPolicy {
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

impl Default for DefaultPolicy {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_ms: default_window_ms(),
        }
    }
}

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

fn default_window_ms() -> u64 {
    DEFAULT_WINDOW_MS
}

impl RateLimitConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        log::info!("Loading rate limit configuration from {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("Failed to parse rate limit config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `REDIS_URL` and `JWT_SECRET` from the environment, if set.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // Only redis:// and rediss:// URLs select the shared store
        if let Some(url) = lookup(REDIS_URL_VAR).filter(|url| url.starts_with("redis")) {
            self.store.redis_url = Some(url);
        }
        if let Some(secret) = lookup(TOKEN_SECRET_VAR).filter(|secret| !secret.is_empty()) {
            self.identity.token_secret = Some(secret);
        }
        self
    }

    fn validate(&self) -> Result<()> {
        if self.default_policy.window_ms == 0 {
            return Err(Error::Config("default_policy.window_ms must be non-zero".into()));
        }
        if let Some(policy) = self
            .policies
            .iter()
            .flatten()
            .find(|policy| policy.window_ms == 0 || !policy.endpoint.starts_with('/'))
        {
            return Err(Error::Config(format!(
                "Invalid policy for {} {}: endpoints start with '/' and windows are non-zero",
                policy.method, policy.endpoint
            )));
        }
        if self.store.sweep_interval_secs == 0 {
            return Err(Error::Config("store.sweep_interval_secs must be non-zero".into()));
        }
        Ok(())
    }

    pub fn policy_resolver(&self) -> PolicyResolver {
        let default_window = Duration::from_millis(self.default_policy.window_ms);
        match &self.policies {
            None => PolicyResolver::default()
                .with_default_policy(self.default_policy.limit, default_window),
            Some(policies) => PolicyResolver::from_policies(
                self.default_policy.limit,
                default_window,
                policies.iter().cloned(),
            ),
        }
    }

    pub fn identifier(&self) -> IdentifierResolver {
        let verifier = self
            .identity
            .token_secret
            .as_ref()
            .map(|secret| Arc::new(Hs256Verifier::new(secret)) as Arc<dyn TokenVerifier>);
        if verifier.is_none() {
            log::warn!("No session token secret configured, rate limiting by client address only");
        }
        IdentifierResolver::new(verifier).with_cookie_name(&self.identity.token_cookie)
    }

    /// Construct the configured counter store.
    ///
    /// The in-memory store has its sweeper started, so this must run inside an actix runtime.
    /// An unreachable Redis server is not an error here; the store reconnects as it is used.
    pub async fn build_store(&self) -> Result<Arc<dyn CounterStore>> {
        match &self.store.redis_url {
            Some(url) => self.build_redis_store(url).await,
            None => {
                log::info!("Rate limiter using in-memory storage");
                let store = InMemoryStore::builder()
                    .with_sweep_interval(Duration::from_secs(self.store.sweep_interval_secs))
                    .build();
                store.start_sweeper();
                Ok(Arc::new(store))
            }
        }
    }

    #[cfg(feature = "redis")]
    async fn build_redis_store(&self, url: &str) -> Result<Arc<dyn CounterStore>> {
        use crate::backend::redis::RedisStore;

        log::info!("Rate limiter using Redis storage");
        let timeout = Duration::from_millis(self.store.timeout_ms);
        let store = RedisStore::connect(url, timeout)
            .await?
            .key_prefix(self.store.key_prefix.as_deref())
            .build();
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "redis"))]
    async fn build_redis_store(&self, _url: &str) -> Result<Arc<dyn CounterStore>> {
        Err(Error::Config(
            "a Redis URL is configured but the `redis` feature is not enabled".into(),
        ))
    }

    /// Construct the rate limiter, store included.
    pub async fn build_limiter(&self) -> Result<RateLimiter> {
        let store = self.build_store().await?;
        Ok(RateLimiter::builder(store)
            .policies(self.policy_resolver())
            .identifier(self.identifier())
            .build())
    }
}
