//! Quota policies per endpoint.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Path segment substituted for numeric ids.
pub const ID_SEGMENT: &str = ":id";

pub const DEFAULT_LIMIT: u64 = 100;
pub const DEFAULT_WINDOW_MS: u64 = 15 * 60 * 1000;

/// Method used by the default policy before it is stamped with a real request.
pub const ANY_METHOD: &str = "ALL";

/// A quota: at most `limit` requests per `window_ms` for one identity on one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// The total requests to be allowed within the window.
    pub limit: u64,
    /// The rate limiting window, in milliseconds.
    pub window_ms: u64,
    /// The normalized endpoint pattern, e.g. `/api/issues/:id`.
    pub endpoint: String,
    /// HTTP method, upper case.
    pub method: String,
}

impl Policy {
    pub fn new(method: &str, endpoint: &str, limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window_ms: window.as_millis() as u64,
            endpoint: endpoint.to_owned(),
            method: method.to_ascii_uppercase(),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Replace every path segment made up only of digits with `:id`.
///
/// `/api/issues/42` and `/api/issues/999` both become `/api/issues/:id`, while `/api/issues` and
/// `/api/v2` are left alone.
pub fn normalize_endpoint(endpoint: &str) -> String {
    endpoint
        .split('/')
        .map(|segment| {
            if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
                ID_SEGMENT
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Maps `(method, endpoint)` pairs to policies.
///
/// The table is fixed at construction; lookups take `&self` and need no locking.
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    policies: HashMap<(String, String), Policy>,
    default_policy: Policy,
}

impl PolicyResolver {
    /// A resolver with an empty table, so every endpoint gets `default_policy`.
    pub fn new(default_limit: u64, default_window: Duration) -> Self {
        Self {
            policies: HashMap::new(),
            default_policy: Policy::new(ANY_METHOD, "default", default_limit, default_window),
        }
    }

    /// Build a resolver from a list of policies.
    ///
    /// Endpoints are normalized, so a policy may be written against `/api/issues/:id` or an
    /// example path like `/api/issues/1`. Later entries replace earlier ones for the same key.
    pub fn from_policies<I>(default_limit: u64, default_window: Duration, policies: I) -> Self
    where
        I: IntoIterator<Item = Policy>,
    {
        let mut resolver = Self::new(default_limit, default_window);
        for mut policy in policies {
            policy.endpoint = normalize_endpoint(&policy.endpoint);
            policy.method = policy.method.to_ascii_uppercase();
            resolver
                .policies
                .insert((policy.method.clone(), policy.endpoint.clone()), policy);
        }
        resolver
    }

    /// Keep the table but change the quota used for unlisted endpoints.
    pub fn with_default_policy(mut self, limit: u64, window: Duration) -> Self {
        self.default_policy = Policy::new(ANY_METHOD, "default", limit, window);
        self
    }

    /// Look up the policy for a request, falling back to the default policy.
    ///
    /// The fallback carries the request's own normalized endpoint and method, so it can be told
    /// apart in logs and keys.
    pub fn resolve(&self, endpoint: &str, method: &str) -> Policy {
        let endpoint = normalize_endpoint(endpoint);
        let method = method.to_ascii_uppercase();
        if let Some(policy) = self.policies.get(&(method.clone(), endpoint.clone())) {
            return policy.clone();
        }
        log::trace!("No rate limit policy for {method} {endpoint}, using the default");
        Policy {
            endpoint,
            method,
            ..self.default_policy.clone()
        }
    }

    pub fn default_policy(&self) -> &Policy {
        &self.default_policy
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// The stock table for the issue tracker API, with 100 requests per 15 minutes elsewhere.
impl Default for PolicyResolver {
    fn default() -> Self {
        let window = Duration::from_millis(DEFAULT_WINDOW_MS);
        let table = [
            // Authentication
            ("POST", "/api/auth/register", 5),
            ("POST", "/api/auth/login", 10),
            ("POST", "/api/auth/logout", 20),
            ("GET", "/api/auth/me", 100),
            // User profile
            ("GET", "/api/users/profile", 100),
            ("PUT", "/api/users/profile", 20),
            // Issues
            ("GET", "/api/issues", 100),
            ("POST", "/api/issues", 30),
            ("GET", "/api/issues/:id", 100),
            ("PUT", "/api/issues/:id", 50),
            ("DELETE", "/api/issues/:id", 50),
            // Projects
            ("GET", "/api/projects", 100),
            ("POST", "/api/projects", 20),
            ("GET", "/api/projects/:id", 100),
            ("PUT", "/api/projects/:id", 50),
            ("DELETE", "/api/projects/:id", 30),
            ("GET", "/api/projects/:id/issues", 100),
        ];
        Self::from_policies(
            DEFAULT_LIMIT,
            window,
            table
                .into_iter()
                .map(|(method, endpoint, limit)| Policy::new(method, endpoint, limit, window)),
        )
    }
}
