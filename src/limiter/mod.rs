pub mod builder;

use crate::backend::{CounterEntry, CounterStore, Increment};
use crate::clock::Clock;
use crate::error::Result;
use crate::identity::IdentifierResolver;
use crate::policy::{Policy, PolicyResolver};
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::HttpRequest;
use builder::RateLimiterBuilder;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::Arc;

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub static X_RATELIMIT_RESET: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-reset"));

/// Limit reported when the limiter itself fails and lets the request through.
pub const FAIL_OPEN_LIMIT: u64 = 100;
pub const FAIL_OPEN_REMAINING: u64 = 99;
pub const FAIL_OPEN_RESET_MS: u64 = 60_000;

/// The outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    /// Total number of requests that are permitted within the window.
    pub limit: u64,
    /// Number of requests that will be permitted until the window resets.
    pub remaining: u64,
    /// Time at which the window resets, in milliseconds since the Unix epoch.
    pub reset_at: u64,
}

impl Decision {
    fn allowed(limit: u64, count: u64, reset_at: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at,
        }
    }

    fn denied(limit: u64, reset_at: u64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_at,
        }
    }

    fn fail_open(now_ms: u64) -> Self {
        Self {
            allowed: true,
            limit: FAIL_OPEN_LIMIT,
            remaining: FAIL_OPEN_REMAINING,
            reset_at: now_ms.saturating_add(FAIL_OPEN_RESET_MS),
        }
    }

    pub fn is_allowed(self) -> bool {
        self.allowed
    }

    pub fn is_denied(self) -> bool {
        !self.allowed
    }

    /// Seconds until the reset (rounded upwards, so that it is guaranteed to be reset after
    /// waiting for the duration). Zero once the reset time has passed.
    pub fn seconds_until_reset(&self, now_ms: u64) -> u64 {
        let millis = self.reset_at.saturating_sub(now_ms);
        millis.div_ceil(1000)
    }
}

/// Fixed window rate limiter keyed by identity, method and endpoint.
///
/// Each `(identity, method, endpoint pattern)` gets its own counter, named
/// `identity:METHOD:/normalized/endpoint`.
///
/// The limiter fails open: if the counter store errors, the request is allowed and the error is
/// logged. It never rolls back a count once a request has been admitted.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    policies: PolicyResolver,
    identifier: IdentifierResolver,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// # Arguments
    ///
    /// * `store`: Where counters are kept, see [crate::backend].
    pub fn builder(store: Arc<dyn CounterStore>) -> RateLimiterBuilder {
        RateLimiterBuilder::new(store)
    }

    /// Check and count a request against its quota.
    ///
    /// `endpoint` is the request path; numeric segments are normalized before the policy lookup.
    pub async fn check(&self, req: &HttpRequest, endpoint: &str, method: &str) -> Decision {
        let identity = self.identifier.resolve(req);
        self.check_identity(&identity, endpoint, method).await
    }

    /// As [RateLimiter::check], for a caller that has already resolved the identity tag.
    pub async fn check_identity(&self, identity: &str, endpoint: &str, method: &str) -> Decision {
        let policy = self.policies.resolve(endpoint, method);
        let key = format!("{identity}:{}:{}", policy.method, policy.endpoint);
        match self.count(&key, &policy).await {
            Ok(decision) => decision,
            Err(e) => {
                log::error!("Rate limiter failed for {key}: {e}, allowing the request anyway");
                Decision::fail_open(self.clock.now_ms())
            }
        }
    }

    async fn count(&self, key: &str, policy: &Policy) -> Result<Decision> {
        let now = self.clock.now_ms();
        let entry = match self.store.get(key).await? {
            Some(entry) if !entry.is_expired(now) => entry,
            _ => {
                self.store
                    .insert_if_vacant(key, CounterEntry::open(now, policy.window_ms), now)
                    .await?
            }
        };

        // A denied request is not counted
        if entry.count >= policy.limit {
            log::debug!("Rate limit exceeded for {key}");
            return Ok(Decision::denied(policy.limit, entry.reset_at));
        }

        match self.store.increment_within(key, policy.limit).await? {
            // The window closed between the read and the increment; nothing was counted.
            Increment::Missing => Ok(Decision::allowed(policy.limit, 0, entry.reset_at)),
            Increment::Counted(count) if count <= policy.limit => {
                Ok(Decision::allowed(policy.limit, count, entry.reset_at))
            }
            // Another request took the last slot after our read
            Increment::Counted(_) | Increment::Full => {
                log::debug!("Rate limit exceeded for {key}");
                Ok(Decision::denied(policy.limit, entry.reset_at))
            }
        }
    }

    /// Headers describing a decision:
    ///
    /// - `x-ratelimit-limit`
    /// - `x-ratelimit-remaining`
    /// - `x-ratelimit-reset` (Unix time in seconds when the window resets)
    /// - `retry-after` (denied only, seconds until the reset)
    pub fn headers_for(&self, decision: &Decision) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(decision.limit));
        map.insert(
            X_RATELIMIT_REMAINING.clone(),
            HeaderValue::from(decision.remaining),
        );
        map.insert(
            X_RATELIMIT_RESET.clone(),
            HeaderValue::from(decision.reset_at / 1000),
        );
        if decision.is_denied() {
            map.insert(RETRY_AFTER, HeaderValue::from(self.retry_after(decision)));
        }
        map
    }

    /// Seconds a denied client should wait before trying again.
    pub fn retry_after(&self, decision: &Decision) -> u64 {
        decision.seconds_until_reset(self.clock.now_ms())
    }

    pub fn policies(&self) -> &PolicyResolver {
        &self.policies
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryStore;
    use crate::clock::ManualClock;
    use crate::error::Error;
    use crate::identity::token::{sign_for_tests, Hs256Verifier};
    use actix_web::cookie::Cookie;
    use actix_web::test::TestRequest;
    use async_trait::async_trait;
    use std::time::Duration;

    const START_MS: u64 = 1_700_000_000_000;
    const ENDPOINT: &str = "/api/things";

    fn five_per_second() -> PolicyResolver {
        PolicyResolver::from_policies(
            100,
            Duration::from_secs(60),
            [Policy::new("GET", ENDPOINT, 5, Duration::from_millis(1000))],
        )
    }

    fn limiter_with(clock: &ManualClock) -> (RateLimiter, Arc<InMemoryStore>) {
        let store = Arc::new(
            InMemoryStore::builder()
                .with_clock(Arc::new(clock.clone()))
                .build(),
        );
        let limiter = RateLimiter::builder(store.clone())
            .policies(five_per_second())
            .clock(Arc::new(clock.clone()))
            .build();
        (limiter, store)
    }

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<CounterEntry>> {
            Err(Error::Timeout(Duration::from_millis(500)))
        }

        async fn set(&self, _key: &str, _entry: CounterEntry) -> Result<()> {
            Err(Error::Timeout(Duration::from_millis(500)))
        }

        async fn increment(&self, _key: &str) -> Result<u64> {
            Err(Error::Timeout(Duration::from_millis(500)))
        }
    }

    #[actix_web::test]
    async fn test_window_scenario() {
        let clock = ManualClock::new(START_MS);
        let (limiter, _) = limiter_with(&clock);
        let reset_at = START_MS + 1000;

        for expected_remaining in (0..5).rev() {
            let decision = limiter.check_identity("ip:1.1.1.1", ENDPOINT, "GET").await;
            assert_eq!(
                decision,
                Decision {
                    allowed: true,
                    limit: 5,
                    remaining: expected_remaining,
                    reset_at,
                }
            );
        }

        clock.advance(Duration::from_millis(300));
        let denied = limiter.check_identity("ip:1.1.1.1", ENDPOINT, "GET").await;
        assert!(denied.is_denied());
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at, reset_at);
        // 700ms left, rounded up
        assert_eq!(limiter.retry_after(&denied), 1);

        clock.advance(Duration::from_millis(700));
        let fresh = limiter.check_identity("ip:1.1.1.1", ENDPOINT, "GET").await;
        assert!(fresh.is_allowed());
        assert_eq!(fresh.remaining, 4);
        assert_eq!(fresh.reset_at, START_MS + 2000);
    }

    #[actix_web::test]
    async fn test_denied_requests_are_not_counted() {
        let clock = ManualClock::new(START_MS);
        let (limiter, store) = limiter_with(&clock);
        for _ in 0..20 {
            limiter.check_identity("ip:1.1.1.1", ENDPOINT, "GET").await;
        }
        let entry = store
            .get(&format!("ip:1.1.1.1:GET:{ENDPOINT}"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.count, 5);
    }

    #[actix_web::test]
    async fn test_identities_do_not_share_counters() {
        let clock = ManualClock::new(START_MS);
        let (limiter, _) = limiter_with(&clock);
        for _ in 0..5 {
            assert!(limiter
                .check_identity("ip:1.1.1.1", ENDPOINT, "GET")
                .await
                .is_allowed());
        }
        assert!(limiter
            .check_identity("ip:1.1.1.1", ENDPOINT, "GET")
            .await
            .is_denied());
        let other = limiter.check_identity("ip:2.2.2.2", ENDPOINT, "GET").await;
        assert!(other.is_allowed());
        assert_eq!(other.remaining, 4);
        let user = limiter.check_identity("user:1", ENDPOINT, "GET").await;
        assert_eq!(user.remaining, 4);
    }

    #[actix_web::test]
    async fn test_ids_share_one_bucket() {
        let clock = ManualClock::new(START_MS);
        let store = Arc::new(InMemoryStore::builder().build());
        let limiter = RateLimiter::builder(store.clone())
            .clock(Arc::new(clock))
            .build();
        let first = limiter.check_identity("user:1", "/api/issues/42", "PUT").await;
        let second = limiter.check_identity("user:1", "/api/issues/999", "PUT").await;
        assert_eq!(first.limit, 50);
        assert_eq!(first.remaining, 49);
        assert_eq!(second.remaining, 48);
        assert!(store
            .get("user:1:PUT:/api/issues/:id")
            .await
            .unwrap()
            .is_some());
        // The collection is counted separately
        let collection = limiter.check_identity("user:1", "/api/issues", "GET").await;
        assert_eq!(collection.remaining, 99);
    }

    #[actix_web::test]
    async fn test_check_resolves_identity() {
        let clock = ManualClock::new(START_MS);
        let store = Arc::new(InMemoryStore::builder().build());
        let limiter = RateLimiter::builder(store.clone())
            .policies(five_per_second())
            .token_verifier(Arc::new(Hs256Verifier::new("secret")))
            .clock(Arc::new(clock))
            .build();
        let token = sign_for_tests("secret", serde_json::json!({"id": 9}));
        let req = TestRequest::get()
            .uri(ENDPOINT)
            .cookie(Cookie::new("token", token))
            .insert_header(("x-forwarded-for", "203.0.113.9"))
            .to_http_request();
        limiter.check(&req, ENDPOINT, "GET").await;
        assert!(store
            .get(&format!("user:9:GET:{ENDPOINT}"))
            .await
            .unwrap()
            .is_some());

        let anonymous = TestRequest::get()
            .uri(ENDPOINT)
            .insert_header(("x-forwarded-for", "203.0.113.9"))
            .to_http_request();
        limiter.check(&anonymous, ENDPOINT, "GET").await;
        assert!(store
            .get(&format!("ip:203.0.113.9:GET:{ENDPOINT}"))
            .await
            .unwrap()
            .is_some());
    }

    #[actix_web::test]
    async fn test_stale_entry_starts_fresh_window() {
        let clock = ManualClock::new(START_MS);
        let (limiter, store) = limiter_with(&clock);
        let key = format!("ip:1.1.1.1:GET:{ENDPOINT}");
        // Left over from a long gone window, far over the limit
        store
            .set(
                &key,
                CounterEntry {
                    count: 400,
                    reset_at: START_MS - 1,
                },
            )
            .await
            .unwrap();
        let decision = limiter.check_identity("ip:1.1.1.1", ENDPOINT, "GET").await;
        assert!(decision.is_allowed());
        assert_eq!(decision.remaining, 4);
        assert_eq!(decision.reset_at, START_MS + 1000);
    }

    #[actix_web::test]
    async fn test_zero_limit_denies_everything() {
        let clock = ManualClock::new(START_MS);
        let store = Arc::new(InMemoryStore::builder().build());
        let limiter = RateLimiter::builder(store)
            .policies(PolicyResolver::new(0, Duration::from_secs(1)))
            .clock(Arc::new(clock))
            .build();
        let decision = limiter.check_identity("ip:1.1.1.1", "/x", "GET").await;
        assert!(decision.is_denied());
        assert_eq!(decision.remaining, 0);
    }

    #[actix_web::test]
    async fn test_fail_open() {
        let clock = ManualClock::new(START_MS);
        let limiter = RateLimiter::builder(Arc::new(BrokenStore))
            .policies(five_per_second())
            .clock(Arc::new(clock))
            .build();
        for _ in 0..10 {
            let decision = limiter.check_identity("ip:1.1.1.1", ENDPOINT, "GET").await;
            assert_eq!(
                decision,
                Decision {
                    allowed: true,
                    limit: FAIL_OPEN_LIMIT,
                    remaining: FAIL_OPEN_REMAINING,
                    reset_at: START_MS + FAIL_OPEN_RESET_MS,
                }
            );
        }
    }

    #[actix_web::test]
    async fn test_headers() {
        let clock = ManualClock::new(START_MS);
        let (limiter, _) = limiter_with(&clock);
        let allowed = Decision {
            allowed: true,
            limit: 5,
            remaining: 3,
            reset_at: START_MS + 1_500,
        };
        let headers = limiter.headers_for(&allowed);
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "5");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "3");
        assert_eq!(headers.get("x-ratelimit-reset").unwrap(), "1700000001");
        assert!(headers.get("retry-after").is_none());

        let denied = Decision {
            allowed: false,
            remaining: 0,
            ..allowed
        };
        let headers = limiter.headers_for(&denied);
        assert_eq!(headers.get("retry-after").unwrap(), "2");

        // Never negative once the reset has passed
        clock.advance(Duration::from_secs(10));
        let headers = limiter.headers_for(&denied);
        assert_eq!(headers.get("retry-after").unwrap(), "0");
    }

    #[test]
    fn test_seconds_until_reset() {
        let decision = Decision {
            allowed: false,
            limit: 0,
            remaining: 0,
            reset_at: 60_000,
        };
        // Verify rounded upwards from 30.1
        assert_eq!(decision.seconds_until_reset(29_900), 31);
        assert_eq!(decision.seconds_until_reset(59_000), 1);
        assert_eq!(decision.seconds_until_reset(60_000), 0);
        assert_eq!(decision.seconds_until_reset(90_000), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_requests_admit_exactly_limit() {
        const LIMIT: u64 = 25;
        const REQUESTS: usize = 400;
        let clock = ManualClock::new(START_MS);
        let store = Arc::new(InMemoryStore::builder().build());
        let limiter = Arc::new(
            RateLimiter::builder(store.clone())
                .policies(PolicyResolver::new(LIMIT, Duration::from_secs(60)))
                .clock(Arc::new(clock))
                .build(),
        );

        let tasks: Vec<_> = (0..REQUESTS)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter
                        .check_identity("ip:10.0.0.1", "/api/hot", "POST")
                        .await
                })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            let decision = task.await.unwrap();
            if decision.is_allowed() {
                admitted += 1;
            }
            assert!(decision.remaining <= LIMIT);
        }
        assert_eq!(admitted, LIMIT);
        // Requests that lost the race for the last slot did not inflate the count
        let entry = store
            .get("ip:10.0.0.1:POST:/api/hot")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.count, LIMIT);
    }

    /// Answers every read with a window one short of its limit, as if many requests read it at
    /// once, and counts increments into a real store.
    struct StaleReadStore {
        inner: InMemoryStore,
        stale: CounterEntry,
    }

    #[async_trait]
    impl CounterStore for StaleReadStore {
        async fn get(&self, _key: &str) -> Result<Option<CounterEntry>> {
            Ok(Some(self.stale))
        }

        async fn set(&self, key: &str, entry: CounterEntry) -> Result<()> {
            self.inner.set(key, entry).await
        }

        async fn increment(&self, key: &str) -> Result<u64> {
            self.inner.increment(key).await
        }

        async fn increment_within(&self, key: &str, limit: u64) -> Result<Increment> {
            self.inner.increment_within(key, limit).await
        }
    }

    #[actix_web::test]
    async fn test_last_slot_race_does_not_inflate_count() {
        let clock = ManualClock::new(START_MS);
        let key = format!("ip:1.1.1.1:GET:{ENDPOINT}");
        let stale = CounterEntry {
            count: 4,
            reset_at: START_MS + 1000,
        };
        let store = Arc::new(StaleReadStore {
            inner: InMemoryStore::builder().build(),
            stale,
        });
        store.inner.set(&key, stale).await.unwrap();
        let limiter = RateLimiter::builder(store.clone())
            .policies(five_per_second())
            .clock(Arc::new(clock))
            .build();

        // Both requests read count 4 of 5; only one may take the slot
        let first = limiter.check_identity("ip:1.1.1.1", ENDPOINT, "GET").await;
        let second = limiter.check_identity("ip:1.1.1.1", ENDPOINT, "GET").await;
        assert!(first.is_allowed());
        assert_eq!(first.remaining, 0);
        assert!(second.is_denied());
        assert_eq!(store.inner.get(&key).await.unwrap().unwrap().count, 5);
    }
}
