use crate::backend::CounterStore;
use crate::clock::{Clock, SystemClock};
use crate::identity::token::TokenVerifier;
use crate::identity::IdentifierResolver;
use crate::limiter::RateLimiter;
use crate::policy::PolicyResolver;
use std::sync::Arc;

pub struct RateLimiterBuilder {
    store: Arc<dyn CounterStore>,
    policies: PolicyResolver,
    identifier: IdentifierResolver,
    clock: Arc<dyn Clock>,
}

impl RateLimiterBuilder {
    pub(super) fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            policies: PolicyResolver::default(),
            identifier: IdentifierResolver::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the policy table.
    ///
    /// Defaults to [PolicyResolver::default()].
    pub fn policies(mut self, policies: PolicyResolver) -> Self {
        self.policies = policies;
        self
    }

    /// Replace the identity resolver.
    ///
    /// By default requests are identified by client address only.
    pub fn identifier(mut self, identifier: IdentifierResolver) -> Self {
        self.identifier = identifier;
        self
    }

    /// Identify signed in users by their session token, read from the `token` cookie.
    pub fn token_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.identifier = IdentifierResolver::new(Some(verifier));
        self
    }

    /// The time source for window boundaries. Should match the clock given to the store.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> RateLimiter {
        log::debug!(
            "Rate limiter built with {} endpoint policies, default {} per {}ms",
            self.policies.len(),
            self.policies.default_policy().limit,
            self.policies.default_policy().window_ms
        );
        RateLimiter {
            store: self.store,
            policies: self.policies,
            identifier: self.identifier,
            clock: self.clock,
        }
    }
}
