use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Per-agent token bucket (§4.6): capacity = `rate_limit_per_minute`, refill
/// = capacity/60 per second. Grounded on `fc-router::pool::ProcessPool`'s use
/// of `governor::RateLimiter::direct` per pool.
pub struct AgentRateLimiters {
    limiters: DashMap<String, Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>>,
}

impl Default for AgentRateLimiters {
    fn default() -> Self {
        Self { limiters: DashMap::new() }
    }
}

impl AgentRateLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    fn limiter_for(&self, agent_id: &str, rate_limit_per_minute: u32) -> Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>> {
        if let Some(existing) = self.limiters.get(agent_id) {
            return existing.clone();
        }
        let quota_size = NonZeroU32::new(rate_limit_per_minute).unwrap_or(nonzero!(1u32));
        let limiter = Arc::new(RateLimiter::direct(Quota::per_minute(quota_size)));
        self.limiters.insert(agent_id.to_string(), limiter.clone());
        limiter
    }

    /// Returns `true` if a call is admitted under the agent's current quota.
    pub fn check(&self, agent_id: &str, rate_limit_per_minute: u32) -> bool {
        self.limiter_for(agent_id, rate_limit_per_minute).check().is_ok()
    }
}
