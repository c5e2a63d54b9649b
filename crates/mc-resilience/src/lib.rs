//! Resilience fabric (§4.6): circuit breaker, rate limiter, cost limiter,
//! quarantine, and SLO tracking, composed behind `AdmissionGate` for the
//! worker pool's step 3.

pub mod breaker;
pub mod cost_limiter;
pub mod quarantine;
pub mod rate_limiter;
pub mod slo;

pub use breaker::{BreakerState, CircuitBreakerRegistry};
pub use cost_limiter::CostLimiters;
pub use quarantine::QuarantineTracker;
pub use rate_limiter::AgentRateLimiters;
pub use slo::SloTracker;

/// Why admission was denied (§4.4 step 3) — used to pick the nack delay and,
/// for `Quarantined`, to skip incrementing the attempt counter (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDenial {
    RateLimited,
    CostLimited,
    BreakerOpen,
    Quarantined,
}

/// Aggregates the four admission-time gates the worker consults before
/// calling the model (§4.4 step 3), plus the SLO tracker fed by completed
/// executions (§4.6).
pub struct AdmissionGate {
    pub breakers: CircuitBreakerRegistry,
    pub rate_limiters: AgentRateLimiters,
    pub cost_limiters: CostLimiters,
    pub quarantine: QuarantineTracker,
    pub slo: SloTracker,
}

impl AdmissionGate {
    pub fn new(quarantine_threshold: u32, slo_target_latency_secs: f64) -> Self {
        Self {
            breakers: CircuitBreakerRegistry::new(),
            rate_limiters: AgentRateLimiters::new(),
            cost_limiters: CostLimiters::new(),
            quarantine: QuarantineTracker::new(quarantine_threshold),
            slo: SloTracker::new(slo_target_latency_secs),
        }
    }

    pub fn check(
        &self,
        agent_id: &str,
        provider: &str,
        model: &str,
        rate_limit_per_minute: u32,
        cost_limit_usd_per_hour: f64,
    ) -> Result<(), AdmissionDenial> {
        if self.quarantine.is_quarantined(agent_id) {
            return Err(AdmissionDenial::Quarantined);
        }
        if !self.breakers.admit(agent_id, provider, model) {
            return Err(AdmissionDenial::BreakerOpen);
        }
        if !self.rate_limiters.check(agent_id, rate_limit_per_minute) {
            return Err(AdmissionDenial::RateLimited);
        }
        if !self.cost_limiters.admit(agent_id, cost_limit_usd_per_hour) {
            return Err(AdmissionDenial::CostLimited);
        }
        Ok(())
    }

    pub fn record_outcome(&self, agent_id: &str, provider: &str, model: &str, success: bool, cost_usd: f64) {
        self.breakers.record(agent_id, provider, model, success);
        self.cost_limiters.record(agent_id, cost_usd);
        if success {
            self.quarantine.record_success(agent_id);
        }
    }

    pub fn record_dlq(&self, agent_id: &str) {
        self.quarantine.record_dlq(agent_id);
    }
}

/// Exponential nack delay for an admission denial, mirroring §4.4 step 3's
/// `retry_delay_ms · 2^attempt` (capped), reusing `mc_common::exponential_backoff_ms`.
pub fn admission_retry_delay_ms(retry_delay_ms: u64, attempt: u32) -> u64 {
    mc_common::exponential_backoff_ms(retry_delay_ms, attempt, 60_000)
}
