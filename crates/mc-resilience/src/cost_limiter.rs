use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(3600);

struct Sample {
    at: Instant,
    cost_usd: f64,
}

#[derive(Default)]
struct AgentCostWindow {
    samples: Mutex<VecDeque<Sample>>,
}

/// Rolling 1-hour `cost_usd` window per agent (§4.6). Admission is denied
/// when the projected next-call cost — the agent's running average over the
/// window — would push the rolling sum past `cost_limit_usd_per_hour`.
#[derive(Default)]
pub struct CostLimiters {
    windows: DashMap<String, AgentCostWindow>,
}

impl CostLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(samples: &mut VecDeque<Sample>) {
        let cutoff = Instant::now() - WINDOW;
        while samples.front().map(|s| s.at < cutoff).unwrap_or(false) {
            samples.pop_front();
        }
    }

    pub fn admit(&self, agent_id: &str, cost_limit_usd_per_hour: f64) -> bool {
        let entry = self.windows.entry(agent_id.to_string()).or_default();
        let mut samples = entry.samples.lock();
        Self::prune(&mut samples);
        if samples.is_empty() {
            return true;
        }
        let sum: f64 = samples.iter().map(|s| s.cost_usd).sum();
        let avg = sum / samples.len() as f64;
        sum + avg <= cost_limit_usd_per_hour
    }

    pub fn record(&self, agent_id: &str, cost_usd: f64) {
        let entry = self.windows.entry(agent_id.to_string()).or_default();
        let mut samples = entry.samples.lock();
        Self::prune(&mut samples);
        samples.push_back(Sample { at: Instant::now(), cost_usd });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_when_no_history() {
        let limiters = CostLimiters::new();
        assert!(limiters.admit("classify", 1.0));
    }

    #[test]
    fn denies_when_projected_cost_exceeds_limit() {
        let limiters = CostLimiters::new();
        limiters.record("classify", 0.9);
        assert!(!limiters.admit("classify", 1.0));
    }
}
