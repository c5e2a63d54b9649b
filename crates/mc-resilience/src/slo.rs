use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const SAMPLE_WINDOW: Duration = Duration::from_secs(900);
const SUSTAINED_VIOLATION_WINDOW: Duration = Duration::from_secs(300);

struct Sample {
    at: Instant,
    latency_secs: f64,
}

struct AgentSlo {
    samples: Mutex<VecDeque<Sample>>,
    violating_since: Mutex<Option<Instant>>,
}

impl Default for AgentSlo {
    fn default() -> Self {
        Self { samples: Mutex::new(VecDeque::new()), violating_since: Mutex::new(None) }
    }
}

/// Per-agent p95 end-to-end latency tracker (§4.6). `record` returns `true`
/// exactly once per sustained violation episode — when p95 has exceeded the
/// target continuously for `SUSTAINED_VIOLATION_WINDOW` — so the caller can
/// emit `agent_latency_slo_violations_total` without double-counting.
#[derive(Default)]
pub struct SloTracker {
    agents: DashMap<String, AgentSlo>,
    target_secs: f64,
}

impl SloTracker {
    pub fn new(target_secs: f64) -> Self {
        Self { agents: DashMap::new(), target_secs }
    }

    fn prune(samples: &mut VecDeque<Sample>) {
        let cutoff = Instant::now() - SAMPLE_WINDOW;
        while samples.front().map(|s| s.at < cutoff).unwrap_or(false) {
            samples.pop_front();
        }
    }

    fn p95(samples: &VecDeque<Sample>) -> Option<f64> {
        if samples.is_empty() {
            return None;
        }
        let mut values: Vec<f64> = samples.iter().map(|s| s.latency_secs).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((values.len() as f64) * 0.95).ceil() as usize;
        Some(values[idx.saturating_sub(1).min(values.len() - 1)])
    }

    /// Record one completed execution's latency; returns `true` if this call
    /// newly crosses into a sustained SLO violation.
    pub fn record(&self, agent_id: &str, latency_secs: f64) -> bool {
        let entry = self.agents.entry(agent_id.to_string()).or_default();
        let mut samples = entry.samples.lock();
        Self::prune(&mut samples);
        samples.push_back(Sample { at: Instant::now(), latency_secs });
        let p95 = Self::p95(&samples).unwrap_or(0.0);

        let mut violating_since = entry.violating_since.lock();
        if p95 > self.target_secs {
            let since = violating_since.get_or_insert_with(Instant::now);
            let sustained = since.elapsed() >= SUSTAINED_VIOLATION_WINDOW;
            if sustained {
                // Reset so the next episode (after recovery) can fire again.
                *violating_since = None;
                return true;
            }
            false
        } else {
            *violating_since = None;
            false
        }
    }

    pub fn current_p95(&self, agent_id: &str) -> Option<f64> {
        let entry = self.agents.get(agent_id)?;
        let mut samples = entry.samples.lock();
        Self::prune(&mut samples);
        Self::p95(&samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p95_under_target_does_not_violate() {
        let tracker = SloTracker::new(30.0);
        for _ in 0..20 {
            assert!(!tracker.record("classify", 1.0));
        }
        assert!(tracker.current_p95("classify").unwrap() < 30.0);
    }
}
