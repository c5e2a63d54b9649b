use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW_SIZE: usize = 60;
const MIN_SAMPLES: usize = 10;
const ERROR_RATE_THRESHOLD: f64 = 0.5;
const OPEN_COOLDOWN: Duration = Duration::from_secs(30);
const MAX_COOLDOWN: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerCell {
    state: Mutex<CellState>,
}

struct CellState {
    state: BreakerState,
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    cooldown: Duration,
    half_open_probe_in_flight: bool,
}

impl Default for CellState {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            window: VecDeque::with_capacity(WINDOW_SIZE),
            opened_at: None,
            cooldown: OPEN_COOLDOWN,
            half_open_probe_in_flight: false,
        }
    }
}

/// Per-`(agent, provider, model)` circuit breaker (§4.6). Opens when the
/// error rate over a 60-item rolling window exceeds 50% (min 10 samples);
/// stays open for a cooldown that doubles on repeated failure (capped at
/// 5 minutes), then half-opens to admit exactly one probe.
pub struct CircuitBreakerRegistry {
    cells: DashMap<String, BreakerCell>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self { cells: DashMap::new() }
    }
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(agent_id: &str, provider: &str, model: &str) -> String {
        format!("{agent_id}|{provider}|{model}")
    }

    /// Returns `true` if a call may proceed. A `true` result for a
    /// half-open breaker reserves the single in-flight probe slot.
    pub fn admit(&self, agent_id: &str, provider: &str, model: &str) -> bool {
        let key = Self::key(agent_id, provider, model);
        let cell = self.cells.entry(key).or_insert_with(|| BreakerCell { state: Mutex::new(CellState::default()) });
        let mut state = cell.state.lock();
        match state.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= state.cooldown {
                    state.state = BreakerState::HalfOpen;
                    state.half_open_probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if state.half_open_probe_in_flight {
                    false
                } else {
                    state.half_open_probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record(&self, agent_id: &str, provider: &str, model: &str, success: bool) {
        let key = Self::key(agent_id, provider, model);
        let Some(cell) = self.cells.get(&key) else { return };
        let mut state = cell.state.lock();

        match state.state {
            BreakerState::HalfOpen => {
                state.half_open_probe_in_flight = false;
                if success {
                    state.state = BreakerState::Closed;
                    state.window.clear();
                    state.cooldown = OPEN_COOLDOWN;
                } else {
                    state.state = BreakerState::Open;
                    state.opened_at = Some(Instant::now());
                    state.cooldown = (state.cooldown * 2).min(MAX_COOLDOWN);
                }
            }
            BreakerState::Closed => {
                if state.window.len() == WINDOW_SIZE {
                    state.window.pop_front();
                }
                state.window.push_back(success);
                if state.window.len() >= MIN_SAMPLES {
                    let failures = state.window.iter().filter(|s| !**s).count();
                    let rate = failures as f64 / state.window.len() as f64;
                    if rate > ERROR_RATE_THRESHOLD {
                        state.state = BreakerState::Open;
                        state.opened_at = Some(Instant::now());
                        state.cooldown = OPEN_COOLDOWN;
                    }
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self, agent_id: &str, provider: &str, model: &str) -> BreakerState {
        let key = Self::key(agent_id, provider, model);
        self.cells.get(&key).map(|c| c.state.lock().state).unwrap_or(BreakerState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_breaker_admits_by_default() {
        let reg = CircuitBreakerRegistry::new();
        assert!(reg.admit("classify", "anthropic", "claude"));
    }

    #[test]
    fn opens_after_majority_failures_over_min_samples() {
        let reg = CircuitBreakerRegistry::new();
        for _ in 0..10 {
            reg.admit("classify", "anthropic", "claude");
            reg.record("classify", "anthropic", "claude", false);
        }
        assert_eq!(reg.state("classify", "anthropic", "claude"), BreakerState::Open);
        assert!(!reg.admit("classify", "anthropic", "claude"));
    }

    #[test]
    fn stays_closed_under_threshold() {
        let reg = CircuitBreakerRegistry::new();
        for i in 0..10 {
            reg.admit("classify", "anthropic", "claude");
            reg.record("classify", "anthropic", "claude", i % 3 != 0);
        }
        assert_eq!(reg.state("classify", "anthropic", "claude"), BreakerState::Closed);
    }
}
