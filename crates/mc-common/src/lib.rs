//! Shared types and utilities used across the MongoClaw crates.
//!
//! Mirrors `fc-common`'s role in the teacher codebase: a small, dependency-light
//! crate that every other crate can depend on without risking a cycle.

use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Top-level error type for code that doesn't need a richer, crate-specific
/// taxonomy (most crates define their own `thiserror` enum instead — see
/// `mc_model::error::ErrorTag` for the dispositioned taxonomy).
#[derive(Debug, thiserror::Error)]
pub enum MongoClawError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("shutdown in progress")]
    ShutdownInProgress,
}

pub type Result<T> = std::result::Result<T, MongoClawError>;

/// Install a `tracing-subscriber` with env-filter + optional JSON formatting,
/// matching the teacher binaries' startup sequence.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Wall-clock stopwatch used throughout the worker/resilience crates to
/// compute `duration_ms` and latency histograms without pulling in a timing
/// dependency per crate.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch(Instant);

impl Stopwatch {
    pub fn start() -> Self {
        Self(Instant::now())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.0.elapsed().as_millis() as u64
    }
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::start()
    }
}

/// Exponential backoff sequence shared by the watcher's reconnection logic
/// and the worker's retry/nack delay computation (`retry_delay_ms * 2^n`,
/// capped). Grounded on `fc-stream::watcher`'s `INITIAL_BACKOFF_MS` /
/// `BACKOFF_MULTIPLIER` / `MAX_BACKOFF_MS` constants, generalized to take
/// its base and cap as parameters since the spec uses different bases and
/// caps per call site (§4.1 reconnect vs §4.4 retry vs §4.6 breaker cooldown).
pub fn exponential_backoff_ms(base_ms: u64, attempt: u32, cap_ms: u64) -> u64 {
    let shift = attempt.min(32);
    let scaled = base_ms.saturating_mul(1u64 << shift);
    scaled.min(cap_ms)
}
