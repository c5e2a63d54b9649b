//! Runtime configuration: a TOML file plus `MONGOCLAW_*` environment
//! overrides, resolved once at process startup.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse config file {0}: {1}")]
    Parse(PathBuf, toml::de::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Mongo connection + collection layout (§6 "Persisted layout").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    pub mongo_uri: String,
    #[serde(default = "default_control_db")]
    pub control_database: String,
}

fn default_control_db() -> String {
    "mongoclaw".to_string()
}

/// HTTP endpoint for the generic OpenAI-compatible `ModelClient` (§6). The
/// provider SDK itself is out of scope; this is just enough to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_cost_per_1k_tokens")]
    pub cost_per_1k_tokens: f64,
}

fn default_api_key_env() -> String {
    "MONGOCLAW_MODEL_API_KEY".to_string()
}
fn default_cost_per_1k_tokens() -> f64 {
    0.01
}

/// Redis connection used as the concrete `KeyValueStream` backend (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    pub redis_url: String,
    #[serde(default = "default_stream_max_len")]
    pub stream_max_len: usize,
    #[serde(default = "default_stream_max_age_secs")]
    pub stream_max_age_secs: i64,
}

fn default_stream_max_len() -> usize {
    100_000
}
fn default_stream_max_age_secs() -> i64 {
    7 * 24 * 3600
}

/// Runtime-wide concurrency and timing knobs (§5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    #[serde(default = "default_handoff_depth")]
    pub watcher_handoff_depth: usize,
    #[serde(default = "default_reconcile_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_shutdown_secs")]
    pub shutdown_deadline_secs: u64,
    #[serde(default = "default_quarantine_threshold")]
    pub quarantine_consecutive_dlq: u32,
    #[serde(default = "default_slo_target_secs")]
    pub slo_target_latency_secs: f64,
    #[serde(default = "default_json_logs")]
    pub json_logs: bool,
}

fn default_handoff_depth() -> usize {
    256
}
fn default_reconcile_secs() -> u64 {
    5
}
fn default_worker_count() -> usize {
    10
}
fn default_shutdown_secs() -> u64 {
    30
}
fn default_quarantine_threshold() -> u32 {
    20
}
fn default_slo_target_secs() -> f64 {
    30.0
}
fn default_json_logs() -> bool {
    false
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            watcher_handoff_depth: default_handoff_depth(),
            reconcile_interval_secs: default_reconcile_secs(),
            worker_count: default_worker_count(),
            shutdown_deadline_secs: default_shutdown_secs(),
            quarantine_consecutive_dlq: default_quarantine_threshold(),
            slo_target_latency_secs: default_slo_target_secs(),
            json_logs: default_json_logs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoClawConfig {
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

impl MongoClawConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }
}

/// CLI entry point flags, mirroring the env-aware `clap::Parser` pattern the
/// teacher's dev binary uses for its own startup configuration.
#[derive(Debug, Parser)]
#[command(name = "mongoclaw-server", about = "MongoClaw change-feed agent pipeline")]
pub struct Cli {
    #[arg(long, env = "MONGOCLAW_CONFIG", default_value = "mongoclaw.toml")]
    pub config: PathBuf,
    #[arg(long, env = "MONGOCLAW_MONGO_URI")]
    pub mongo_uri: Option<String>,
    #[arg(long, env = "MONGOCLAW_REDIS_URL")]
    pub redis_url: Option<String>,
    #[arg(long, env = "MONGOCLAW_JSON_LOGS")]
    pub json_logs: bool,
}

impl Cli {
    /// Load the TOML file named by `--config`/`MONGOCLAW_CONFIG`, then apply
    /// any CLI/env overrides on top.
    pub fn resolve(&self) -> Result<MongoClawConfig> {
        let mut cfg = MongoClawConfig::load(&self.config)?;
        if let Some(uri) = &self.mongo_uri {
            cfg.store.mongo_uri = uri.clone();
        }
        if let Some(url) = &self.redis_url {
            cfg.queue.redis_url = url.clone();
        }
        if self.json_logs {
            cfg.runtime.json_logs = true;
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_minimal_config_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [store]
            mongoUri = "mongodb://localhost:27017"

            [queue]
            redisUrl = "redis://localhost:6379"

            [model]
            baseUrl = "https://api.example.com"
            "#
        )
        .unwrap();
        let cfg = MongoClawConfig::load(file.path()).unwrap();
        assert_eq!(cfg.runtime.worker_count, 10);
        assert_eq!(cfg.runtime.watcher_handoff_depth, 256);
        assert_eq!(cfg.metrics_addr, "0.0.0.0:9090");
    }

    #[test]
    fn missing_file_errors() {
        let result = MongoClawConfig::load(Path::new("/nonexistent/mongoclaw.toml"));
        assert!(result.is_err());
    }
}
