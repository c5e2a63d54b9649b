use mc_expr::{FilterDoc, FilterExpr, Template};
use serde::{Deserialize, Serialize};

use crate::MongoClawModelError;

/// Mutation allowed to trigger a watch (§3 Agent.watch.operations).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Replace,
    Delete,
}

/// Write strategy applied by the Write Engine (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteStrategy {
    Merge,
    Replace,
    Append,
}

/// Per-document concurrency handling (§5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyMode {
    Eventual,
    Strong,
}

/// `Agent.watch` — which collection and which changes trigger this agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchSpec {
    pub database: String,
    pub collection: String,
    pub operations: Vec<Operation>,
    #[serde(default = "default_filter", skip_serializing_if = "serde_json::Value::is_null")]
    pub filter: FilterDoc,
}

fn default_filter() -> FilterDoc {
    serde_json::Value::Null
}

impl WatchSpec {
    pub fn compiled_filter(&self) -> Result<FilterExpr, MongoClawModelError> {
        FilterExpr::parse(&self.filter).map_err(|e| MongoClawModelError::InvalidAgent(e.to_string()))
    }
}

/// `Agent.ai` — model invocation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiSpec {
    pub provider: String,
    pub model: String,
    pub prompt: Template,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<Template>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<serde_json::Value>,
}

fn default_temperature() -> f64 {
    0.0
}

/// `Agent.write` — how the model's output is committed back to the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteSpec {
    pub strategy: WriteStrategy,
    pub target_field: String,
    /// Defaults to `document_id + agent_id + agent_revision` if omitted at load time
    /// (see `Agent::with_defaults`).
    pub idempotency_key: Template,
    #[serde(default = "default_true")]
    pub include_metadata: bool,
}

fn default_true() -> bool {
    true
}

/// `Agent.execution` — retry, throughput, and consistency policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSpec {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_cost_limit")]
    pub cost_limit_usd_per_hour: f64,
    #[serde(default)]
    pub consistency_mode: ConsistencyMode,
}

impl Default for ConsistencyMode {
    fn default() -> Self {
        ConsistencyMode::Eventual
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1_000
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_rate_limit() -> u32 {
    60
}
fn default_cost_limit() -> f64 {
    10.0
}

/// Declarative agent definition owned by the AgentStore (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    pub watch: WatchSpec,
    pub ai: AiSpec,
    pub write: WriteSpec,
    pub execution: ExecutionSpec,
    /// Monotonic, bumped on any mutation; invalidates idempotency keys tied to
    /// stale semantics (§3).
    pub revision: u64,
}

impl Agent {
    /// Validate the invariants listed in §3. Called by the AgentStore layer
    /// before an agent is accepted, and defensively by the cache on load.
    pub fn validate(&self) -> Result<(), MongoClawModelError> {
        if self.watch.operations.is_empty() {
            return Err(MongoClawModelError::InvalidAgent(
                "watch.operations must be non-empty".to_string(),
            ));
        }
        if self.write.strategy == WriteStrategy::Merge && self.write.target_field.contains('.') {
            return Err(MongoClawModelError::InvalidAgent(
                "write.target_field must be a single top-level field for strategy=merge".to_string(),
            ));
        }
        if self.ai.provider.trim().is_empty() || self.ai.model.trim().is_empty() {
            return Err(MongoClawModelError::InvalidAgent(
                "ai.provider and ai.model must be non-empty".to_string(),
            ));
        }
        self.watch.compiled_filter()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Agent {
        Agent {
            id: "classify".to_string(),
            name: "Classify tickets".to_string(),
            enabled: true,
            tags: vec![],
            watch: WatchSpec {
                database: "support".to_string(),
                collection: "tickets".to_string(),
                operations: vec![Operation::Insert],
                filter: serde_json::json!({"status": "open"}),
            },
            ai: AiSpec {
                provider: "anthropic".to_string(),
                model: "claude".to_string(),
                prompt: Template::parse("cat={{document.category_hint}}").unwrap(),
                system_prompt: None,
                temperature: 0.0,
                max_tokens: 256,
                response_schema: None,
            },
            write: WriteSpec {
                strategy: WriteStrategy::Merge,
                target_field: "ai_triage".to_string(),
                idempotency_key: Template::parse("{{document._id}}-{{agent.id}}-{{agent.revision}}").unwrap(),
                include_metadata: true,
            },
            execution: ExecutionSpec {
                max_retries: 3,
                retry_delay_ms: 1_000,
                timeout_ms: 30_000,
                rate_limit_per_minute: 60,
                cost_limit_usd_per_hour: 10.0,
                consistency_mode: ConsistencyMode::Eventual,
            },
            revision: 1,
        }
    }

    #[test]
    fn valid_agent_passes() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn empty_operations_rejected() {
        let mut a = sample();
        a.watch.operations.clear();
        assert!(a.validate().is_err());
    }

    #[test]
    fn dotted_target_field_rejected_for_merge() {
        let mut a = sample();
        a.write.target_field = "a.b".to_string();
        assert!(a.validate().is_err());
    }
}
