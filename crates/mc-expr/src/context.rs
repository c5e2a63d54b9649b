use chrono::{DateTime, Utc};
use serde_json::Value;

/// Evaluation context threaded through prompt/template rendering (§4.4 step 4):
/// `{document, agent, operation, now}`.
#[derive(Debug, Clone)]
pub struct Context {
    pub document: Value,
    pub agent: Value,
    pub operation: String,
    pub now: DateTime<Utc>,
}

impl Context {
    pub fn new(document: Value, agent: Value, operation: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            document,
            agent,
            operation: operation.into(),
            now,
        }
    }

    /// Resolve a dotted path against one of the four root variables.
    /// Returns `Value::Null` for any unresolved segment rather than erroring,
    /// so `default(...)` can distinguish "absent" from a parse failure.
    pub fn resolve(&self, path: &[String]) -> Value {
        let Some((root, rest)) = path.split_first() else {
            return Value::Null;
        };
        let mut current = match root.as_str() {
            "document" => &self.document,
            "agent" => &self.agent,
            "operation" => return Value::String(self.operation.clone()),
            "now" => return Value::String(self.now.to_rfc3339()),
            _ => return Value::Null,
        };
        for segment in rest {
            current = match current.get(segment) {
                Some(v) => v,
                None => return Value::Null,
            };
        }
        current.clone()
    }
}
