use mc_model::ErrorTag;
use mc_store::ModelErrorKind;
use serde_json::Value;

/// Maps a `ModelClient` transport/HTTP failure onto the fixed error taxonomy
/// (§7). 408/429 nuance noted in DESIGN.md: `HttpModelClient` already folds
/// 429 into `RateLimited` before this ever sees it; every other 4xx collapses
/// to `Model4xx` (non-retryable), which is a deliberate simplification for
/// the 408 case.
pub fn model_error_tag(kind: ModelErrorKind) -> ErrorTag {
    match kind {
        ModelErrorKind::Timeout => ErrorTag::ModelTimeout,
        ModelErrorKind::RateLimited => ErrorTag::ModelRateLimited,
        ModelErrorKind::ClientError => ErrorTag::Model4xx,
        ModelErrorKind::ServerError => ErrorTag::Model5xx,
        ModelErrorKind::Other => ErrorTag::Model5xx,
    }
}

/// Validate `instance` against a declarative `response_schema` (§4.4 step 6).
pub fn validate_against_schema(schema: &Value, instance: &Value) -> Result<(), String> {
    let validator = jsonschema::validator_for(schema).map_err(|e| e.to_string())?;
    validator.validate(instance).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_maps_to_model_timeout() {
        assert_eq!(model_error_tag(ModelErrorKind::Timeout), ErrorTag::ModelTimeout);
    }

    #[test]
    fn schema_validation_rejects_missing_required_field() {
        let schema = serde_json::json!({
            "type": "object",
            "required": ["label"],
            "properties": {"label": {"type": "string"}}
        });
        assert!(validate_against_schema(&schema, &serde_json::json!({"label": "billing"})).is_ok());
        assert!(validate_against_schema(&schema, &serde_json::json!({})).is_err());
    }
}
