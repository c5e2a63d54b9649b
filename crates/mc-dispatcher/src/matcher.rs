use mc_model::{Agent, ChangeEvent};

/// Evaluate the four matching rules in order (§4.2). Short-circuits on the
/// first failing rule — filter compilation only runs for agents that already
/// pass the cheap structural checks.
pub fn matches(event: &ChangeEvent, agent: &Agent) -> Result<bool, mc_model::MongoClawModelError> {
    if !event.matches_collection(&agent.watch.database, &agent.watch.collection) {
        return Ok(false);
    }
    if !event.matches_operation(&agent.watch.operations) {
        return Ok(false);
    }
    if !agent.enabled {
        return Ok(false);
    }

    let filter = agent.watch.compiled_filter()?;
    if event.full_document.is_none() {
        if !filter.references_only_id() {
            return Ok(false);
        }
        // No post-image to evaluate against, but the filter only touches
        // `_id` — synthesize a minimal document from the event's own key so
        // an `_id`-only filter can still match a delete (§4.2 rule 4).
        let synthetic = serde_json::json!({ "_id": event.document_id });
        return Ok(filter.matches(Some(&synthetic)));
    }
    Ok(filter.matches(event.full_document.as_ref()))
}
