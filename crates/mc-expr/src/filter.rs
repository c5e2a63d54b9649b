use crate::error::{ExprError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A subset of store-query operators (§4.2 rule 4):
/// `$eq, $ne, $in, $nin, $gt, $gte, $lt, $lte, $and, $or, $not, $exists, $regex`.
/// Parsed once at agent-creation time from the declarative JSON filter into
/// this tagged AST; never interpreted as arbitrary code.
#[derive(Debug, Clone)]
pub enum FilterExpr {
    Eq(Vec<String>, Value),
    Ne(Vec<String>, Value),
    In(Vec<String>, Vec<Value>),
    Nin(Vec<String>, Vec<Value>),
    Gt(Vec<String>, Value),
    Gte(Vec<String>, Value),
    Lt(Vec<String>, Value),
    Lte(Vec<String>, Value),
    Exists(Vec<String>, bool),
    Regex(Vec<String>, Regex),
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
    /// Empty filter — matches everything.
    Always,
}

impl PartialEq for FilterExpr {
    fn eq(&self, other: &Self) -> bool {
        use FilterExpr::*;
        match (self, other) {
            (Eq(p1, v1), Eq(p2, v2)) => p1 == p2 && v1 == v2,
            (Ne(p1, v1), Ne(p2, v2)) => p1 == p2 && v1 == v2,
            (In(p1, v1), In(p2, v2)) => p1 == p2 && v1 == v2,
            (Nin(p1, v1), Nin(p2, v2)) => p1 == p2 && v1 == v2,
            (Gt(p1, v1), Gt(p2, v2)) => p1 == p2 && v1 == v2,
            (Gte(p1, v1), Gte(p2, v2)) => p1 == p2 && v1 == v2,
            (Lt(p1, v1), Lt(p2, v2)) => p1 == p2 && v1 == v2,
            (Lte(p1, v1), Lte(p2, v2)) => p1 == p2 && v1 == v2,
            (Exists(p1, b1), Exists(p2, b2)) => p1 == p2 && b1 == b2,
            (Regex(p1, r1), Regex(p2, r2)) => p1 == p2 && r1.as_str() == r2.as_str(),
            (And(c1), And(c2)) => c1 == c2,
            (Or(c1), Or(c2)) => c1 == c2,
            (Not(b1), Not(b2)) => b1 == b2,
            (Always, Always) => true,
            _ => false,
        }
    }
}

/// Wire representation used on `Agent.watch.filter` — a raw JSON document so
/// agents can be stored/loaded verbatim from the `AgentStore`; parsed into
/// `FilterExpr` once, at load time.
pub type FilterDoc = Value;

impl FilterExpr {
    pub fn parse(doc: &FilterDoc) -> Result<Self> {
        match doc {
            Value::Null => Ok(FilterExpr::Always),
            Value::Object(map) if map.is_empty() => Ok(FilterExpr::Always),
            Value::Object(map) => {
                let mut clauses = Vec::new();
                for (key, value) in map {
                    clauses.push(Self::parse_clause(key, value)?);
                }
                if clauses.len() == 1 {
                    Ok(clauses.into_iter().next().unwrap())
                } else {
                    Ok(FilterExpr::And(clauses))
                }
            }
            _ => Err(ExprError::FilterNotObject),
        }
    }

    fn parse_clause(key: &str, value: &Value) -> Result<Self> {
        match key {
            "$and" => Ok(FilterExpr::And(Self::parse_array(value)?)),
            "$or" => Ok(FilterExpr::Or(Self::parse_array(value)?)),
            "$not" => Ok(FilterExpr::Not(Box::new(FilterExpr::parse(value)?))),
            _ if key.starts_with('$') => Err(ExprError::UnsupportedOperator(key.to_string())),
            _ => {
                let path = split_path(key);
                Self::parse_field(path, value)
            }
        }
    }

    fn parse_array(value: &Value) -> Result<Vec<FilterExpr>> {
        value
            .as_array()
            .ok_or(ExprError::FilterNotObject)?
            .iter()
            .map(FilterExpr::parse)
            .collect()
    }

    fn parse_field(path: Vec<String>, value: &Value) -> Result<Self> {
        match value {
            Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                let mut clauses = Vec::new();
                for (op, operand) in ops {
                    clauses.push(Self::parse_field_op(path.clone(), op, operand)?);
                }
                if clauses.len() == 1 {
                    Ok(clauses.into_iter().next().unwrap())
                } else {
                    Ok(FilterExpr::And(clauses))
                }
            }
            other => Ok(FilterExpr::Eq(path, other.clone())),
        }
    }

    fn parse_field_op(path: Vec<String>, op: &str, operand: &Value) -> Result<Self> {
        match op {
            "$eq" => Ok(FilterExpr::Eq(path, operand.clone())),
            "$ne" => Ok(FilterExpr::Ne(path, operand.clone())),
            "$gt" => Ok(FilterExpr::Gt(path, operand.clone())),
            "$gte" => Ok(FilterExpr::Gte(path, operand.clone())),
            "$lt" => Ok(FilterExpr::Lt(path, operand.clone())),
            "$lte" => Ok(FilterExpr::Lte(path, operand.clone())),
            "$in" => Ok(FilterExpr::In(
                path,
                operand.as_array().ok_or(ExprError::FilterNotObject)?.clone(),
            )),
            "$nin" => Ok(FilterExpr::Nin(
                path,
                operand.as_array().ok_or(ExprError::FilterNotObject)?.clone(),
            )),
            "$exists" => Ok(FilterExpr::Exists(path, operand.as_bool().unwrap_or(true))),
            "$regex" => {
                let pattern = operand.as_str().ok_or(ExprError::FilterNotObject)?;
                let re = Regex::new(pattern).map_err(|e| ExprError::InvalidRegex(e.to_string()))?;
                Ok(FilterExpr::Regex(path, re))
            }
            other => Err(ExprError::UnsupportedOperator(other.to_string())),
        }
    }

    /// Evaluate against a (possibly absent) post-image. `None` models a
    /// delete operation with no post-image (§4.2 rule 4).
    pub fn matches(&self, doc: Option<&Value>) -> bool {
        match self {
            FilterExpr::Always => true,
            FilterExpr::And(clauses) => clauses.iter().all(|c| c.matches(doc)),
            FilterExpr::Or(clauses) => clauses.iter().any(|c| c.matches(doc)),
            FilterExpr::Not(inner) => !inner.matches(doc),
            FilterExpr::Exists(path, want) => {
                let present = doc.and_then(|d| resolve(d, path)).is_some();
                present == *want
            }
            FilterExpr::Eq(path, v) => doc.and_then(|d| resolve(d, path)).as_ref() == Some(v),
            FilterExpr::Ne(path, v) => doc.and_then(|d| resolve(d, path)).as_ref() != Some(v),
            FilterExpr::In(path, values) => doc
                .and_then(|d| resolve(d, path))
                .map(|found| values.contains(&found))
                .unwrap_or(false),
            FilterExpr::Nin(path, values) => doc
                .and_then(|d| resolve(d, path))
                .map(|found| !values.contains(&found))
                .unwrap_or(true),
            FilterExpr::Gt(path, v) => compare(doc, path, v, |o| o == std::cmp::Ordering::Greater),
            FilterExpr::Gte(path, v) => compare(doc, path, v, |o| o != std::cmp::Ordering::Less),
            FilterExpr::Lt(path, v) => compare(doc, path, v, |o| o == std::cmp::Ordering::Less),
            FilterExpr::Lte(path, v) => compare(doc, path, v, |o| o != std::cmp::Ordering::Greater),
            FilterExpr::Regex(path, re) => doc
                .and_then(|d| resolve(d, path))
                .and_then(|v| v.as_str().map(|s| re.is_match(s)))
                .unwrap_or(false),
        }
    }

    /// True when every leaf path referenced by the filter is exactly `_id`
    /// (§4.2 rule 4: on delete, only such filters may still match).
    pub fn references_only_id(&self) -> bool {
        match self {
            FilterExpr::Always => true,
            FilterExpr::And(cs) | FilterExpr::Or(cs) => cs.iter().all(|c| c.references_only_id()),
            FilterExpr::Not(inner) => inner.references_only_id(),
            FilterExpr::Eq(p, _)
            | FilterExpr::Ne(p, _)
            | FilterExpr::In(p, _)
            | FilterExpr::Nin(p, _)
            | FilterExpr::Gt(p, _)
            | FilterExpr::Gte(p, _)
            | FilterExpr::Lt(p, _)
            | FilterExpr::Lte(p, _)
            | FilterExpr::Exists(p, _)
            | FilterExpr::Regex(p, _) => p.as_slice() == ["_id"],
        }
    }
}

fn split_path(key: &str) -> Vec<String> {
    key.split('.').map(|s| s.to_string()).collect()
}

fn resolve(doc: &Value, path: &[String]) -> Option<Value> {
    let mut current = doc;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

fn compare(doc: Option<&Value>, path: &[String], rhs: &Value, accept: impl Fn(std::cmp::Ordering) -> bool) -> bool {
    let lhs = match doc.and_then(|d| resolve(d, path)) {
        Some(v) => v,
        None => return false,
    };
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(l), Some(r)) => l.partial_cmp(&r).map(accept).unwrap_or(false),
        _ => match (lhs.as_str(), rhs.as_str()) {
            (Some(l), Some(r)) => accept(l.cmp(r)),
            _ => false,
        },
    }
}

/// Serializable form stored on `Agent.watch.filter` before parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawFilter(pub FilterDoc);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eq_matches_literal_shorthand() {
        let f = FilterExpr::parse(&serde_json::json!({"status": "open"})).unwrap();
        assert!(f.matches(Some(&serde_json::json!({"status": "open"}))));
        assert!(!f.matches(Some(&serde_json::json!({"status": "closed"}))));
    }

    #[test]
    fn and_or_not_compose() {
        let f = FilterExpr::parse(&serde_json::json!({
            "$and": [
                {"status": "open"},
                {"$or": [{"priority": {"$gt": 2}}, {"urgent": true}]}
            ]
        }))
        .unwrap();
        assert!(f.matches(Some(&serde_json::json!({"status": "open", "priority": 3}))));
        assert!(f.matches(Some(&serde_json::json!({"status": "open", "urgent": true}))));
        assert!(!f.matches(Some(&serde_json::json!({"status": "open", "priority": 1}))));
    }

    #[test]
    fn missing_post_image_fails_unless_id_only() {
        let id_filter = FilterExpr::parse(&serde_json::json!({"_id": "t1"})).unwrap();
        assert!(id_filter.references_only_id());
        assert!(!id_filter.matches(None));

        let mixed = FilterExpr::parse(&serde_json::json!({"_id": "t1", "status": "open"})).unwrap();
        assert!(!mixed.references_only_id());
    }

    #[test]
    fn exists_and_regex() {
        let f = FilterExpr::parse(&serde_json::json!({
            "email": {"$exists": true, "$regex": "^a.*@example\\.com$"}
        }))
        .unwrap();
        assert!(f.matches(Some(&serde_json::json!({"email": "alice@example.com"}))));
        assert!(!f.matches(Some(&serde_json::json!({"email": "bob@example.com"}))));
        assert!(!f.matches(Some(&serde_json::json!({}))));
    }

    #[test]
    fn rejects_unknown_operator() {
        assert!(FilterExpr::parse(&serde_json::json!({"x": {"$where": "1"}})).is_err());
    }
}
