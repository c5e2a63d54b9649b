use crate::ast::Expr;
use crate::context::Context;
use crate::error::{ExprError, Result};
use crate::eval::{eval, stringify};
use crate::parser::parse;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Text(String),
    Expr(Expr),
}

/// A parsed prompt / idempotency-key template: literal text interleaved with
/// `{{ expr }}` interpolations, each parsed eagerly so a malformed template is
/// caught at agent-creation time (`configuration_error`, §7) rather than at
/// render time deep in the worker pipeline.
#[derive(Debug, Clone)]
pub struct Template {
    parts: Vec<Part>,
    source: String,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self> {
        let mut parts = Vec::new();
        let mut rest = source;
        loop {
            match rest.find("{{") {
                None => {
                    if !rest.is_empty() {
                        parts.push(Part::Text(rest.to_string()));
                    }
                    break;
                }
                Some(start) => {
                    if start > 0 {
                        parts.push(Part::Text(rest[..start].to_string()));
                    }
                    let after_open = &rest[start + 2..];
                    let end = after_open.find("}}").ok_or(ExprError::UnbalancedDelimiters)?;
                    let expr_src = after_open[..end].trim();
                    let expr = parse(expr_src)?;
                    parts.push(Part::Expr(expr));
                    rest = &after_open[end + 2..];
                }
            }
        }
        Ok(Self {
            parts,
            source: source.to_string(),
        })
    }

    pub fn render(&self, ctx: &Context) -> Result<String> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Text(t) => out.push_str(t),
                Part::Expr(e) => out.push_str(&stringify(&eval(e, ctx)?)),
            }
        }
        Ok(out)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl PartialEq for Template {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Serialize for Template {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Template {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Template::parse(&s).map_err(serde::de::Error::custom)
    }
}
