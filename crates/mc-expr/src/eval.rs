use crate::ast::{BinOp, Expr};
use crate::context::Context;
use crate::error::{ExprError, Result};
use serde_json::Value;

pub fn eval(expr: &Expr, ctx: &Context) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(path) => Ok(ctx.resolve(path)),
        Expr::Neg(inner) => {
            let n = as_f64(&eval(inner, ctx)?)?;
            Ok(serde_json::json!(-n))
        }
        Expr::BinOp(op, lhs, rhs) => {
            let l = as_f64(&eval(lhs, ctx)?)?;
            let r = as_f64(&eval(rhs, ctx)?)?;
            let result = match op {
                BinOp::Add => l + r,
                BinOp::Sub => l - r,
                BinOp::Mul => l * r,
                BinOp::Div => l / r,
            };
            Ok(serde_json::json!(result))
        }
        Expr::Call(name, args) => eval_call(name, args, ctx),
    }
}

fn eval_call(name: &str, args: &[Expr], ctx: &Context) -> Result<Value> {
    match name {
        "tojson" => {
            if args.len() != 1 {
                return Err(ExprError::ArgCount("tojson".to_string(), 1, args.len()));
            }
            let v = eval(&args[0], ctx)?;
            Ok(Value::String(serde_json::to_string(&v).unwrap_or_default()))
        }
        "default" => {
            if args.len() != 2 {
                return Err(ExprError::ArgCount("default".to_string(), 2, args.len()));
            }
            let v = eval(&args[0], ctx)?;
            if v.is_null() {
                eval(&args[1], ctx)
            } else {
                Ok(v)
            }
        }
        other => Err(ExprError::UnknownFunction(other.to_string())),
    }
}

fn as_f64(v: &Value) -> Result<f64> {
    v.as_f64().ok_or(ExprError::NonNumeric)
}

/// Render a resolved `Value` as it should appear interpolated into prompt
/// text: strings pass through raw, everything else becomes compact JSON.
pub fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use chrono::Utc;

    fn ctx() -> Context {
        Context::new(
            serde_json::json!({"category_hint": "billing", "amount": 12}),
            serde_json::json!({"id": "classify", "revision": 3}),
            "insert",
            Utc::now(),
        )
    }

    #[test]
    fn resolves_dotted_path() {
        let e = parse("document.category_hint").unwrap();
        assert_eq!(eval(&e, &ctx()).unwrap(), serde_json::json!("billing"));
    }

    #[test]
    fn default_falls_back_on_missing() {
        let e = parse("default(document.missing, \"n/a\")").unwrap();
        assert_eq!(eval(&e, &ctx()).unwrap(), serde_json::json!("n/a"));
    }

    #[test]
    fn default_keeps_present_value() {
        let e = parse("default(document.category_hint, \"n/a\")").unwrap();
        assert_eq!(eval(&e, &ctx()).unwrap(), serde_json::json!("billing"));
    }

    #[test]
    fn arithmetic_on_numbers() {
        let e = parse("document.amount * 2 + 1").unwrap();
        assert_eq!(eval(&e, &ctx()).unwrap(), serde_json::json!(25.0));
    }

    #[test]
    fn arithmetic_on_non_numeric_errors() {
        let e = parse("document.category_hint + 1").unwrap();
        assert!(eval(&e, &ctx()).is_err());
    }

    #[test]
    fn tojson_serializes_document() {
        let e = parse("tojson(document)").unwrap();
        let rendered = eval(&e, &ctx()).unwrap();
        assert!(rendered.as_str().unwrap().contains("billing"));
    }
}
