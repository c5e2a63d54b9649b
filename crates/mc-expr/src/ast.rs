use serde_json::Value;

/// Tagged-variant AST for the restricted expression grammar (Design Notes §9):
/// variable lookup, dotted-path access, a fixed function set, and arithmetic.
/// No loops, no branches, no arbitrary code — deliberately inexpressive.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Dotted-path variable reference, e.g. `document.category_hint`.
    Var(Vec<String>),
    /// One of the fixed functions: `tojson`, `default`.
    Call(String, Vec<Expr>),
    BinOp(BinOp, Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}
