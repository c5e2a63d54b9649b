use crate::ast::{BinOp, Expr};
use crate::error::{ExprError, Result};
use crate::lexer::{Lexer, Token};
use serde_json::Value;

/// Recursive-descent parser for the restricted expression grammar.
///
/// ```text
/// expr   := add
/// add    := mul (('+' | '-') mul)*
/// mul    := unary (('*' | '/') unary)*
/// unary  := '-' unary | primary
/// primary:= NUMBER | STRING | BOOL
///         | IDENT ('.' IDENT)*
///         | IDENT '(' (expr (',' expr)*)? ')'
///         | '(' expr ')'
/// ```
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

pub fn parse(src: &str) -> Result<Expr> {
    let tokens = Lexer::new(src).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::Expected("end of expression".to_string()));
    }
    Ok(expr)
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_add()
    }

    fn parse_add(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_mul()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.bump();
                    let rhs = self.parse_mul()?;
                    lhs = Expr::BinOp(BinOp::Add, Box::new(lhs), Box::new(rhs));
                }
                Some(Token::Minus) => {
                    self.bump();
                    let rhs = self.parse_mul()?;
                    lhs = Expr::BinOp(BinOp::Sub, Box::new(lhs), Box::new(rhs));
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.bump();
                    let rhs = self.parse_unary()?;
                    lhs = Expr::BinOp(BinOp::Mul, Box::new(lhs), Box::new(rhs));
                }
                Some(Token::Slash) => {
                    self.bump();
                    let rhs = self.parse_unary()?;
                    lhs = Expr::BinOp(BinOp::Div, Box::new(lhs), Box::new(rhs));
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.bump();
            let inner = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.bump() {
            Some(Token::Number(n)) => Ok(Expr::Literal(serde_json::json!(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Bool(b)) => Ok(Expr::Literal(Value::Bool(b))),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.bump();
                    let args = self.parse_args()?;
                    self.expect(Token::RParen)?;
                    return Ok(Expr::Call(name, args));
                }
                let mut path = vec![name];
                while matches!(self.peek(), Some(Token::Dot)) {
                    self.bump();
                    match self.bump() {
                        Some(Token::Ident(part)) => path.push(part),
                        _ => return Err(ExprError::Expected("identifier after '.'".to_string())),
                    }
                }
                Ok(Expr::Var(path))
            }
            Some(other) => Err(ExprError::Expected(format!("primary expression, found {:?}", other))),
            None => Err(ExprError::UnexpectedEof),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if matches!(self.peek(), Some(Token::RParen)) {
            return Ok(args);
        }
        args.push(self.parse_expr()?);
        while matches!(self.peek(), Some(Token::Comma)) {
            self.bump();
            args.push(self.parse_expr()?);
        }
        Ok(args)
    }

    fn expect(&mut self, tok: Token) -> Result<()> {
        match self.bump() {
            Some(t) if t == tok => Ok(()),
            Some(t) => Err(ExprError::Expected(format!("{:?}, found {:?}", tok, t))),
            None => Err(ExprError::UnexpectedEof),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dotted_path() {
        let expr = parse("document.category_hint").unwrap();
        assert_eq!(
            expr,
            Expr::Var(vec!["document".to_string(), "category_hint".to_string()])
        );
    }

    #[test]
    fn parses_call() {
        let expr = parse("default(document.x, \"n/a\")").unwrap();
        match expr {
            Expr::Call(name, args) => {
                assert_eq!(name, "default");
                assert_eq!(args.len(), 2);
            }
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn parses_arithmetic_precedence() {
        let expr = parse("1 + 2 * 3").unwrap();
        assert_eq!(
            expr,
            Expr::BinOp(
                BinOp::Add,
                Box::new(Expr::Literal(serde_json::json!(1.0))),
                Box::new(Expr::BinOp(
                    BinOp::Mul,
                    Box::new(Expr::Literal(serde_json::json!(2.0))),
                    Box::new(Expr::Literal(serde_json::json!(3.0)))
                ))
            )
        );
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(parse("document.x)").is_err());
    }
}
