use crate::error::{ExprError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Bool(bool),
    Dot,
    Comma,
    LParen,
    RParen,
    Plus,
    Minus,
    Star,
    Slash,
}

pub struct Lexer<'a> {
    chars: std::str::CharIndices<'a>,
    src: &'a str,
    peeked: Option<(usize, char)>,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            chars: src.char_indices(),
            src,
            peeked: None,
        }
    }

    fn bump(&mut self) -> Option<(usize, char)> {
        self.peeked.take().or_else(|| self.chars.next())
    }

    fn peek_char(&mut self) -> Option<(usize, char)> {
        if self.peeked.is_none() {
            self.peeked = self.chars.next();
        }
        self.peeked
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            match self.bump() {
                None => break,
                Some((_, c)) if c.is_whitespace() => continue,
                Some((_, '.')) => tokens.push(Token::Dot),
                Some((_, ',')) => tokens.push(Token::Comma),
                Some((_, '(')) => tokens.push(Token::LParen),
                Some((_, ')')) => tokens.push(Token::RParen),
                Some((_, '+')) => tokens.push(Token::Plus),
                Some((_, '-')) => tokens.push(Token::Minus),
                Some((_, '*')) => tokens.push(Token::Star),
                Some((_, '/')) => tokens.push(Token::Slash),
                Some((start, '"')) => tokens.push(Token::Str(self.read_string(start)?)),
                Some((start, c)) if c.is_ascii_digit() => tokens.push(Token::Number(self.read_number(start)?)),
                Some((start, c)) if c.is_alphabetic() || c == '_' => {
                    let ident = self.read_ident(start);
                    tokens.push(match ident.as_str() {
                        "true" => Token::Bool(true),
                        "false" => Token::Bool(false),
                        _ => Token::Ident(ident),
                    });
                }
                Some((pos, c)) => return Err(ExprError::UnexpectedChar(c, pos)),
            }
        }
        Ok(tokens)
    }

    fn read_string(&mut self, _start: usize) -> Result<String> {
        let mut out = String::new();
        loop {
            match self.bump() {
                Some((_, '"')) => return Ok(out),
                Some((_, '\\')) => match self.bump() {
                    Some((_, c)) => out.push(c),
                    None => return Err(ExprError::UnexpectedEof),
                },
                Some((_, c)) => out.push(c),
                None => return Err(ExprError::UnexpectedEof),
            }
        }
    }

    fn read_number(&mut self, start: usize) -> Result<f64> {
        let mut end = start + 1;
        while let Some((pos, c)) = self.peek_char() {
            if c.is_ascii_digit() || c == '.' {
                end = pos + c.len_utf8();
                self.bump();
            } else {
                break;
            }
        }
        self.src[start..end]
            .parse::<f64>()
            .map_err(|_| ExprError::Expected("number".to_string()))
    }

    fn read_ident(&mut self, start: usize) -> String {
        let mut end = start + 1;
        while let Some((pos, c)) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' {
                end = pos + c.len_utf8();
                self.bump();
            } else {
                break;
            }
        }
        self.src[start..end].to_string()
    }
}
