#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ExprError {
    #[error("unexpected character '{0}' at position {1}")]
    UnexpectedChar(char, usize),

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("expected {0}")]
    Expected(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("wrong argument count for '{0}': expected {1}, got {2}")]
    ArgCount(String, usize, usize),

    #[error("unbalanced template delimiters")]
    UnbalancedDelimiters,

    #[error("arithmetic on non-numeric value")]
    NonNumeric,

    #[error("unsupported filter operator '{0}'")]
    UnsupportedOperator(String),

    #[error("invalid regex pattern: {0}")]
    InvalidRegex(String),

    #[error("filter must be a JSON object")]
    FilterNotObject,
}

pub type Result<T> = std::result::Result<T, ExprError>;
