//! DSL error types

/// Errors that can occur while parsing or evaluating conditions
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DslError {
    #[error("Parse error at line {line}, column {col}: {message}")]
    ParseError {
        line: usize,
        col: usize,
        message: String,
    },

    #[error("Unexpected token: expected {expected}, found '{found}'")]
    UnexpectedToken { expected: String, found: String },

    #[error("Unexpected end of input: expected {0}")]
    UnexpectedEof(String),

    #[error("Unknown context reference: '{0}'")]
    UnknownReference(String),

    #[error("Invalid DICOM tag: '{0}'")]
    InvalidTag(String),

    #[error("Cannot apply '{op}' to '{left}' and '{right}'")]
    TypeMismatch {
        op: String,
        left: String,
        right: String,
    },

    #[error("Empty expression")]
    EmptyExpression,
}

/// Result type alias for DSL operations
pub type DslResult<T> = Result<T, DslError>;
