use thiserror::Error;

use crate::value::ValueType;

/// Errors produced by value conversions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("no conversion registered from {from} to {to}")]
    Unsupported { from: ValueType, to: ValueType },

    #[error("cannot parse {value:?} as {to}")]
    Parse { value: String, to: ValueType },

    #[error("byte sequence is not valid UTF-8: {0}")]
    InvalidUtf8(String),

    #[error("{value} does not fit losslessly into {to}")]
    Lossy { value: String, to: ValueType },
}

/// Result alias for conversion operations.
pub type TypeResult<T> = Result<T, TypeError>;
