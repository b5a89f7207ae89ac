use std::path::PathBuf;

use thiserror::Error;

/// Validation and contract errors exposed by `shopwire-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("provider name cannot be empty")]
    EmptyProviderName,
    #[error("provider name contains invalid character '{ch}' at index {index}")]
    ProviderNameInvalidChar { ch: char, index: usize },

    #[error("search query must not be empty")]
    EmptyQuery,
    #[error("product id must not be empty")]
    EmptyProductId,

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },

    #[error("currency must be a 3-letter uppercase ISO code: '{value}'")]
    InvalidCurrency { value: String },
    #[error("field '{field}' must be finite")]
    NonFiniteValue { field: &'static str },
    #[error("field '{field}' must be non-negative")]
    NegativeValue { field: &'static str },

    #[error("field '{field}' must be at least {min}")]
    BelowMinimum { field: &'static str, min: u64 },
    #[error("field '{field}' is not a valid fraction: {value}")]
    InvalidRatio { field: &'static str, value: String },
    #[error("invalid priority '{value}', expected one of normal, high")]
    InvalidPriority { value: String },
}

/// Top-level error type for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("configuration file not found: {}", .0.display())]
    MissingConfig(PathBuf),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<figment::Error> for CoreError {
    fn from(error: figment::Error) -> Self {
        Self::Config(Box::new(error))
    }
}
