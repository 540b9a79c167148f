//! Model errors

use thiserror::Error;

/// Model construction and evaluation errors
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Component not assembled: {0}")]
    MissingComponent(&'static str),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Result type for model operations
pub type Result<T> = std::result::Result<T, ModelError>;
