use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Dimension mismatch for {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Embedding error: {0}")]
    Embedding(String),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Configuration problems abort startup; everything else is recoverable per request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::DimensionMismatch { .. })
    }

    /// Wrap an embedding backend failure, keeping its context chain.
    pub fn embedding(err: anyhow::Error) -> Self {
        Self::Embedding(format!("{err:#}"))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_and_dimension_errors_are_fatal() {
        assert!(AppError::Config("missing backend".into()).is_fatal());
        assert!(AppError::DimensionMismatch {
            context: "collection text_chunks".into(),
            expected: 512,
            actual: 384,
        }
        .is_fatal());
        assert!(!AppError::Validation("bad filter".into()).is_fatal());
        assert!(!AppError::InternalError("timeout".into()).is_fatal());
    }

    #[test]
    fn embedding_errors_keep_context() {
        let err = anyhow::anyhow!("tensor shape").context("encoding patches");
        let wrapped = AppError::embedding(err);
        assert!(matches!(&wrapped, AppError::Embedding(msg) if msg == "encoding patches: tensor shape"));
        assert!(!wrapped.is_fatal());
    }
}
