use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("startup failure: {0}")]
    Startup(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("emit failure: {0}")]
    Emit(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether another delivery attempt could plausibly succeed.
    /// Malformed payloads and config errors will fail identically on
    /// every redelivery; connection-level failures are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            AppError::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            AppError::Emit(_) | AppError::Internal(_) => true,
            AppError::Config(_) | AppError::Startup(_) | AppError::Serialization(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_errors_are_not_retryable() {
        let err: AppError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn emit_errors_are_retryable() {
        assert!(AppError::Emit("socket gone".into()).is_retryable());
    }
}
