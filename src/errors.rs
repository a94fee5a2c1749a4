use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{provider} provider failed: {message}")]
    Provider {
        provider: &'static str,
        message: String,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("no signed-in user for a user-scoped write")]
    Unauthenticated,
    #[error("{0}")]
    Config(String),
}

impl AppError {
    pub fn provider(provider: &'static str, message: impl Into<String>) -> Self {
        AppError::Provider {
            provider,
            message: message.into(),
        }
    }

    /// Only transport failures, 5xx and 429 responses are retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Http(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err
                        .status()
                        .map(|status| status.is_server_error() || status.as_u16() == 429)
                        .unwrap_or(false)
            }
            _ => false,
        }
    }
}
