use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("{message}")]
    Message { message: String },

    #[error("no chat completion API key configured")]
    NoApiKey,

    #[error("chat request timed out")]
    Timeout,
}

impl Error {
    #[must_use]
    pub fn message(message: impl std::fmt::Display) -> Self {
        Self::Message { message: message.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
