use thiserror::Error;

use maewchat_client::ClientError;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Required input was missing or malformed. No request was made.
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Provider(#[from] ClientError),
}

impl ChatError {
    pub fn validation(text: impl Into<String>) -> Self {
        Self::Validation(text.into())
    }
}
