use thiserror::Error;

pub type ChatvaultResult<T> = Result<T, ChatvaultError>;

#[derive(Debug, Error)]
pub enum ChatvaultError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
