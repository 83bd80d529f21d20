use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("bypass exhausted: direct, proxy, and archive attempts all failed for {0}")]
    BypassExhausted(String),

    #[error("content error: {0}")]
    Content(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("no search provider configured")]
    NoSearchProvider,
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Connection(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;
