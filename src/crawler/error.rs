use std::time::Duration;
use thiserror::Error;

/// Failure while fetching or reading one listing page
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("listing responded with HTTP {0}")]
    Status(u16),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("malformed listing: {0}")]
    MalformedListing(String),

    #[error("listing blocked by an anti-automation check")]
    Blocked,

    /// Not a page failure: a broken selector, an unbuildable URL and the like
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl FetchError {
    /// Whether one more attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Unexpected(_))
    }
}

/// Failure of a whole batch
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("invalid batch request: {0}")]
    Validation(String),

    #[error("a batch is already running")]
    Busy,
}
