use thiserror::Error;

/// Everything that can go wrong while fetching one snapshot from the feed.
/// Each variant is transient from the poller's point of view: it backs off
/// and retries, nothing here ever aborts the loop.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned HTTP {0}")]
    Status(u16),
    #[error("empty response body")]
    EmptyBody,
    #[error("no candidates found in response")]
    NoCandidates,
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Log Store / State Store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("state encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// One poll cycle failed before anything durable was written.
#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Normal Trend Engine outcome when a window holds fewer than two Readings.
/// Reported, not thrown: callers show "not enough data" instead of a trend.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("fewer than two readings in the requested window")]
pub struct InsufficientData;
