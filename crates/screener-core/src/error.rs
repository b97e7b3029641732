use thiserror::Error;

/// Reasons `QuoteSource::authenticate` can fail.
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    #[error("bad credential")]
    BadCredential,
    #[error("credential expired")]
    Expired,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Reasons `QuoteSource::fetch_bars` can fail.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("transient network error: {0}")]
    NetworkTransient(String),
    #[error("permanent network error: {0}")]
    NetworkPermanent(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
}

impl FetchError {
    /// `true` for the two kinds the caller layer retries (§4.2, §7).
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::NetworkTransient(_) | FetchError::RateLimited(_))
    }
}

/// Top-level error kinds surfaced across the pipeline (§7).
#[derive(Error, Debug, Clone)]
pub enum ScreenerError {
    #[error("auth failed: {0}")]
    Auth(#[from] AuthError),

    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("cache decode error: {0}")]
    CacheDecodeError(String),

    #[error("cache write error: {0}")]
    CacheWriteError(String),

    #[error("sink summary error: {0}")]
    SinkSummaryError(String),

    #[error("sink detection error: {0}")]
    SinkDetectionError(String),

    #[error("invalid config: {0}")]
    Config(String),
}
