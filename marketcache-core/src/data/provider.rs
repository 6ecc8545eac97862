//! Data provider trait and structured fetch errors.
//!
//! The provider is an opaque fetch capability (Yahoo Finance in production, a
//! scripted mock in tests). The cache and scheduling layers sit above this
//! trait; providers don't know about the cache.

use crate::domain::Bar;
use chrono::NaiveDate;
use thiserror::Error;

/// Failure of a single provider call.
///
/// Designed to be displayable in CLI output and to let callers tell a
/// retryable network problem apart from throttling or a bad symbol.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    /// Connection failure, timeout, 5xx, or an unparseable response. Retryable.
    #[error("network error: {0}")]
    Network(String),

    /// Provider throttled us, or the circuit breaker is open.
    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    /// Provider does not know the symbol. Not retried.
    #[error("invalid instrument: {symbol}")]
    InvalidInstrument { symbol: String },

    /// Batch was cancelled before this request was scheduled.
    #[error("cancelled before the request was scheduled")]
    Cancelled,
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Network(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::RateLimited { .. })
    }
}

/// Per-symbol outcome of one chunk-level provider call, in request order.
pub type ChunkOutcome = Vec<(String, Result<Vec<Bar>, FetchError>)>;

/// Trait for market data providers.
pub trait MarketDataProvider: Send + Sync {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Daily bars for `symbol` with `start <= date <= end`. Bars may arrive
    /// unsorted or with duplicates; callers normalize through `BarSeries`.
    fn fetch_range(&self, symbol: &str, start: NaiveDate, end: NaiveDate)
        -> Result<Vec<Bar>, FetchError>;

    /// One chunk-level call covering several symbols.
    ///
    /// Providers with a native multi-symbol endpoint override this; the default
    /// issues one range request per symbol.
    fn fetch_chunk(&self, symbols: &[String], start: NaiveDate, end: NaiveDate) -> ChunkOutcome {
        symbols
            .iter()
            .map(|s| (s.clone(), self.fetch_range(s, start, end)))
            .collect()
    }

    /// Latest traded price, `None` if the provider has none.
    fn fetch_quote(&self, symbol: &str) -> Result<Option<f64>, FetchError>;

    /// Check if the provider is currently available (not rate-limited, not blocked).
    fn is_available(&self) -> bool {
        true
    }
}
