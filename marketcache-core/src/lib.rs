//! MarketCache Core: trading calendar, freshness, Parquet series cache, batch
//! refresh, live polling, derived returns.
//!
//! This crate is the market-data engine behind any front end:
//! - Domain types (bars, series, instrument classification)
//! - US equity trading calendar with holiday observance and extended hours
//! - Per-instrument Parquet cache with atomic writes and a global version marker
//! - Fetch gateway over a pluggable provider, chunked and bounded-parallel
//! - Batch classification and refresh with phased progress events
//! - Live polling sessions and memoized daily returns

pub mod batch;
pub mod calendar;
pub mod clock;
pub mod config;
pub mod data;
pub mod domain;
pub mod freshness;
pub mod live;
pub mod progress;
pub mod resample;
pub mod returns;
pub mod service;

pub use batch::{BatchClassification, BatchOptions, BatchReport, BatchScheduler};
pub use calendar::TradingCalendar;
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{ConfigError, EngineConfig, CACHE_SCHEMA_VERSION};
pub use domain::{AssetClass, Bar, BarSeries};
pub use freshness::{FreshnessEvaluator, FreshnessVerdict};
pub use live::{spawn_command_loop, LiveBarEvent, LivePoller, PollerCommand, SessionState};
pub use progress::{NoProgress, Phase, ProgressEvent, ProgressSink, StdoutProgress};
pub use resample::{resample, Interval};
pub use returns::{ReturnsCache, ReturnsKey, ReturnsSeries};
pub use service::{MarketDataService, ServiceError};
