//! Public entry points for front ends.
//!
//! `MarketDataService` wires the calendar, cache, gateway, batch scheduler,
//! live poller and returns cache together around one injected configuration,
//! provider and clock. Construct it once and share it.

use crate::batch::{BatchClassification, BatchOptions, BatchReport, BatchScheduler};
use crate::calendar::TradingCalendar;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::data::{
    CacheStatus, CacheStore, CancelToken, CircuitBreaker, FetchError, FetchGateway, FetchTickets,
    MarketDataProvider, YahooProvider,
};
use crate::domain::{normalize_symbol, BarSeries};
use crate::freshness::{FreshnessEvaluator, FreshnessVerdict};
use crate::live::LivePoller;
use crate::progress::ProgressSink;
use crate::resample::{resample, Interval};
use crate::returns::{ReturnsCache, ReturnsKey, ReturnsSeries};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Provider unreachable and nothing cached to fall back on.
    #[error("no data available for {instrument}: {source}")]
    Unavailable {
        instrument: String,
        #[source]
        source: FetchError,
    },

    #[error("invalid instrument: {0}")]
    InvalidInstrument(String),

    #[error("engine startup failed: {0}")]
    Startup(String),
}

pub struct MarketDataService {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    freshness: FreshnessEvaluator,
    cache: Arc<CacheStore>,
    gateway: Arc<FetchGateway>,
    tickets: Arc<FetchTickets>,
    batch: BatchScheduler,
    poller: Arc<LivePoller>,
    returns: Arc<ReturnsCache>,
}

impl MarketDataService {
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn MarketDataProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ServiceError> {
        config
            .validate()
            .map_err(|e| ServiceError::Startup(e.to_string()))?;

        let calendar = TradingCalendar::from_config(&config);
        let freshness = FreshnessEvaluator::new(calendar);
        let cache = Arc::new(CacheStore::new(config.cache_root.clone()));
        if cache.invalidate_if_version_changed() {
            info!(root = %config.cache_root.display(), "cache discarded after version change");
        }

        let gateway = Arc::new(
            FetchGateway::new(provider, Arc::clone(&clock), &config)
                .map_err(|e| ServiceError::Startup(format!("fetch pool: {e}")))?,
        );
        let tickets = Arc::new(FetchTickets::new());
        let batch = BatchScheduler::new(
            Arc::clone(&cache),
            Arc::clone(&gateway),
            Arc::clone(&tickets),
            freshness,
            Arc::clone(&clock),
        );
        let returns = Arc::new(ReturnsCache::new(Arc::clone(&cache), Arc::clone(&gateway), calendar));
        let poller = Arc::new(LivePoller::new(
            Arc::clone(&cache),
            Arc::clone(&gateway),
            Arc::clone(&tickets),
            calendar,
            Arc::clone(&clock),
            config.poll_interval(),
        ));
        poller.set_returns_cache(Arc::clone(&returns));

        Ok(Self {
            config,
            clock,
            freshness,
            cache,
            gateway,
            tickets,
            batch,
            poller,
            returns,
        })
    }

    /// Service backed by Yahoo Finance and the system clock.
    pub fn with_yahoo(config: EngineConfig) -> Result<Self, ServiceError> {
        let breaker = Arc::new(CircuitBreaker::default_provider());
        let provider = YahooProvider::new(breaker, &config).map_err(|e| ServiceError::Startup(e.to_string()))?;
        Self::new(config, Arc::new(provider), Arc::new(SystemClock))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn calendar(&self) -> &TradingCalendar {
        self.freshness.calendar()
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn gateway(&self) -> &FetchGateway {
        &self.gateway
    }

    /// Single-instrument fetch-with-cache.
    ///
    /// Current cache is returned as is; a stale series is topped up from its
    /// last date and merged; an uncached instrument gets its full history.
    /// When the provider fails, a stale cached copy is served instead.
    pub fn fetch_history(&self, instrument: &str) -> Result<BarSeries, ServiceError> {
        let symbol = normalize_symbol(instrument);
        let ticket = self.tickets.ticket(&symbol);
        let _held = ticket.hold();

        let now = self.clock.now();
        let cached = self.cache.read(&symbol);
        if self.freshness.is_current(&symbol, cached.as_ref(), now) {
            debug!(symbol = %symbol, "serving current cache");
            return cached.ok_or_else(|| ServiceError::InvalidInstrument(symbol.clone()));
        }

        let today = now.date_naive();
        let fetched = match cached.as_ref().and_then(|s| s.last_date().map(|d| (s, d))) {
            Some((series, last)) => self.gateway.fetch_range(&symbol, last, today).map(|new| {
                if new.is_empty() {
                    series.clone()
                } else {
                    self.cache.merge(&symbol, new.into_bars())
                }
            }),
            None => self.gateway.fetch_full_history(&symbol).and_then(|series| {
                if series.is_empty() {
                    return Err(FetchError::Network(format!("provider returned no bars for {symbol}")));
                }
                self.cache.write(&symbol, &series);
                Ok(series)
            }),
        };

        match fetched {
            Ok(series) => {
                self.returns.invalidate(&ReturnsKey::Instrument(symbol));
                Ok(series)
            }
            Err(FetchError::InvalidInstrument { .. }) => Err(ServiceError::InvalidInstrument(symbol)),
            Err(e) => match cached {
                Some(stale) => {
                    warn!(
                        symbol = %symbol,
                        error = %e,
                        retryable = e.is_retryable() || e.is_rate_limited(),
                        "provider failed, serving stale cache"
                    );
                    Ok(stale)
                }
                None => Err(ServiceError::Unavailable {
                    instrument: symbol,
                    source: e,
                }),
            },
        }
    }

    /// Batch fetch-with-cache. Failed instruments are reported, not raised.
    pub fn fetch_history_batch<S: AsRef<str>>(
        &self,
        instruments: &[S],
        progress: &dyn ProgressSink,
        cancel: Option<&CancelToken>,
        options: BatchOptions,
    ) -> BatchReport {
        let report = self.batch.fetch_history_batch(instruments, progress, cancel, options);
        for symbol in report.series.keys() {
            self.returns.invalidate(&ReturnsKey::Instrument(symbol.clone()));
        }
        report
    }

    pub fn classify<S: AsRef<str>>(&self, instruments: &[S], progress: &dyn ProgressSink) -> BatchClassification {
        self.batch.classify(instruments, progress)
    }

    pub fn has_cache(&self, instrument: &str) -> bool {
        self.cache.has(&normalize_symbol(instrument))
    }

    pub fn is_cache_current(&self, instrument: &str) -> bool {
        self.freshness_of(instrument).is_current
    }

    pub fn freshness_of(&self, instrument: &str) -> FreshnessVerdict {
        let symbol = normalize_symbol(instrument);
        let cached = self.cache.read(&symbol);
        self.freshness.evaluate(&symbol, cached.as_ref(), self.clock.now())
    }

    pub fn get_cached_data(&self, instrument: &str) -> Option<BarSeries> {
        self.cache.read(&normalize_symbol(instrument))
    }

    /// Cached series rolled up to `interval`.
    pub fn get_cached_resampled(&self, instrument: &str, interval: Interval) -> Option<BarSeries> {
        self.get_cached_data(instrument).map(|s| resample(&s, interval))
    }

    pub fn cache_status<S: AsRef<str>>(&self, instruments: &[S]) -> Vec<CacheStatus> {
        let symbols: Vec<String> = instruments.iter().map(|s| normalize_symbol(s.as_ref())).collect();
        let refs: Vec<&str> = symbols.iter().map(String::as_str).collect();
        self.cache.status(&refs)
    }

    pub fn cached_instruments(&self) -> Vec<String> {
        self.cache.cached_instruments()
    }

    /// Remove one instrument's cached series, or all of them.
    pub fn clear_cache(&self, instrument: Option<&str>) {
        match instrument {
            Some(sym) => {
                let symbol = normalize_symbol(sym);
                self.cache.clear(Some(&symbol));
                self.returns.invalidate(&ReturnsKey::Instrument(symbol));
            }
            None => {
                self.cache.clear(None);
                self.returns.invalidate_all();
            }
        }
    }

    pub fn register_portfolio(&self, name: &str, weights: Vec<(String, f64)>) {
        self.returns.register_portfolio(name, weights);
    }

    /// Daily returns for `key`, optionally with today's live return appended.
    pub fn daily_returns(&self, key: &ReturnsKey, with_live: bool) -> Option<ReturnsSeries> {
        let series = self.returns.get_daily_returns(key)?;
        if !with_live {
            return Some((*series).clone());
        }
        let now = self.clock.now();
        Some(match key {
            ReturnsKey::Instrument(symbol) => self.returns.append_live_return(&series, symbol, now),
            ReturnsKey::Portfolio(name) => self.returns.append_live_portfolio_return(&series, name, now),
        })
    }

    pub fn returns(&self) -> &ReturnsCache {
        &self.returns
    }

    pub fn live_poller(&self) -> Arc<LivePoller> {
        Arc::clone(&self.poller)
    }
}
