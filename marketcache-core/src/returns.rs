//! Daily returns derived from cached series, memoized per instrument or
//! named portfolio until explicitly invalidated.
//!
//! A live return (current quote against the last cached close) can be appended
//! on demand while today's bar is not yet in the cache. It is never persisted.

use crate::calendar::TradingCalendar;
use crate::data::{CacheStore, FetchGateway};
use crate::domain::{normalize_symbol, AssetClass, BarSeries};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReturnsKey {
    Instrument(String),
    Portfolio(String),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ReturnsSeries {
    /// `(date, close[t] / close[t-1] - 1)`, dates ascending.
    pub points: Vec<(NaiveDate, f64)>,
    /// Last bar date of the source series when the returns were computed.
    pub source_last_date: Option<NaiveDate>,
}

impl ReturnsSeries {
    /// Simple close-to-close returns. Pairs with a non-positive prior close are skipped.
    pub fn from_series(series: &BarSeries) -> Self {
        let points = series
            .bars()
            .windows(2)
            .filter(|w| w[0].close > 0.0)
            .map(|w| (w[1].date, w[1].close / w[0].close - 1.0))
            .collect();
        Self {
            points,
            source_last_date: series.last_date(),
        }
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.points.last().map(|(d, _)| *d)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Latest date this series already accounts for, live point included.
    fn captured_through(&self) -> Option<NaiveDate> {
        self.source_last_date.max(self.last_date())
    }
}

pub struct ReturnsCache {
    cache: Arc<CacheStore>,
    gateway: Arc<FetchGateway>,
    calendar: TradingCalendar,
    memo: Mutex<HashMap<ReturnsKey, Arc<ReturnsSeries>>>,
    portfolios: Mutex<HashMap<String, Vec<(String, f64)>>>,
}

impl ReturnsCache {
    pub fn new(cache: Arc<CacheStore>, gateway: Arc<FetchGateway>, calendar: TradingCalendar) -> Self {
        Self {
            cache,
            gateway,
            calendar,
            memo: Mutex::new(HashMap::new()),
            portfolios: Mutex::new(HashMap::new()),
        }
    }

    /// Define (or redefine) a weighted portfolio of instruments.
    pub fn register_portfolio(&self, name: &str, weights: Vec<(String, f64)>) {
        let weights = weights
            .into_iter()
            .map(|(sym, w)| (normalize_symbol(&sym), w))
            .collect();
        self.portfolios
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), weights);
        self.invalidate(&ReturnsKey::Portfolio(name.to_string()));
    }

    fn portfolio(&self, name: &str) -> Option<Vec<(String, f64)>> {
        self.portfolios
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Memoized returns for `key`; `None` when there is no cached source data
    /// (or the portfolio is unknown or has zero total weight).
    pub fn get_daily_returns(&self, key: &ReturnsKey) -> Option<Arc<ReturnsSeries>> {
        if let Some(hit) = self.memo.lock().unwrap_or_else(|e| e.into_inner()).get(key) {
            return Some(Arc::clone(hit));
        }

        let computed = match key {
            ReturnsKey::Instrument(symbol) => ReturnsSeries::from_series(&self.cache.read(symbol)?),
            ReturnsKey::Portfolio(name) => self.compute_portfolio(&self.portfolio(name)?)?,
        };
        let computed = Arc::new(computed);
        self.memo
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), Arc::clone(&computed));
        Some(computed)
    }

    /// Weight-normalized sum of constituent returns on dates every constituent covers.
    fn compute_portfolio(&self, weights: &[(String, f64)]) -> Option<ReturnsSeries> {
        let total_weight: f64 = weights.iter().map(|(_, w)| w).sum();
        if weights.is_empty() || total_weight == 0.0 {
            return None;
        }

        let mut combined: BTreeMap<NaiveDate, (usize, f64)> = BTreeMap::new();
        let mut source_last_date: Option<NaiveDate> = None;
        for (symbol, weight) in weights {
            let returns = self.get_daily_returns(&ReturnsKey::Instrument(symbol.clone()))?;
            for &(date, r) in &returns.points {
                let slot = combined.entry(date).or_insert((0, 0.0));
                slot.0 += 1;
                slot.1 += r * weight / total_weight;
            }
            source_last_date = match (source_last_date, returns.source_last_date) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }

        let points = combined
            .into_iter()
            .filter(|(_, (count, _))| *count == weights.len())
            .map(|(date, (_, r))| (date, r))
            .collect();
        Some(ReturnsSeries {
            points,
            source_last_date,
        })
    }

    /// Drop the memoized series for `key`. Invalidating an instrument also
    /// drops every portfolio that holds it.
    pub fn invalidate(&self, key: &ReturnsKey) {
        let mut memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
        memo.remove(key);
        if let ReturnsKey::Instrument(symbol) = key {
            let portfolios = self.portfolios.lock().unwrap_or_else(|e| e.into_inner());
            for (name, weights) in portfolios.iter() {
                if weights.iter().any(|(s, _)| s == symbol) {
                    memo.remove(&ReturnsKey::Portfolio(name.clone()));
                }
            }
        }
    }

    pub fn invalidate_all(&self) {
        self.memo.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Gate, threshold date and live-point date for an asset class at `now`.
    fn live_window(&self, class: AssetClass, now: DateTime<Utc>) -> Option<(NaiveDate, NaiveDate)> {
        match class {
            AssetClass::Crypto => Some((now.date_naive(), now.date_naive())),
            AssetClass::Equity if self.calendar.is_extended_market_open(now) => Some((
                self.calendar.last_expected_trading_date(now),
                self.calendar.local_date(now),
            )),
            AssetClass::Equity => None,
        }
    }

    /// Append today's live return for `instrument` unless the gate is closed
    /// or `series` already accounts for the expected bar. At most one quote
    /// is fetched; a second call on the result is a no-op.
    pub fn append_live_return(&self, series: &ReturnsSeries, instrument: &str, now: DateTime<Utc>) -> ReturnsSeries {
        let instrument = normalize_symbol(instrument);
        let Some((threshold, live_date)) = self.live_window(AssetClass::of(&instrument), now) else {
            return series.clone();
        };
        if series.captured_through().is_some_and(|d| d >= threshold) {
            return series.clone();
        }

        let Some(last_close) = self.cache.read(&instrument).and_then(|s| s.last_close()) else {
            return series.clone();
        };
        let prices = self.gateway.fetch_batch_current_prices(&[instrument.as_str()]);
        let Some(price) = prices.get(&instrument) else {
            debug!(instrument = %instrument, "no live quote, returns unchanged");
            return series.clone();
        };
        if last_close <= 0.0 {
            return series.clone();
        }

        let mut out = series.clone();
        out.points.push((live_date, price / last_close - 1.0));
        out
    }

    /// Portfolio counterpart of `append_live_return`. Only constituents whose
    /// gate is open contribute, each weighted against the portfolio's total
    /// weight; the point is appended if at least one of them has a quote.
    pub fn append_live_portfolio_return(&self, series: &ReturnsSeries, name: &str, now: DateTime<Utc>) -> ReturnsSeries {
        let Some(weights) = self.portfolio(name) else {
            return series.clone();
        };
        let total_weight: f64 = weights.iter().map(|(_, w)| w).sum();
        if total_weight == 0.0 {
            return series.clone();
        }

        let equities_open = self.calendar.is_extended_market_open(now);
        let eligible: Vec<&(String, f64)> = weights
            .iter()
            .filter(|(s, _)| AssetClass::of(s).is_crypto() || equities_open)
            .collect();
        if eligible.is_empty() {
            return series.clone();
        }
        let class = if eligible.iter().all(|(s, _)| AssetClass::of(s).is_crypto()) {
            AssetClass::Crypto
        } else {
            AssetClass::Equity
        };
        let Some((threshold, live_date)) = self.live_window(class, now) else {
            return series.clone();
        };
        if series.captured_through().is_some_and(|d| d >= threshold) {
            return series.clone();
        }

        let symbols: Vec<&str> = eligible.iter().map(|(s, _)| s.as_str()).collect();
        let prices = self.gateway.fetch_batch_current_prices(&symbols);
        let mut live = 0.0;
        let mut contributed = 0usize;
        for (symbol, weight) in eligible {
            let last_close = self.cache.read(symbol).and_then(|s| s.last_close());
            if let (Some(price), Some(close)) = (prices.get(symbol), last_close) {
                if close > 0.0 {
                    live += (price / close - 1.0) * weight / total_weight;
                    contributed += 1;
                }
            }
        }
        if contributed == 0 {
            return series.clone();
        }

        let mut out = series.clone();
        out.points.push((live_date, live));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::EngineConfig;
    use crate::data::{FetchError, MarketDataProvider};
    use crate::domain::Bar;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct QuoteProvider {
        quotes: AtomicUsize,
    }

    impl MarketDataProvider for QuoteProvider {
        fn name(&self) -> &str {
            "quotes"
        }

        fn fetch_range(&self, _symbol: &str, _start: NaiveDate, _end: NaiveDate) -> Result<Vec<Bar>, FetchError> {
            Ok(Vec::new())
        }

        fn fetch_quote(&self, _symbol: &str) -> Result<Option<f64>, FetchError> {
            self.quotes.fetch_add(1, Ordering::SeqCst);
            Ok(Some(110.0))
        }
    }

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, m, day).unwrap()
    }

    fn series(closes: &[(NaiveDate, f64)]) -> BarSeries {
        BarSeries::from_bars(
            closes
                .iter()
                .map(|&(date, close)| Bar {
                    date,
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: 1,
                })
                .collect(),
        )
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        cache: Arc<CacheStore>,
        provider: Arc<QuoteProvider>,
        returns: ReturnsCache,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(CacheStore::new(dir.path()));
        let provider = Arc::new(QuoteProvider {
            quotes: AtomicUsize::new(0),
        });
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let gateway = Arc::new(FetchGateway::new(provider.clone(), clock, &EngineConfig::default()).unwrap());
        let returns = ReturnsCache::new(cache.clone(), gateway, TradingCalendar::default());
        Fixture {
            _dir: dir,
            cache,
            provider,
            returns,
        }
    }

    // Tuesday 2026-03-10 11:00 ET: extended hours open, last expected date 03-09.
    fn tuesday_morning() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 15, 0, 0).unwrap()
    }

    #[test]
    fn simple_returns_from_closes() {
        let fx = fixture();
        fx.cache.write("SPY", &series(&[(d(3, 5), 100.0), (d(3, 6), 110.0), (d(3, 9), 99.0)]));
        let r = fx.returns.get_daily_returns(&ReturnsKey::Instrument("SPY".into())).unwrap();
        assert_eq!(r.len(), 2);
        assert!((r.points[0].1 - 0.10).abs() < 1e-12);
        assert!((r.points[1].1 + 0.10).abs() < 1e-12);
        assert_eq!(r.source_last_date, Some(d(3, 9)));
    }

    #[test]
    fn memoized_until_invalidated() {
        let fx = fixture();
        let key = ReturnsKey::Instrument("SPY".into());
        fx.cache.write("SPY", &series(&[(d(3, 5), 100.0), (d(3, 6), 110.0)]));
        let first = fx.returns.get_daily_returns(&key).unwrap();

        fx.cache.write("SPY", &series(&[(d(3, 5), 100.0), (d(3, 6), 120.0)]));
        assert!(Arc::ptr_eq(&first, &fx.returns.get_daily_returns(&key).unwrap()));

        fx.returns.invalidate(&key);
        let fresh = fx.returns.get_daily_returns(&key).unwrap();
        assert!((fresh.points[0].1 - 0.20).abs() < 1e-12);
    }

    #[test]
    fn portfolio_uses_common_dates_and_normalized_weights() {
        let fx = fixture();
        fx.cache.write("AAA", &series(&[(d(3, 4), 100.0), (d(3, 5), 110.0), (d(3, 6), 121.0)]));
        fx.cache.write("BBB", &series(&[(d(3, 5), 50.0), (d(3, 6), 45.0)]));
        fx.returns
            .register_portfolio("mix", vec![("aaa".into(), 3.0), ("BBB".into(), 1.0)]);

        let r = fx.returns.get_daily_returns(&ReturnsKey::Portfolio("mix".into())).unwrap();
        assert_eq!(r.points.len(), 1);
        assert_eq!(r.points[0].0, d(3, 6));
        // 0.75 * 10% + 0.25 * -10%
        assert!((r.points[0].1 - 0.05).abs() < 1e-12);
        assert!(fx.returns.get_daily_returns(&ReturnsKey::Portfolio("nope".into())).is_none());
    }

    #[test]
    fn live_return_appended_once() {
        let fx = fixture();
        fx.cache.write("SPY", &series(&[(d(3, 5), 100.0), (d(3, 6), 100.0)]));
        let base = fx.returns.get_daily_returns(&ReturnsKey::Instrument("SPY".into())).unwrap();

        let live = fx.returns.append_live_return(&base, "SPY", tuesday_morning());
        assert_eq!(live.len(), base.len() + 1);
        assert_eq!(live.last_date(), Some(d(3, 10)));
        assert!((live.points.last().unwrap().1 - 0.10).abs() < 1e-12);

        let again = fx.returns.append_live_return(&live, "SPY", tuesday_morning());
        assert_eq!(again, live);
        assert_eq!(fx.provider.quotes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn live_return_noop_when_expected_bar_cached() {
        let fx = fixture();
        fx.cache.write("SPY", &series(&[(d(3, 6), 100.0), (d(3, 9), 100.0)]));
        let base = fx.returns.get_daily_returns(&ReturnsKey::Instrument("SPY".into())).unwrap();
        let out = fx.returns.append_live_return(&base, "SPY", tuesday_morning());
        assert_eq!(out, *base);
        assert_eq!(fx.provider.quotes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn live_return_noop_for_equity_outside_hours() {
        let fx = fixture();
        fx.cache.write("SPY", &series(&[(d(3, 5), 100.0), (d(3, 6), 100.0)]));
        let base = fx.returns.get_daily_returns(&ReturnsKey::Instrument("SPY".into())).unwrap();
        // Tuesday 2026-03-10 22:00 ET.
        let late = Utc.with_ymd_and_hms(2026, 3, 11, 2, 0, 0).unwrap();
        assert_eq!(fx.returns.append_live_return(&base, "SPY", late), *base);
    }

    #[test]
    fn crypto_live_return_dated_utc_today() {
        let fx = fixture();
        fx.cache.write("BTC-USD", &series(&[(d(3, 8), 100.0), (d(3, 9), 100.0)]));
        let base = fx.returns.get_daily_returns(&ReturnsKey::Instrument("BTC-USD".into())).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 1, 0, 0).unwrap();
        let live = fx.returns.append_live_return(&base, "BTC-USD", now);
        assert_eq!(live.last_date(), Some(d(3, 10)));
    }

    #[test]
    fn portfolio_live_return_uses_only_open_constituents() {
        let fx = fixture();
        fx.cache.write("SPY", &series(&[(d(3, 9), 100.0), (d(3, 10), 100.0)]));
        fx.cache.write("BTC-USD", &series(&[(d(3, 9), 100.0), (d(3, 10), 100.0)]));
        fx.returns.register_portfolio(
            "mixed",
            vec![("SPY".into(), 1.0), ("BTC-USD".into(), 1.0)],
        );
        let key = ReturnsKey::Portfolio("mixed".into());
        let base = fx.returns.get_daily_returns(&key).unwrap();

        // Wednesday 2026-03-11 02:00 UTC: equities closed, crypto trades.
        let night = Utc.with_ymd_and_hms(2026, 3, 11, 2, 0, 0).unwrap();
        let live = fx.returns.append_live_portfolio_return(&base, "mixed", night);
        assert_eq!(live.last_date(), Some(d(3, 11)));
        // Only BTC contributes: half weight of a 10% move.
        assert!((live.points.last().unwrap().1 - 0.05).abs() < 1e-12);
    }
}
