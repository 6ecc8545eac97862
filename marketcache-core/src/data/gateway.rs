//! Fetch gateway: every provider call the engine makes goes through here.
//!
//! Batch operations split instruments into chunks of `chunk_size` and run at
//! most `max_parallel_chunks` chunk calls at once on a private rayon pool.
//! Failures are per instrument; a batch never fails as a whole.

use super::provider::{ChunkOutcome, FetchError, MarketDataProvider};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::domain::{normalize_symbol, normalize_symbols, Bar, BarSeries};
use crate::progress::{Phase, ProgressEvent, ProgressSink};
use chrono::{Duration, NaiveDate};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cooperative cancellation flag shared with the caller.
pub type CancelToken = Arc<AtomicBool>;

/// Result of a batch full-history fetch.
///
/// Every unique input instrument appears in exactly one of `results` or
/// `failed`; `errors` carries the reason for each failed one.
#[derive(Debug, Default)]
pub struct BatchFetchOutcome {
    pub results: HashMap<String, BarSeries>,
    pub failed: BTreeSet<String>,
    pub errors: HashMap<String, FetchError>,
}

impl BatchFetchOutcome {
    fn record(&mut self, symbol: String, outcome: Result<BarSeries, FetchError>) {
        match outcome {
            Ok(series) => {
                self.results.insert(symbol, series);
            }
            Err(e) => {
                self.failed.insert(symbol.clone());
                self.errors.insert(symbol, e);
            }
        }
    }
}

pub struct FetchGateway {
    provider: Arc<dyn MarketDataProvider>,
    clock: Arc<dyn Clock>,
    backfill_epoch: NaiveDate,
    chunk_size: usize,
    today_window_days: i64,
    pool: rayon::ThreadPool,
}

impl FetchGateway {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_parallel_chunks.max(1))
            .thread_name(|i| format!("marketcache-fetch-{i}"))
            .build()?;
        Ok(Self {
            provider,
            clock,
            backfill_epoch: config.backfill_epoch,
            chunk_size: config.chunk_size.max(1),
            today_window_days: config.today_window_days.max(1),
            pool,
        })
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_available()
    }

    fn today(&self) -> NaiveDate {
        self.clock.now().date_naive()
    }

    /// Bars with `start <= date <= end`, sorted and de-duplicated.
    pub fn fetch_range(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<BarSeries, FetchError> {
        if start > end {
            return Ok(BarSeries::new());
        }
        let bars = self.provider.fetch_range(symbol, start, end)?;
        Ok(clean_bars(symbol, bars, start, end))
    }

    /// Everything from the backfill epoch through today.
    pub fn fetch_full_history(&self, symbol: &str) -> Result<BarSeries, FetchError> {
        self.fetch_range(symbol, self.backfill_epoch, self.today())
    }

    /// Full history that absorbs rate limiting: a throttled fetch yields an
    /// empty series and `true`. Other failures still propagate.
    pub fn fetch_full_history_safe(&self, symbol: &str) -> Result<(BarSeries, bool), FetchError> {
        match self.fetch_full_history(symbol) {
            Ok(series) => Ok((series, false)),
            Err(e) if e.is_rate_limited() => {
                warn!(symbol, error = %e, "full history fetch rate limited");
                Ok((BarSeries::new(), true))
            }
            Err(e) => Err(e),
        }
    }

    /// Most recent bar in a short trailing window, or `None` if the provider
    /// produced nothing.
    pub fn fetch_today_bar(&self, symbol: &str) -> Result<Option<Bar>, FetchError> {
        let today = self.today();
        let start = today - Duration::days(self.today_window_days);
        Ok(self.fetch_range(symbol, start, today)?.last().copied())
    }

    /// Full history for many instruments.
    ///
    /// Inputs are normalized and de-duplicated. Chunks run on the gateway pool;
    /// once `cancel` is set, chunks that have not started are skipped and their
    /// instruments fail with `FetchError::Cancelled`. Progress is reported in
    /// input order as completed chunks become contiguous.
    pub fn fetch_batch_full_history<S: AsRef<str>>(
        &self,
        symbols: &[S],
        progress: &dyn ProgressSink,
        cancel: Option<&CancelToken>,
    ) -> BatchFetchOutcome {
        let unique = normalize_symbols(symbols);
        let total = unique.len();
        let mut outcome = BatchFetchOutcome::default();
        if total == 0 {
            return outcome;
        }

        let start = self.backfill_epoch;
        let end = self.today();
        let chunks: Vec<Vec<String>> = unique.chunks(self.chunk_size).map(<[String]>::to_vec).collect();
        let chunk_count = chunks.len();
        debug!(total, chunk_count, chunk_size = self.chunk_size, "scheduling batch fetch");

        let (tx, rx) = mpsc::channel::<(usize, Vec<String>, ChunkOutcome)>();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let tx = tx.clone();
            let provider = Arc::clone(&self.provider);
            let cancel = cancel.cloned();
            self.pool.spawn(move || {
                let result = if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                    chunk.iter().map(|s| (s.clone(), Err(FetchError::Cancelled))).collect()
                } else {
                    debug!(chunk = index, size = chunk.len(), "fetching chunk");
                    provider.fetch_chunk(&chunk, start, end)
                };
                let _ = tx.send((index, chunk, result));
            });
        }
        drop(tx);

        let mut pending: BTreeMap<usize, (Vec<String>, ChunkOutcome)> = BTreeMap::new();
        let mut next = 0usize;
        let mut completed = 0usize;
        while next < chunk_count {
            match rx.recv() {
                Ok((index, chunk, result)) => {
                    pending.insert(index, (chunk, result));
                }
                Err(_) => break,
            }
            while let Some((chunk, result)) = pending.remove(&next) {
                for (symbol, symbol_outcome) in resolve_chunk(&chunk, result, start, end) {
                    completed += 1;
                    progress.report(ProgressEvent {
                        completed,
                        total,
                        instrument: symbol.clone(),
                        phase: Phase::Provider,
                    });
                    outcome.record(symbol, symbol_outcome);
                }
                next += 1;
            }
        }

        // Only reachable if a worker died without reporting.
        for symbol in unique {
            if !outcome.results.contains_key(&symbol) && !outcome.failed.contains(&symbol) {
                outcome.record(symbol, Err(FetchError::Network("fetch worker lost".into())));
            }
        }

        info!(
            total,
            fetched = outcome.results.len(),
            failed = outcome.failed.len(),
            "batch fetch complete"
        );
        outcome
    }

    /// Fetch per-instrument ranges, grouping instruments that share a range
    /// into chunk calls. Failed instruments are omitted.
    pub fn fetch_batch_date_range(&self, ranges: &HashMap<String, (NaiveDate, NaiveDate)>) -> HashMap<String, BarSeries> {
        let mut groups: BTreeMap<(NaiveDate, NaiveDate), Vec<String>> = BTreeMap::new();
        for (symbol, &(start, end)) in ranges {
            if start <= end {
                groups.entry((start, end)).or_default().push(normalize_symbol(symbol));
            }
        }

        let jobs: Vec<((NaiveDate, NaiveDate), Vec<String>)> = groups
            .into_iter()
            .flat_map(|(range, mut symbols)| {
                symbols.sort();
                symbols.dedup();
                symbols
                    .chunks(self.chunk_size)
                    .map(|c| (range, c.to_vec()))
                    .collect::<Vec<_>>()
            })
            .collect();

        let provider = &self.provider;
        let resolved: Vec<Vec<(String, Result<BarSeries, FetchError>)>> = self.pool.install(|| {
            jobs.par_iter()
                .map(|((start, end), chunk)| {
                    resolve_chunk(chunk, provider.fetch_chunk(chunk, *start, *end), *start, *end)
                })
                .collect()
        });

        resolved
            .into_iter()
            .flatten()
            .filter_map(|(symbol, outcome)| match outcome {
                Ok(series) => Some((symbol, series)),
                Err(e) => {
                    debug!(symbol = %symbol, error = %e, "range fetch failed");
                    None
                }
            })
            .collect()
    }

    /// Latest price per instrument; instruments without a quote are omitted.
    pub fn fetch_batch_current_prices<S: AsRef<str>>(&self, symbols: &[S]) -> HashMap<String, f64> {
        let unique = normalize_symbols(symbols);
        let provider = &self.provider;
        self.pool.install(|| {
            unique
                .par_iter()
                .filter_map(|symbol| match provider.fetch_quote(symbol) {
                    Ok(Some(price)) if price.is_finite() && price >= 0.0 => Some((symbol.clone(), price)),
                    Ok(_) => None,
                    Err(e) => {
                        debug!(symbol = %symbol, error = %e, "quote fetch failed");
                        None
                    }
                })
                .collect()
        })
    }

    /// Whether the provider knows the instrument and has recent data for it.
    pub fn validate_instrument(&self, symbol: &str) -> bool {
        match self.fetch_today_bar(&normalize_symbol(symbol)) {
            Ok(bar) => bar.is_some(),
            Err(FetchError::InvalidInstrument { .. }) => false,
            Err(e) => {
                warn!(symbol, error = %e, "could not validate instrument");
                false
            }
        }
    }
}

/// Normalize raw provider bars into a series restricted to `[start, end]`.
fn clean_bars(symbol: &str, bars: Vec<Bar>, start: NaiveDate, end: NaiveDate) -> BarSeries {
    let received = bars.len();
    let kept: Vec<Bar> = bars
        .into_iter()
        .filter(|b| b.date >= start && b.date <= end && b.is_sane())
        .collect();
    if kept.len() < received {
        debug!(symbol, dropped = received - kept.len(), "discarded out-of-range or malformed bars");
    }
    BarSeries::from_bars(kept)
}

/// Map a chunk response back onto the requested symbols, in request order.
/// Missing symbols and empty histories become failures.
fn resolve_chunk(
    requested: &[String],
    outcome: ChunkOutcome,
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<(String, Result<BarSeries, FetchError>)> {
    let mut by_symbol: HashMap<String, Result<Vec<Bar>, FetchError>> = outcome.into_iter().collect();
    requested
        .iter()
        .map(|symbol| {
            let result = match by_symbol.remove(symbol) {
                Some(Ok(bars)) => {
                    let series = clean_bars(symbol, bars, start, end);
                    if series.is_empty() {
                        Err(FetchError::Network(format!("no bars returned for {symbol}")))
                    } else {
                        Ok(series)
                    }
                }
                Some(Err(e)) => Err(e),
                None => Err(FetchError::Network(format!("{symbol} missing from chunk response"))),
            };
            (symbol.clone(), result)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::progress::NoProgress;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;

    struct ScriptedProvider {
        chunk_calls: AtomicUsize,
    }

    impl MarketDataProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn fetch_range(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>, FetchError> {
            if symbol.starts_with("BAD") {
                return Err(FetchError::InvalidInstrument {
                    symbol: symbol.to_string(),
                });
            }
            // Newest first, with a duplicate and one bar outside the window.
            let mut bars = vec![bar(end), bar(end), bar(end - Duration::days(1))];
            bars.push(bar(start - Duration::days(1)));
            Ok(bars)
        }

        fn fetch_chunk(&self, symbols: &[String], start: NaiveDate, end: NaiveDate) -> ChunkOutcome {
            self.chunk_calls.fetch_add(1, Ordering::SeqCst);
            symbols
                .iter()
                .map(|s| (s.clone(), self.fetch_range(s, start, end)))
                .collect()
        }

        fn fetch_quote(&self, symbol: &str) -> Result<Option<f64>, FetchError> {
            Ok((symbol != "NOQUOTE").then_some(123.0))
        }
    }

    fn bar(date: NaiveDate) -> Bar {
        Bar {
            date,
            open: 10.0,
            high: 11.0,
            low: 9.0,
            close: 10.5,
            volume: 100,
        }
    }

    fn gateway(chunk_size: usize) -> (FetchGateway, Arc<ScriptedProvider>) {
        let provider = Arc::new(ScriptedProvider {
            chunk_calls: AtomicUsize::new(0),
        });
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap()));
        let config = EngineConfig {
            chunk_size,
            max_parallel_chunks: 2,
            ..EngineConfig::default()
        };
        let gw = FetchGateway::new(provider.clone(), clock, &config).unwrap();
        (gw, provider)
    }

    #[test]
    fn fetch_range_sorts_dedupes_and_clips() {
        let (gw, _) = gateway(200);
        let start = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2026, 3, 5).unwrap();
        let series = gw.fetch_range("SPY", start, end).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.last_date(), Some(end));
        assert!(BarSeries::is_strictly_increasing(series.bars()));
    }

    #[test]
    fn inverted_range_is_empty() {
        let (gw, _) = gateway(200);
        let start = NaiveDate::from_ymd_opt(2026, 3, 5).unwrap();
        let series = gw.fetch_range("SPY", start, start - Duration::days(1)).unwrap();
        assert!(series.is_empty());
    }

    #[test]
    fn today_bar_is_last_of_window() {
        let (gw, _) = gateway(200);
        let bar = gw.fetch_today_bar("SPY").unwrap().unwrap();
        assert_eq!(bar.date, NaiveDate::from_ymd_opt(2026, 3, 9).unwrap());
    }

    #[test]
    fn batch_chunks_and_partitions() {
        let (gw, provider) = gateway(3);
        let symbols = ["a", "B", "BAD1", "c", "d", "A", "e"];
        let outcome = gw.fetch_batch_full_history(&symbols, &NoProgress, None);

        // 6 unique symbols in chunks of 3.
        assert_eq!(provider.chunk_calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.results.len() + outcome.failed.len(), 6);
        assert!(outcome.failed.contains("BAD1"));
        assert!(matches!(
            outcome.errors.get("BAD1"),
            Some(FetchError::InvalidInstrument { .. })
        ));
        assert!(outcome.results.contains_key("A"));
    }

    #[test]
    fn cancelled_batch_fails_everything_unscheduled() {
        let (gw, provider) = gateway(2);
        let cancel: CancelToken = Arc::new(AtomicBool::new(true));
        let outcome = gw.fetch_batch_full_history(&["A", "B", "C"], &NoProgress, Some(&cancel));
        assert_eq!(provider.chunk_calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.failed.len(), 3);
        assert!(outcome.errors.values().all(|e| *e == FetchError::Cancelled));
    }

    #[test]
    fn date_range_groups_identical_windows() {
        let (gw, provider) = gateway(200);
        let s = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let e = NaiveDate::from_ymd_opt(2026, 3, 5).unwrap();
        let mut ranges = HashMap::new();
        ranges.insert("A".to_string(), (s, e));
        ranges.insert("B".to_string(), (s, e));
        ranges.insert("C".to_string(), (s, e + Duration::days(1)));
        ranges.insert("BAD".to_string(), (s, e));

        let out = gw.fetch_batch_date_range(&ranges);
        assert_eq!(provider.chunk_calls.load(Ordering::SeqCst), 2);
        assert_eq!(out.len(), 3);
        assert!(!out.contains_key("BAD"));
    }

    #[test]
    fn current_prices_skip_missing_quotes() {
        let (gw, _) = gateway(200);
        let prices = gw.fetch_batch_current_prices(&["SPY", "NOQUOTE"]);
        assert_eq!(prices.len(), 1);
        assert_eq!(prices["SPY"], 123.0);
    }

    #[test]
    fn validate_rejects_unknown_symbols() {
        let (gw, _) = gateway(200);
        assert!(gw.validate_instrument("spy"));
        assert!(!gw.validate_instrument("BADX"));
    }
}
