//! Scripted provider shared by the integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use marketcache_core::data::{ChunkOutcome, FetchError, MarketDataProvider};
use marketcache_core::{Bar, EngineConfig, FixedClock};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Returns the last few weekdays up to the requested end date.
#[derive(Default)]
pub struct MockProvider {
    pub chunk_calls: AtomicUsize,
    pub range_calls: Mutex<Vec<(String, NaiveDate, NaiveDate)>>,
    pub quote_calls: AtomicUsize,
    pub failing: Mutex<HashSet<String>>,
    pub invalid: Mutex<HashSet<String>>,
    pub rate_limited: AtomicBool,
    pub close: Mutex<f64>,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        let provider = Self::default();
        *provider.close.lock().unwrap() = 100.0;
        Arc::new(provider)
    }

    pub fn fail(&self, symbol: &str) {
        self.failing.lock().unwrap().insert(symbol.to_string());
    }

    pub fn mark_invalid(&self, symbol: &str) {
        self.invalid.lock().unwrap().insert(symbol.to_string());
    }

    pub fn set_close(&self, close: f64) {
        *self.close.lock().unwrap() = close;
    }

    pub fn range_call_count(&self) -> usize {
        self.range_calls.lock().unwrap().len()
    }

    pub fn last_range_call(&self) -> Option<(String, NaiveDate, NaiveDate)> {
        self.range_calls.lock().unwrap().last().cloned()
    }
}

impl MarketDataProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn fetch_range(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>, FetchError> {
        self.range_calls
            .lock()
            .unwrap()
            .push((symbol.to_string(), start, end));
        if self.rate_limited.load(Ordering::SeqCst) {
            return Err(FetchError::RateLimited { retry_after_secs: 60 });
        }
        if self.invalid.lock().unwrap().contains(symbol) {
            return Err(FetchError::InvalidInstrument {
                symbol: symbol.to_string(),
            });
        }
        if self.failing.lock().unwrap().contains(symbol) {
            return Err(FetchError::Network("connection reset".into()));
        }

        let close = *self.close.lock().unwrap();
        let crypto = symbol.ends_with("-USD");
        let mut bars = Vec::new();
        let mut date = end;
        while bars.len() < 5 && date >= start {
            if crypto || !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
                bars.push(make_bar(date, close));
            }
            date -= Duration::days(1);
        }
        Ok(bars)
    }

    fn fetch_chunk(&self, symbols: &[String], start: NaiveDate, end: NaiveDate) -> ChunkOutcome {
        self.chunk_calls.fetch_add(1, Ordering::SeqCst);
        symbols
            .iter()
            .map(|s| (s.clone(), self.fetch_range(s, start, end)))
            .collect()
    }

    fn fetch_quote(&self, _symbol: &str) -> Result<Option<f64>, FetchError> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);
        if self.rate_limited.load(Ordering::SeqCst) {
            return Err(FetchError::RateLimited { retry_after_secs: 60 });
        }
        Ok(Some(*self.close.lock().unwrap() * 1.02))
    }
}

pub fn make_bar(date: NaiveDate, close: f64) -> Bar {
    Bar {
        date,
        open: close - 0.5,
        high: close + 1.0,
        low: close - 1.0,
        close,
        volume: 1_000,
    }
}

pub fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

/// A wall-clock instant given in New York local time.
pub fn et(y: i32, m: u32, day: u32, h: u32, min: u32) -> DateTime<Utc> {
    chrono_tz::America::New_York
        .with_ymd_and_hms(y, m, day, h, min, 0)
        .single()
        .unwrap()
        .with_timezone(&Utc)
}

pub fn config_in(root: &Path) -> EngineConfig {
    EngineConfig::with_cache_root(root)
}

pub fn clock_at(now: DateTime<Utc>) -> Arc<FixedClock> {
    Arc::new(FixedClock::new(now))
}
