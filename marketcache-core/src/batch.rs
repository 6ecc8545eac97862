//! Batch refresh: classify, serve current series from cache, fetch the rest.
//!
//! Large universes are best-effort. An instrument that fails to fetch is left
//! out of the result map and listed in the report, never aborting its siblings.

use crate::clock::Clock;
use crate::data::{CacheStore, CancelToken, FetchError, FetchGateway, FetchTicket, FetchTickets};
use crate::domain::{normalize_symbols, BarSeries};
use crate::freshness::FreshnessEvaluator;
use crate::progress::{Phase, ProgressEvent, ProgressSink};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Partition of a batch into instruments served from cache and instruments
/// that must be fetched. Each group keeps input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchClassification {
    pub current: Vec<String>,
    pub needs_update: Vec<String>,
}

impl BatchClassification {
    pub fn len(&self) -> usize {
        self.current.len() + self.needs_update.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    /// Serve the stale cached copy of an instrument whose fetch failed.
    pub fallback_to_stale: bool,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub series: HashMap<String, BarSeries>,
    /// Instruments whose fetch failed.
    pub failed: BTreeSet<String>,
    pub errors: HashMap<String, FetchError>,
    /// Failed instruments that still have a stale cached copy, in input order.
    pub stale_fallback: Vec<String>,
    pub from_cache: usize,
    pub fetched: usize,
}

pub struct BatchScheduler {
    cache: Arc<CacheStore>,
    gateway: Arc<FetchGateway>,
    tickets: Arc<FetchTickets>,
    freshness: FreshnessEvaluator,
    clock: Arc<dyn Clock>,
}

/// Classification plus whatever the cache held for each instrument.
struct Loaded {
    classification: BatchClassification,
    cached: HashMap<String, BarSeries>,
}

impl BatchScheduler {
    pub fn new(
        cache: Arc<CacheStore>,
        gateway: Arc<FetchGateway>,
        tickets: Arc<FetchTickets>,
        freshness: FreshnessEvaluator,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache,
            gateway,
            tickets,
            freshness,
            clock,
        }
    }

    /// Split instruments into current and needs-update without touching the provider.
    pub fn classify<S: AsRef<str>>(&self, symbols: &[S], progress: &dyn ProgressSink) -> BatchClassification {
        self.load(&normalize_symbols(symbols), progress).classification
    }

    fn load(&self, symbols: &[String], progress: &dyn ProgressSink) -> Loaded {
        let now = self.clock.now();
        let total = symbols.len();
        let mut classification = BatchClassification::default();
        let mut cached = HashMap::new();

        for (i, symbol) in symbols.iter().enumerate() {
            let series = self.cache.read(symbol);
            if self.freshness.is_current(symbol, series.as_ref(), now) {
                classification.current.push(symbol.clone());
            } else {
                classification.needs_update.push(symbol.clone());
            }
            if let Some(series) = series {
                cached.insert(symbol.clone(), series);
            }
            progress.report(ProgressEvent {
                completed: i + 1,
                total,
                instrument: symbol.clone(),
                phase: Phase::Classifying,
            });
        }

        Loaded {
            classification,
            cached,
        }
    }

    pub fn fetch_history_batch<S: AsRef<str>>(
        &self,
        symbols: &[S],
        progress: &dyn ProgressSink,
        cancel: Option<&CancelToken>,
        options: BatchOptions,
    ) -> BatchReport {
        let symbols = normalize_symbols(symbols);
        let Loaded {
            classification,
            mut cached,
        } = self.load(&symbols, progress);
        debug!(
            current = classification.current.len(),
            needs_update = classification.needs_update.len(),
            "batch classified"
        );

        let mut report = BatchReport::default();

        let cache_total = classification.current.len();
        for (i, symbol) in classification.current.iter().enumerate() {
            if let Some(series) = cached.remove(symbol) {
                report.series.insert(symbol.clone(), series);
                report.from_cache += 1;
            }
            progress.report(ProgressEvent {
                completed: i + 1,
                total: cache_total,
                instrument: symbol.clone(),
                phase: Phase::Cache,
            });
        }

        if !classification.needs_update.is_empty() {
            // Tickets are taken in sorted order and held across fetch and write,
            // so a live poll for the same instrument lands after the snapshot.
            let mut locked = classification.needs_update.clone();
            locked.sort();
            let tickets: Vec<FetchTicket> = locked.iter().map(|s| self.tickets.ticket(s)).collect();
            let _held: Vec<_> = tickets.iter().map(FetchTicket::hold).collect();

            let outcome = self
                .gateway
                .fetch_batch_full_history(&classification.needs_update, progress, cancel);

            for (symbol, series) in outcome.results {
                self.cache.write(&symbol, &series);
                report.series.insert(symbol, series);
                report.fetched += 1;
            }

            for symbol in &classification.needs_update {
                if !outcome.failed.contains(symbol) {
                    continue;
                }
                if let Some(stale) = cached.remove(symbol) {
                    report.stale_fallback.push(symbol.clone());
                    if options.fallback_to_stale {
                        report.series.insert(symbol.clone(), stale);
                    }
                }
            }
            report.failed = outcome.failed;
            report.errors = outcome.errors;
        }

        info!(
            requested = symbols.len(),
            from_cache = report.from_cache,
            fetched = report.fetched,
            failed = report.failed.len(),
            stale_fallback = report.stale_fallback.len(),
            "batch refresh complete"
        );
        report
    }
}
