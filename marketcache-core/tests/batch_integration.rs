//! Batch refresh end to end: chunking, partial failure, progress ordering.

mod common;

use common::{clock_at, config_in, d, et, make_bar, MockProvider};
use marketcache_core::data::{CacheStore, FetchGateway};
use marketcache_core::{
    BarSeries, BatchOptions, EngineConfig, MarketDataService, NoProgress, Phase, ProgressEvent,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

fn universe(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("SYM{i:04}")).collect()
}

#[test]
fn three_thousand_instruments_take_fifteen_chunk_calls() {
    let provider = MockProvider::new();
    let gateway = FetchGateway::new(
        provider.clone(),
        clock_at(et(2026, 3, 10, 17, 0)),
        &EngineConfig::default(),
    )
    .unwrap();

    let outcome = gateway.fetch_batch_full_history(&universe(3000), &NoProgress, None);
    assert_eq!(provider.chunk_calls.load(Ordering::SeqCst), 15);
    assert_eq!(outcome.results.len(), 3000);
    assert!(outcome.failed.is_empty());
}

#[test]
fn failed_instruments_are_partitioned_not_raised() {
    let provider = MockProvider::new();
    provider.fail("SYM0007");
    provider.mark_invalid("SYM0100");
    let gateway = FetchGateway::new(
        provider.clone(),
        clock_at(et(2026, 3, 10, 17, 0)),
        &EngineConfig::default(),
    )
    .unwrap();

    let symbols = universe(450);
    let outcome = gateway.fetch_batch_full_history(&symbols, &NoProgress, None);

    assert_eq!(provider.chunk_calls.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.results.len() + outcome.failed.len(), symbols.len());
    for bad in ["SYM0007", "SYM0100"] {
        assert!(outcome.failed.contains(bad));
        assert!(!outcome.results.contains_key(bad));
    }
}

#[test]
fn progress_follows_input_order_within_each_phase() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new();
    let config = EngineConfig {
        chunk_size: 2,
        max_parallel_chunks: 4,
        ..config_in(dir.path())
    };
    let service = MarketDataService::new(config, provider, clock_at(et(2026, 3, 10, 17, 0))).unwrap();

    // Two instruments already current.
    let current = BarSeries::from_bars(vec![make_bar(d(2026, 3, 10), 10.0)]);
    service.cache().write("CCC", &current);
    service.cache().write("AAA", &current);

    let input = ["ZZZ", "CCC", "YYY", "AAA", "XXX", "WWW", "VVV"];
    let (tx, rx) = mpsc::channel::<ProgressEvent>();
    let report = service.fetch_history_batch(&input, &tx, None, BatchOptions::default());
    drop(tx);
    let events: Vec<ProgressEvent> = rx.iter().collect();

    let phase = |p: Phase| -> Vec<String> {
        events
            .iter()
            .filter(|e| e.phase == p)
            .map(|e| e.instrument.clone())
            .collect()
    };
    assert_eq!(phase(Phase::Classifying), input.to_vec());
    assert_eq!(phase(Phase::Cache), vec!["CCC", "AAA"]);
    assert_eq!(phase(Phase::Provider), vec!["ZZZ", "YYY", "XXX", "WWW", "VVV"]);

    let provider_counts: Vec<usize> = events
        .iter()
        .filter(|e| e.phase == Phase::Provider)
        .map(|e| e.completed)
        .collect();
    assert_eq!(provider_counts, vec![1, 2, 3, 4, 5]);

    assert_eq!(report.series.len(), input.len());
    assert_eq!(report.from_cache, 2);
    assert_eq!(report.fetched, 5);
}

#[test]
fn fetched_series_are_persisted_for_the_next_batch() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new();
    let service =
        MarketDataService::new(config_in(dir.path()), provider.clone(), clock_at(et(2026, 3, 10, 17, 0))).unwrap();

    let symbols = ["SPY", "QQQ", "BTC-USD"];
    service.fetch_history_batch(&symbols, &NoProgress, None, BatchOptions::default());
    let calls_after_first = provider.chunk_calls.load(Ordering::SeqCst);

    let store = CacheStore::new(dir.path());
    for s in symbols {
        assert!(store.has(s), "{s} should be cached");
    }

    let second = service.fetch_history_batch(&symbols, &NoProgress, None, BatchOptions::default());
    assert_eq!(provider.chunk_calls.load(Ordering::SeqCst), calls_after_first);
    assert_eq!(second.from_cache, 3);
}

#[test]
fn cancelled_batch_still_serves_cache() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new();
    let service =
        MarketDataService::new(config_in(dir.path()), provider.clone(), clock_at(et(2026, 3, 10, 17, 0))).unwrap();
    service
        .cache()
        .write("SPY", &BarSeries::from_bars(vec![make_bar(d(2026, 3, 10), 10.0)]));

    let cancel = Arc::new(AtomicBool::new(true));
    let report = service.fetch_history_batch(&["SPY", "QQQ"], &NoProgress, Some(&cancel), BatchOptions::default());

    assert_eq!(provider.chunk_calls.load(Ordering::SeqCst), 0);
    assert!(report.series.contains_key("SPY"));
    assert!(report.failed.contains("QQQ"));
}

#[test]
fn duplicate_and_mixed_case_inputs_are_fetched_once() {
    let provider = MockProvider::new();
    let gateway = FetchGateway::new(
        provider.clone(),
        clock_at(et(2026, 3, 10, 17, 0)),
        &EngineConfig::default(),
    )
    .unwrap();
    let outcome = gateway.fetch_batch_full_history(&["spy", " SPY", "Spy", "qqq"], &NoProgress, None);
    assert_eq!(outcome.results.len(), 2);
    assert_eq!(provider.range_call_count(), 2);
}
