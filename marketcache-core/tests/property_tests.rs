//! Property tests for cache and calendar invariants.
//!
//! Uses proptest to verify:
//! 1. Merge ordering: a merged series is strictly increasing by date
//! 2. Merge idempotence: merging the same bars twice changes nothing
//! 3. Merge precedence: incoming bars overwrite stored bars on equal dates
//! 4. Calendar: the last expected trading date is a trading day, never after today in ET
//! 5. Resampling: buckets stay ordered and never outnumber the source bars

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use marketcache_core::{resample, Bar, BarSeries, Interval, TradingCalendar};
use proptest::prelude::*;

// ── Strategies (proptest) ────────────────────────────────────────────

fn base_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()
}

fn arb_bar() -> impl Strategy<Value = Bar> {
    (0i64..400, 10.0..500.0_f64).prop_map(|(offset, close)| Bar {
        date: base_date() + Duration::days(offset),
        open: close,
        high: close + 1.0,
        low: close - 1.0,
        close,
        volume: 1_000,
    })
}

fn arb_bars() -> impl Strategy<Value = Vec<Bar>> {
    prop::collection::vec(arb_bar(), 0..60)
}

fn arb_interval() -> impl Strategy<Value = Interval> {
    prop_oneof![
        Just(Interval::Daily),
        Just(Interval::Weekly),
        Just(Interval::Monthly),
        Just(Interval::Yearly),
    ]
}

// ── 1-3. Merge ───────────────────────────────────────────────────────

proptest! {
    #[test]
    fn merge_keeps_dates_strictly_increasing(existing in arb_bars(), incoming in arb_bars()) {
        let mut series = BarSeries::from_bars(existing);
        series.merge(incoming);
        prop_assert!(BarSeries::is_strictly_increasing(series.bars()));
    }

    #[test]
    fn merge_is_idempotent(existing in arb_bars(), incoming in arb_bars()) {
        let mut once = BarSeries::from_bars(existing);
        once.merge(incoming.clone());
        let mut twice = once.clone();
        twice.merge(incoming);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn incoming_bars_win_on_equal_dates(existing in arb_bars(), incoming in arb_bars()) {
        let mut series = BarSeries::from_bars(existing.clone());
        series.merge(incoming.clone());

        // Within one batch the later bar for a date wins.
        let winners = BarSeries::from_bars(incoming);
        for bar in winners.bars() {
            prop_assert_eq!(series.get(bar.date), Some(bar));
        }
        for bar in &existing {
            prop_assert!(series.get(bar.date).is_some());
        }
    }
}

// ── 4. Calendar ──────────────────────────────────────────────────────

proptest! {
    #[test]
    fn last_expected_date_is_a_past_trading_day(minutes in 0i64..(6 * 366 * 24 * 60)) {
        let cal = TradingCalendar::default();
        let now = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes);
        let expected = cal.last_expected_trading_date(now);
        prop_assert!(cal.is_trading_day(expected));
        prop_assert!(expected <= cal.local_date(now));
        // Never more than a long weekend plus a holiday behind.
        prop_assert!(cal.local_date(now) - expected <= Duration::days(5));
    }

    #[test]
    fn extended_hours_only_on_trading_days(minutes in 0i64..(2 * 366 * 24 * 60)) {
        let cal = TradingCalendar::default();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes);
        if cal.is_extended_market_open(now) {
            prop_assert!(cal.is_trading_day(cal.local_date(now)));
        }
    }
}

// ── 5. Resampling ────────────────────────────────────────────────────

proptest! {
    #[test]
    fn resampled_series_is_ordered_and_no_longer(bars in arb_bars(), interval in arb_interval()) {
        let series = BarSeries::from_bars(bars);
        let out = resample(&series, interval);
        prop_assert!(BarSeries::is_strictly_increasing(out.bars()));
        prop_assert!(out.len() <= series.len());
        prop_assert_eq!(out.last_date(), series.last_date());
    }
}
