//! Freshness: does a cached series already hold the bar it should hold?
//!
//! Pure given its inputs. Crypto trades every day, so yesterday's (UTC) bar is
//! always closed and definitive; equities follow the exchange calendar.

use crate::calendar::TradingCalendar;
use crate::domain::{AssetClass, BarSeries};
use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Outcome of a freshness check, with the date it was judged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessVerdict {
    pub is_current: bool,
    pub expected_last_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FreshnessEvaluator {
    calendar: TradingCalendar,
}

impl FreshnessEvaluator {
    pub fn new(calendar: TradingCalendar) -> Self {
        Self { calendar }
    }

    pub fn calendar(&self) -> &TradingCalendar {
        &self.calendar
    }

    /// Oldest last-bar date that still counts as current for `class` at `now`.
    pub fn expected_last_date(&self, class: AssetClass, now: DateTime<Utc>) -> NaiveDate {
        match class {
            AssetClass::Crypto => now.date_naive() - Duration::days(1),
            AssetClass::Equity => self.calendar.last_expected_trading_date(now),
        }
    }

    pub fn evaluate(
        &self,
        instrument: &str,
        series: Option<&BarSeries>,
        now: DateTime<Utc>,
    ) -> FreshnessVerdict {
        let expected_last_date = self.expected_last_date(AssetClass::of(instrument), now);
        let is_current = series
            .and_then(BarSeries::last_date)
            .is_some_and(|last| last >= expected_last_date);
        FreshnessVerdict {
            is_current,
            expected_last_date,
        }
    }

    /// Absent or empty series are never current.
    pub fn is_current(&self, instrument: &str, series: Option<&BarSeries>, now: DateTime<Utc>) -> bool {
        self.evaluate(instrument, series, now).is_current
    }
}
