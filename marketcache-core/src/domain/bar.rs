//! Bar and BarSeries, the fundamental market data units.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// OHLCV bar for a single instrument on a single session.
///
/// Dates are timezone-naive calendar days as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Bar {
    /// Returns true if any OHLC field is NaN (provider gap).
    pub fn is_void(&self) -> bool {
        self.open.is_nan() || self.high.is_nan() || self.low.is_nan() || self.close.is_nan()
    }

    /// Non-negative, finite prices with high >= low.
    pub fn is_sane(&self) -> bool {
        if self.is_void() {
            return false;
        }
        self.high >= self.low
            && self.open >= 0.0
            && self.high >= 0.0
            && self.low >= 0.0
            && self.close >= 0.0
    }
}

/// Ordered bars for one instrument.
///
/// Invariant: dates are strictly increasing with no duplicates. Every
/// constructor and mutator preserves it, so the field stays private.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BarSeries {
    bars: Vec<Bar>,
}

impl BarSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a series from bars in any order.
    ///
    /// Bars are sorted by date; when a date repeats, the later occurrence in
    /// `bars` wins (matching merge semantics, where newer data overwrites).
    pub fn from_bars(bars: Vec<Bar>) -> Self {
        let mut series = Self::new();
        series.merge(bars);
        series
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn into_bars(self) -> Vec<Bar> {
        self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn first(&self) -> Option<&Bar> {
        self.bars.first()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.bars.first().map(|b| b.date)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.bars.last().map(|b| b.date)
    }

    pub fn last_close(&self) -> Option<f64> {
        self.bars.last().map(|b| b.close)
    }

    /// Bar for an exact date, if present.
    pub fn get(&self, date: NaiveDate) -> Option<&Bar> {
        self.bars
            .binary_search_by_key(&date, |b| b.date)
            .ok()
            .map(|i| &self.bars[i])
    }

    /// Merge bars by date key.
    ///
    /// Bars whose date already exists overwrite the stored bar (provider
    /// corrections to the latest partial bar); new dates are inserted in
    /// sorted position. Merging the same bars twice is a no-op the second time.
    pub fn merge(&mut self, new_bars: impl IntoIterator<Item = Bar>) {
        let mut incoming: Vec<Bar> = new_bars.into_iter().collect();
        if incoming.is_empty() {
            return;
        }
        // Stable sort keeps input order among equal dates; the last one wins below.
        incoming.sort_by_key(|b| b.date);

        // Fast path: every incoming date is at or after our tail (live polling).
        let appendable = match (self.bars.last(), incoming.first()) {
            (None, _) => true,
            (Some(tail), Some(head)) => head.date >= tail.date,
            _ => false,
        };

        if appendable {
            for bar in incoming {
                match self.bars.last_mut() {
                    Some(tail) if tail.date == bar.date => *tail = bar,
                    _ => self.bars.push(bar),
                }
            }
            return;
        }

        let existing = std::mem::take(&mut self.bars);
        let mut merged: Vec<Bar> = Vec::with_capacity(existing.len() + incoming.len());
        let mut old = existing.into_iter().peekable();
        let mut new = incoming.into_iter().peekable();

        loop {
            let next = match (old.peek().map(|b| b.date), new.peek().map(|b| b.date)) {
                (None, None) => break,
                (Some(_), None) => old.next(),
                (Some(o), Some(n)) if o < n => old.next(),
                (Some(o), Some(n)) => {
                    if o == n {
                        old.next();
                    }
                    new.next()
                }
                (None, Some(_)) => new.next(),
            };
            let Some(bar) = next else { break };
            match merged.last_mut() {
                Some(tail) if tail.date == bar.date => *tail = bar,
                Some(_) | None => merged.push(bar),
            }
        }

        self.bars = merged;
    }

    /// Bars with `start <= date <= end`.
    pub fn slice(&self, start: NaiveDate, end: NaiveDate) -> BarSeries {
        BarSeries {
            bars: self
                .bars
                .iter()
                .filter(|b| b.date >= start && b.date <= end)
                .copied()
                .collect(),
        }
    }

    /// True when the strict-ordering invariant holds. Used by loaders that
    /// receive data from outside (disk) and by tests.
    pub fn is_strictly_increasing(bars: &[Bar]) -> bool {
        bars.windows(2).all(|w| w[0].date < w[1].date)
    }
}

impl FromIterator<Bar> for BarSeries {
    fn from_iter<I: IntoIterator<Item = Bar>>(iter: I) -> Self {
        Self::from_bars(iter.into_iter().collect())
    }
}
