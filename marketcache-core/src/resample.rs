//! Roll daily bars up to coarser intervals.

use crate::domain::{Bar, BarSeries};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    #[default]
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Interval {
    /// Bucket identifier for `date`; bars sharing it roll up together.
    fn bucket(self, date: NaiveDate) -> (i32, u32) {
        match self {
            Interval::Daily => (date.year(), date.ordinal()),
            Interval::Weekly => {
                let week = date.iso_week();
                (week.year(), week.week())
            }
            Interval::Monthly => (date.year(), date.month()),
            Interval::Yearly => (date.year(), 0),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Interval::Daily => "daily",
            Interval::Weekly => "weekly",
            Interval::Monthly => "monthly",
            Interval::Yearly => "yearly",
        })
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" | "1d" => Ok(Interval::Daily),
            "weekly" | "1wk" => Ok(Interval::Weekly),
            "monthly" | "1mo" => Ok(Interval::Monthly),
            "yearly" | "1y" => Ok(Interval::Yearly),
            other => Err(format!("unknown interval '{other}'")),
        }
    }
}

/// OHLCV roll-up: first open, max high, min low, last close, summed volume.
/// Each bucket is dated by its last bar, so output dates stay strictly increasing.
pub fn resample(series: &BarSeries, interval: Interval) -> BarSeries {
    if interval == Interval::Daily {
        return series.clone();
    }

    let mut out: Vec<Bar> = Vec::new();
    let mut current: Option<((i32, u32), Bar)> = None;
    for bar in series.bars() {
        let key = interval.bucket(bar.date);
        match current.as_mut() {
            Some((k, acc)) if *k == key => {
                acc.date = bar.date;
                acc.high = acc.high.max(bar.high);
                acc.low = acc.low.min(bar.low);
                acc.close = bar.close;
                acc.volume = acc.volume.saturating_add(bar.volume);
            }
            _ => {
                if let Some((_, done)) = current.take() {
                    out.push(done);
                }
                current = Some((key, *bar));
            }
        }
    }
    if let Some((_, done)) = current {
        out.push(done);
    }
    BarSeries::from_bars(out)
}
