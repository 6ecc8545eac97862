//! US equity trading calendar.
//!
//! Deterministic, pure logic. No I/O, no mutable state; `now` is always an
//! argument. Wall-clock comparisons happen in `America/New_York`, so DST
//! transitions are handled by the tz database rather than a fixed offset.
//!
//! Holiday rules (observed):
//! - New Year's Day, Juneteenth (2022+), Independence Day, Christmas: fixed
//!   dates; Saturday → preceding Friday, Sunday → following Monday. New
//!   Year's falling on a Saturday is therefore observed on December 31 of
//!   the previous year.
//! - MLK Day (3rd Mon Jan), Presidents' Day (3rd Mon Feb), Memorial Day (last
//!   Mon May), Labor Day (1st Mon Sep), Thanksgiving (4th Thu Nov).
//! - Good Friday: two days before Gregorian Easter.

use crate::config::EngineConfig;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::America::New_York;
use chrono_tz::Tz;

/// First year Juneteenth closed the exchange.
const JUNETEENTH_FIRST_YEAR: i32 = 2022;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradingCalendar {
    market_close: NaiveTime,
    extended_open: NaiveTime,
    extended_close: NaiveTime,
}

impl Default for TradingCalendar {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl TradingCalendar {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            market_close: config.market_close,
            extended_open: config.extended_open,
            extended_close: config.extended_close,
        }
    }

    /// Exchange time zone.
    pub fn timezone(&self) -> Tz {
        New_York
    }

    /// `now` as Eastern Time wall clock.
    pub fn local(&self, now: DateTime<Utc>) -> DateTime<Tz> {
        now.with_timezone(&New_York)
    }

    /// Calendar date in Eastern Time.
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        self.local(now).date_naive()
    }

    /// Weekday and not an observed holiday.
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !is_weekend(date) && !is_observed_holiday(date)
    }

    /// Most recent trading day strictly before `date`.
    pub fn previous_trading_day(&self, date: NaiveDate) -> NaiveDate {
        let mut day = date - Duration::days(1);
        while !self.is_trading_day(day) {
            day -= Duration::days(1);
        }
        day
    }

    /// The last session whose daily bar should exist at `now`.
    ///
    /// Today if today trades and the close has passed; otherwise the most
    /// recent earlier trading day.
    pub fn last_expected_trading_date(&self, now: DateTime<Utc>) -> NaiveDate {
        let local = self.local(now);
        let today = local.date_naive();
        if self.is_trading_day(today) && local.time() >= self.market_close {
            today
        } else {
            self.previous_trading_day(today)
        }
    }

    /// Pre-market through after-hours on a trading day: `[open, close)`.
    pub fn is_extended_market_open(&self, now: DateTime<Utc>) -> bool {
        let local = self.local(now);
        if !self.is_trading_day(local.date_naive()) {
            return false;
        }
        let t = local.time();
        t >= self.extended_open && t < self.extended_close
    }

    /// Observed exchange holidays for `year`, sorted. New Year's Day may be
    /// observed in the previous calendar year and then appears in that
    /// year's list instead.
    pub fn observed_holidays(year: i32) -> Vec<NaiveDate> {
        let mut days: Vec<NaiveDate> = holidays_for(year)
            .into_iter()
            .chain(holidays_for(year + 1))
            .filter(|d| d.year() == year)
            .collect();
        days.sort();
        days.dedup();
        days
    }
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

fn is_observed_holiday(date: NaiveDate) -> bool {
    if holidays_for(date.year()).contains(&date) {
        return true;
    }
    // Dec 31 can carry next year's New Year's Day.
    date.month() == 12 && date.day() == 31 && observe(ymd(date.year() + 1, 1, 1)) == date
}

/// Observed holidays attributed to `year` (New Year's may land in `year - 1`).
fn holidays_for(year: i32) -> Vec<NaiveDate> {
    let mut days = vec![
        observe(ymd(year, 1, 1)),
        nth_weekday(year, 1, Weekday::Mon, 3),
        nth_weekday(year, 2, Weekday::Mon, 3),
        easter_sunday(year) - Duration::days(2),
        last_weekday(year, 5, Weekday::Mon),
        observe(ymd(year, 7, 4)),
        nth_weekday(year, 9, Weekday::Mon, 1),
        nth_weekday(year, 11, Weekday::Thu, 4),
        observe(ymd(year, 12, 25)),
    ];
    if year >= JUNETEENTH_FIRST_YEAR {
        days.push(observe(ymd(year, 6, 19)));
    }
    days
}

fn observe(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(NaiveDate::MIN)
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u8) -> NaiveDate {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n).unwrap_or(NaiveDate::MIN)
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> NaiveDate {
    let first_of_next = if month == 12 {
        ymd(year + 1, 1, 1)
    } else {
        ymd(year, month + 1, 1)
    };
    let mut day = first_of_next - Duration::days(1);
    while day.weekday() != weekday {
        day -= Duration::days(1);
    }
    day
}

/// Anonymous Gregorian computus.
fn easter_sunday(year: i32) -> NaiveDate {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    ymd(year, month as u32, day as u32)
}
