use crate::error::{ChargebackError, Result};
use chrono::{Datelike, Days, NaiveDate};

/// Returns true if `s` is a well-formed period key (`YYYY-MM` with a real month).
pub fn is_period_key(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 7 || bytes[4] != b'-' {
        return false;
    }
    if !bytes[..4].iter().all(|b| b.is_ascii_digit()) {
        return false;
    }
    if !bytes[5..7].iter().all(|b| b.is_ascii_digit()) {
        return false;
    }
    matches!(s[5..7].parse::<u32>(), Ok(m) if (1..=12).contains(&m))
}

/// Parses the date representations that show up in cost exports.
///
/// Accepts `YYYY-MM-DD`, `YYYY/MM/DD`, date-times (with or without an offset),
/// a bare 4-digit year (mapped to January 1st) and anything whose first seven
/// characters form a valid `YYYY-MM` key (mapped to the 1st of that month).
pub fn parse_date_flexible(value: &str) -> Option<NaiveDate> {
    let s = value.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y/%m/%d") {
        return Some(date);
    }

    // Date-time forms: everything before the 'T' (or space) is the date part
    if let Some(idx) = s.find(|c: char| c == 'T' || c == ' ') {
        if let Ok(date) = NaiveDate::parse_from_str(&s[..idx], "%Y-%m-%d") {
            return Some(date);
        }
    }

    if s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit()) {
        return s
            .parse::<i32>()
            .ok()
            .and_then(|year| NaiveDate::from_ymd_opt(year, 1, 1));
    }

    if s.len() >= 7 && is_period_key(&s[..7]) {
        let year = s[..4].parse::<i32>().ok()?;
        let month = s[5..7].parse::<u32>().ok()?;
        return NaiveDate::from_ymd_opt(year, month, 1);
    }

    None
}

/// Derives the `YYYY-MM` billing period key from a period-start value.
/// Returns `None` when the value is absent or not a recognizable date.
pub fn period_key_from_date(value: &str) -> Option<String> {
    let date = parse_date_flexible(value)?;
    Some(format!("{:04}-{:02}", date.year(), date.month()))
}

pub fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let next_month = if month == 12 { 1 } else { month + 1 };
    let next_year = if month == 12 { year + 1 } else { year };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .unwrap_or(NaiveDate::MAX)
        .checked_sub_days(Days::new(1))
        .unwrap_or(NaiveDate::MIN)
}

/// Names the fiscal year a date falls into, given the fiscal start month/day.
///
/// Fiscal years are labelled by the calendar year they end in: with a July 1st
/// start, 2025-06-30 belongs to `FY2025` and 2025-07-01 to `FY2026`.
pub fn fiscal_year_bucket(date: NaiveDate, start_month: u32, start_day: u32) -> String {
    let boundary = NaiveDate::from_ymd_opt(date.year(), start_month, start_day)
        .unwrap_or_else(|| last_day_of_month(date.year(), start_month));

    if date >= boundary {
        format!("FY{}", date.year() + 1)
    } else {
        format!("FY{}", date.year())
    }
}

/// Rounds to `decimals` places using banker's rounding (round-half-to-even).
///
/// Applied to monetary values at the point of persistence or display;
/// intermediate accumulation keeps full precision.
pub fn round_half_even(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    let scaled = value * factor;
    let floor = scaled.floor();
    let diff = scaled - floor;

    // Scaled values within epsilon of a half are treated as halves: inputs
    // like 10.015 scale to 1001.4999999... and would otherwise miss the
    // even rule.
    let rounded = if (diff - 0.5).abs() < 1e-9 {
        if (floor as i64) % 2 == 0 {
            floor
        } else {
            floor + 1.0
        }
    } else {
        scaled.round()
    };

    rounded / factor
}

/// Compares two optional monetary values at cent precision.
pub fn money_eq(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => (x - y).abs() < 0.005,
        _ => false,
    }
}

/// Parses a cost cell, tolerating thousands separators and blank values.
pub fn parse_cost(value: &str) -> Option<f64> {
    let cleaned = value.trim().replace(',', "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}


/// Parses a fiscal start in `MM-DD` form into a (month, day) pair.
pub fn parse_fiscal_start(s: &str) -> Result<(u32, u32)> {
    let err = || ChargebackError::InvalidFiscalStart(s.to_string());

    let (month_str, day_str) = s.split_once('-').ok_or_else(err)?;
    let month: u32 = month_str.parse().map_err(|_| err())?;
    let day: u32 = day_str.parse().map_err(|_| err())?;

    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err(err());
    }
    Ok((month, day))
}
