// twshist/src/data.rs
// Historical data types: durations, windows, bars and per-symbol series

use crate::base::TwsError;
use crate::contract::{BarSize, DateFormat, WhatToShow};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Duration vocabulary understood by the gateway ("N S", "N D", "N W", "N M", "N Y").
/// Use `DurationUnit::to_string()` to get the TWS-compatible string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DurationUnit {
  Second(i32),
  Day(i32),
  Week(i32),
  Month(i32),
  Year(i32),
}

impl DurationUnit {
  /// How far to step a window end marker back after requesting this
  /// duration. Months count 28 days and years 365, so consecutive windows
  /// overlap instead of leaving holes.
  pub fn approximate_span(&self) -> ChronoDuration {
    self.checked_span().unwrap_or(ChronoDuration::MAX)
  }

  /// `approximate_span`, or None when it does not fit a `ChronoDuration`.
  pub fn checked_span(&self) -> Option<ChronoDuration> {
    match *self {
      DurationUnit::Second(n) => ChronoDuration::try_seconds(n as i64),
      DurationUnit::Day(n) => ChronoDuration::try_days(n as i64),
      DurationUnit::Week(n) => ChronoDuration::try_days(7 * n as i64),
      DurationUnit::Month(n) => ChronoDuration::try_days(28 * n as i64),
      DurationUnit::Year(n) => ChronoDuration::try_days(365 * n as i64),
    }
  }
}

impl fmt::Display for DurationUnit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      DurationUnit::Second(n) => write!(f, "{} S", n),
      DurationUnit::Day(n) => write!(f, "{} D", n),
      DurationUnit::Week(n) => write!(f, "{} W", n),
      DurationUnit::Month(n) => write!(f, "{} M", n),
      DurationUnit::Year(n) => write!(f, "{} Y", n),
    }
  }
}

impl FromStr for DurationUnit {
  type Err = TwsError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let parts: Vec<&str> = s.split_whitespace().collect();
    if parts.len() != 2 {
      return Err(TwsError::InvalidParameter(format!("Invalid duration string format: '{}'", s)));
    }
    let value = parts[0].parse::<i32>()
      .map_err(|_| TwsError::InvalidParameter(format!("Invalid number in duration string: '{}'", parts[0])))?;
    if value <= 0 {
      return Err(TwsError::InvalidParameter(format!("Duration must be positive: '{}'", s)));
    }
    let unit = match parts[1].to_uppercase().as_str() {
      "S" => DurationUnit::Second(value),
      "D" => DurationUnit::Day(value),
      "W" => DurationUnit::Week(value),
      "M" => DurationUnit::Month(value),
      "Y" => DurationUnit::Year(value),
      _ => return Err(TwsError::InvalidParameter(format!("Invalid unit in duration string: '{}'", parts[1]))),
    };
    if unit.checked_span().is_none() {
      return Err(TwsError::InvalidParameter(format!("Duration out of range: '{}'", s)));
    }
    Ok(unit)
  }
}

/// Span covering `years` calendar years at 365.25 days each.
pub fn years_span(years: f64) -> Result<ChronoDuration, TwsError> {
  if !years.is_finite() || years <= 0.0 {
    return Err(TwsError::InvalidParameter(format!("Years must be a positive number, got {}", years)));
  }
  // The cast saturates, and try_seconds refuses the saturated value.
  ChronoDuration::try_seconds((years * 365.25 * 86_400.0).round() as i64)
    .ok_or_else(|| TwsError::InvalidParameter(format!("Span of {} years is out of range", years)))
}

/// One bounded historical request: everything up to `end` covering `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
  /// `None` asks the gateway for data ending now.
  pub end: Option<DateTime<Utc>>,
  pub duration: DurationUnit,
}

impl Window {
  pub fn ending_at(end: DateTime<Utc>, duration: DurationUnit) -> Self {
    Window { end: Some(end), duration }
  }

  pub fn ending_now(duration: DurationUnit) -> Self {
    Window { end: None, duration }
  }
}

impl fmt::Display for Window {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.end {
      Some(end) => write!(f, "[{} ending {}]", self.duration, end.format("%Y-%m-%d %H:%M:%S")),
      None => write!(f, "[{} ending now]", self.duration),
    }
  }
}

/// Per-request settings for a historical window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryOptions {
  pub bar_size: BarSize,
  /// `None` picks the default for the contract's security type.
  pub what_to_show: Option<WhatToShow>,
  pub use_rth: bool,
  pub date_format: DateFormat,
}

impl Default for HistoryOptions {
  fn default() -> Self {
    HistoryOptions {
      bar_size: BarSize::OneDay,
      what_to_show: None,
      use_rth: true,
      date_format: DateFormat::Text,
    }
  }
}

/// A bar exactly as it came off the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBar {
  pub date: String,
  pub open: f64,
  pub high: f64,
  pub low: f64,
  pub close: f64,
  pub volume: f64,
  pub wap: f64,
  pub count: i32,
}

impl RawBar {
  /// Convert into a [`Bar`] with a UTC timestamp.
  pub fn normalize(&self) -> Result<Bar, TwsError> {
    Ok(Bar {
      time: parse_bar_time(&self.date)?,
      open: self.open,
      high: self.high,
      low: self.low,
      close: self.close,
      volume: self.volume,
      wap: self.wap,
      count: self.count,
    })
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bar {
  pub time: DateTime<Utc>,
  pub open: f64,
  pub high: f64,
  pub low: f64,
  pub close: f64,
  pub volume: f64,
  pub wap: f64,
  pub count: i32,
}

/// Parse a bar timestamp as sent by the gateway.
///
/// Accepts epoch seconds, `YYYYMMDD` (midnight UTC), and
/// `YYYYMMDD HH:MM:SS [zone]`. Daily bars come back as `YYYYMMDD` even
/// when epoch format was requested, so the shape decides, not the mode.
pub fn parse_bar_time(raw: &str) -> Result<DateTime<Utc>, TwsError> {
  let parts: Vec<&str> = raw.split_whitespace().collect();
  let first = *parts.first()
    .ok_or_else(|| TwsError::FormatError("Empty bar timestamp".to_string()))?;

  if parts.len() == 1 && first.len() != 8 && first.bytes().all(|b| b.is_ascii_digit()) {
    let secs = first.parse::<i64>()
      .map_err(|e| TwsError::FormatError(format!("Bad epoch timestamp '{}': {}", raw, e)))?;
    return Utc.timestamp_opt(secs, 0).single()
      .ok_or_else(|| TwsError::FormatError(format!("Epoch out of range: '{}'", raw)));
  }

  let date = NaiveDate::parse_from_str(first, "%Y%m%d")
    .map_err(|e| TwsError::FormatError(format!("Bad bar date '{}': {}", raw, e)))?;
  let time = match parts.get(1) {
    Some(t) => NaiveTime::parse_from_str(t, "%H:%M:%S")
      .map_err(|e| TwsError::FormatError(format!("Bad bar time '{}': {}", raw, e)))?,
    None => NaiveTime::MIN,
  };
  let naive = NaiveDateTime::new(date, time);

  match parts.get(2) {
    Some(zone) => {
      let tz = Tz::from_str(zone)
        .map_err(|e| TwsError::FormatError(format!("Unknown time zone '{}' in '{}': {}", zone, raw, e)))?;
      tz.from_local_datetime(&naive).earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| TwsError::FormatError(format!("Nonexistent local time '{}'", raw)))
    }
    None => Ok(Utc.from_utc_datetime(&naive)),
  }
}

/// Ordered, timestamp-unique bars for one symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SymbolSeries {
  pub symbol: String,
  bars: Vec<Bar>,
}

impl SymbolSeries {
  pub fn new(symbol: &str) -> Self {
    SymbolSeries { symbol: symbol.to_string(), bars: Vec::new() }
  }

  /// Build a series from bars in arrival order. When two bars share a
  /// timestamp the one that arrived first is kept.
  pub fn from_bars<I: IntoIterator<Item = Bar>>(symbol: &str, bars: I) -> Self {
    let mut series = SymbolSeries::new(symbol);
    series.merge(bars);
    series
  }

  /// Merge more bars in. Bars already present win over incoming ones
  /// with the same timestamp.
  pub fn merge<I: IntoIterator<Item = Bar>>(&mut self, bars: I) {
    let mut by_time: BTreeMap<DateTime<Utc>, Bar> = self.bars.drain(..)
      .map(|b| (b.time, b))
      .collect();
    for bar in bars {
      by_time.entry(bar.time).or_insert(bar);
    }
    self.bars = by_time.into_values().collect();
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

  pub fn first_time(&self) -> Option<DateTime<Utc>> {
    self.bars.first().map(|b| b.time)
  }

  pub fn last_time(&self) -> Option<DateTime<Utc>> {
    self.bars.last().map(|b| b.time)
  }

  /// Consecutive bar pairs further apart than `max_step`.
  pub fn gaps(&self, max_step: ChronoDuration) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    self.bars.windows(2)
      .filter(|w| w[1].time - w[0].time > max_step)
      .map(|w| (w[0].time, w[1].time))
      .collect()
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use chrono::TimeZone;

  pub(crate) fn bar_at(time: DateTime<Utc>, close: f64) -> Bar {
    Bar { time, open: close, high: close, low: close, close, volume: 100.0, wap: close, count: 1 }
  }

  pub(crate) fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
  }

  #[test]
  fn duration_strings() {
    assert_eq!("1 M".parse::<DurationUnit>().unwrap(), DurationUnit::Month(1));
    assert_eq!("2  y".parse::<DurationUnit>().unwrap(), DurationUnit::Year(2));
    assert_eq!(DurationUnit::Day(30).to_string(), "30 D");
    assert!("0 D".parse::<DurationUnit>().is_err());
    assert!("1 Q".parse::<DurationUnit>().is_err());
    assert!("M".parse::<DurationUnit>().is_err());
  }

  #[test]
  fn approximate_spans_undershoot_calendar_months() {
    assert_eq!(DurationUnit::Month(2).approximate_span(), ChronoDuration::days(56));
    assert_eq!(DurationUnit::Week(1).approximate_span(), ChronoDuration::days(7));
    assert_eq!(DurationUnit::Year(1).approximate_span(), ChronoDuration::days(365));
    assert_eq!(years_span(1.0), Ok(ChronoDuration::hours(8766)));
  }

  #[test]
  fn oversized_spans_are_rejected() {
    assert!(matches!("2147483647 Y".parse::<DurationUnit>(), Err(TwsError::InvalidParameter(_))));
    assert_eq!(DurationUnit::Year(i32::MAX).checked_span(), None);
    assert_eq!(DurationUnit::Year(i32::MAX).approximate_span(), ChronoDuration::MAX);
    assert!("100 Y".parse::<DurationUnit>().is_ok());
    for years in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e30] {
      assert!(matches!(years_span(years), Err(TwsError::InvalidParameter(_))), "{}", years);
    }
  }

  #[test]
  fn bar_time_shapes() {
    assert_eq!(parse_bar_time("20240115").unwrap(), day(2024, 1, 15));
    assert_eq!(
      parse_bar_time("20240115  14:30:00").unwrap(),
      Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap()
    );
    assert_eq!(
      parse_bar_time("20240115 09:30:00 US/Eastern").unwrap(),
      Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap()
    );
    assert_eq!(
      parse_bar_time("1705329000").unwrap(),
      Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap()
    );
  }

  #[test]
  fn bad_bar_times_are_format_errors() {
    for raw in ["", "2024-01-15", "20241399", "20240115 25:00:00", "20240115 09:30:00 Mars/Base"] {
      assert!(matches!(parse_bar_time(raw), Err(TwsError::FormatError(_))), "{}", raw);
    }
  }

  #[test]
  fn series_is_sorted_and_keeps_first_duplicate() {
    let bars = vec![
      bar_at(day(2024, 1, 16), 3.0),
      bar_at(day(2024, 1, 15), 1.0),
      bar_at(day(2024, 1, 15), 2.0),
      bar_at(day(2024, 1, 12), 0.5),
    ];
    let series = SymbolSeries::from_bars("SPY", bars);
    let times: Vec<_> = series.bars().iter().map(|b| b.time).collect();
    assert_eq!(times, vec![day(2024, 1, 12), day(2024, 1, 15), day(2024, 1, 16)]);
    assert_eq!(series.bars()[1].close, 1.0);
    assert!(series.bars().windows(2).all(|w| w[0].time < w[1].time));
  }

  #[test]
  fn dedup_commutes_with_merge() {
    let w1: Vec<Bar> = (10..=20).map(|d| bar_at(day(2024, 1, d), d as f64)).collect();
    let w2: Vec<Bar> = (15..=25).map(|d| bar_at(day(2024, 1, d), 100.0 + d as f64)).collect();

    let together = SymbolSeries::from_bars("X", w1.iter().cloned().chain(w2.iter().cloned()));

    let mut separate = SymbolSeries::from_bars("X", w1.iter().cloned());
    separate.merge(SymbolSeries::from_bars("X", w2.iter().cloned()).into_bars());
    assert_eq!(together, separate);

    let mut again = together.clone();
    again.merge(together.bars().to_vec());
    assert_eq!(again, together);
    assert_eq!(together.len(), 16);
  }

  #[test]
  fn gaps_report_holes() {
    let series = SymbolSeries::from_bars("X", vec![
      bar_at(day(2024, 1, 1), 1.0),
      bar_at(day(2024, 1, 2), 1.0),
      bar_at(day(2024, 1, 9), 1.0),
    ]);
    assert_eq!(series.gaps(ChronoDuration::days(4)), vec![(day(2024, 1, 2), day(2024, 1, 9))]);
  }

  #[test]
  fn raw_bar_normalizes() {
    let raw = RawBar {
      date: "20240115".into(), open: 1.0, high: 2.0, low: 0.5, close: 1.5,
      volume: 1200.5, wap: 1.4, count: 7,
    };
    let bar = raw.normalize().unwrap();
    assert_eq!(bar.time, day(2024, 1, 15));
    assert_eq!(bar.volume, 1200.5);
  }
}
