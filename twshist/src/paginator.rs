// twshist/src/paginator.rs
// Walks a long history backwards one bounded window at a time.
//
// Window ends step back by the chunk's nominal span, so consecutive
// windows usually overlap. The series merge drops repeated timestamps.

use crate::base::TwsError;
use crate::contract::{Contract, WhatToShow};
use crate::data::{DurationUnit, HistoryOptions, SymbolSeries, Window};
use crate::fetcher::{default_what_to_show, prepare_request, WindowSource};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Delays and bounds applied between gateway requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pacing {
  /// Pause after a window that returned bars.
  pub inter_chunk: Duration,
  /// Added to `inter_chunk` after an empty or failed window.
  pub error_penalty: Duration,
  /// Pause between symbols in a batch.
  pub inter_symbol: Duration,
  /// How long one window may take before it is cancelled.
  pub chunk_timeout: Duration,
  /// How far past the target start the walk may run.
  pub drift_slack: ChronoDuration,
}

impl Default for Pacing {
  fn default() -> Self {
    Pacing {
      inter_chunk: Duration::from_secs(4),
      error_penalty: Duration::from_secs(5),
      inter_symbol: Duration::from_secs(10),
      chunk_timeout: Duration::from_secs(90),
      drift_slack: ChronoDuration::days(30),
    }
  }
}

impl Pacing {
  /// No pauses. For replays and tests.
  pub fn none() -> Self {
    Pacing {
      inter_chunk: Duration::ZERO,
      error_penalty: Duration::ZERO,
      inter_symbol: Duration::ZERO,
      ..Default::default()
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum WindowFailureReason {
  Timeout,
  Rejected { code: i32, message: String },
  Other(String),
}

impl From<&TwsError> for WindowFailureReason {
  fn from(err: &TwsError) -> Self {
    match err {
      TwsError::Timeout(_) => WindowFailureReason::Timeout,
      TwsError::RequestFatal(code, message) => WindowFailureReason::Rejected { code: *code, message: message.clone() },
      other => WindowFailureReason::Other(other.to_string()),
    }
  }
}

impl fmt::Display for WindowFailureReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      WindowFailureReason::Timeout => write!(f, "timed out"),
      WindowFailureReason::Rejected { code, message } => write!(f, "rejected ({}): {}", code, message),
      WindowFailureReason::Other(msg) => write!(f, "{}", msg),
    }
  }
}

/// A window the walk gave up on and skipped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowFailure {
  pub end: DateTime<Utc>,
  pub duration: String,
  pub reason: WindowFailureReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LongRangeResult {
  pub series: SymbolSeries,
  pub failures: Vec<WindowFailure>,
  pub windows_requested: usize,
  pub empty_windows: usize,
}

impl LongRangeResult {
  fn new(symbol: &str) -> Self {
    LongRangeResult { series: SymbolSeries::new(symbol), ..Default::default() }
  }

  /// Fold a later (resumed) run into this one.
  pub fn absorb(&mut self, other: LongRangeResult) {
    self.series.merge(other.series.into_bars());
    self.failures.extend(other.failures);
    self.windows_requested += other.windows_requested;
    self.empty_windows += other.empty_windows;
  }
}

/// What a walk had gathered when the connection went away.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
  /// End marker of the first window that did not complete.
  pub resume_end: DateTime<Utc>,
  pub partial: LongRangeResult,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LongRangeError {
  #[error("Interrupted at {}: {error}", .progress.resume_end.format("%Y-%m-%d %H:%M:%S"))]
  Interrupted { error: TwsError, progress: Box<Progress> },

  #[error("Request setup rejected: {0}")]
  Setup(TwsError),
}

/// Resolve the data kind once for the whole walk. Every window carries an
/// explicit end, which ADJUSTED_LAST does not allow.
fn windowed_options(contract: &Contract, options: &HistoryOptions) -> HistoryOptions {
  let mut options = *options;
  let kind = options.what_to_show.unwrap_or_else(|| default_what_to_show(contract.sec_type));
  if kind == WhatToShow::AdjustedLast {
    info!("{}: ADJUSTED_LAST needs an open end; paging with TRADES", contract.symbol);
    options.what_to_show = Some(WhatToShow::Trades);
  } else {
    options.what_to_show = Some(kind);
  }
  options
}

/// Walk from `start_end` back to `target_start`.
pub fn fetch_range<S: WindowSource + ?Sized>(
  source: &S,
  contract: &Contract,
  target_start: DateTime<Utc>,
  start_end: DateTime<Utc>,
  chunk: DurationUnit,
  options: &HistoryOptions,
  pacing: &Pacing,
) -> Result<LongRangeResult, LongRangeError> {
  let options = windowed_options(contract, options);
  prepare_request(contract, &Window::ending_at(start_end, chunk), &options).map_err(LongRangeError::Setup)?;

  let step = chunk.approximate_span();
  let floor = target_start
    .checked_sub_signed(pacing.drift_slack)
    .ok_or_else(|| LongRangeError::Setup(TwsError::InvalidParameter(format!("Start {} is out of range", target_start))))?;
  let mut result = LongRangeResult::new(&contract.symbol);
  let mut end = start_end;
  info!(
    "{}: paging {} windows from {} back to {}",
    contract.symbol,
    chunk,
    end.format("%Y-%m-%d"),
    target_start.format("%Y-%m-%d")
  );

  while end > floor {
    let window = Window::ending_at(end, chunk);
    result.windows_requested += 1;
    let pause = match source.fetch_window(contract, &window, &options, pacing.chunk_timeout) {
      Ok(bars) if !bars.is_empty() => {
        debug!("{}: {} bars for {}", contract.symbol, bars.len(), window);
        result.series.merge(bars);
        pacing.inter_chunk
      }
      Ok(_) => {
        info!("{}: no bars for {}", contract.symbol, window);
        result.empty_windows += 1;
        pacing.inter_chunk + pacing.error_penalty
      }
      // Session is gone; the caller decides whether to reconnect.
      Err(e) if e.is_connection_fatal() => {
        warn!("{}: connection lost at {}: {}", contract.symbol, window, e);
        return Err(LongRangeError::Interrupted { error: e, progress: Box::new(Progress { resume_end: end, partial: result }) });
      }
      Err(e) => {
        warn!("{}: skipping {}: {}", contract.symbol, window, e);
        result.failures.push(WindowFailure { end, duration: chunk.to_string(), reason: WindowFailureReason::from(&e) });
        pacing.inter_chunk + pacing.error_penalty
      }
    };

    end = match end.checked_sub_signed(step) {
      Some(next) => next,
      None => break,
    };
    if end > floor && !pause.is_zero() {
      thread::sleep(pause);
    }
  }

  info!(
    "{}: {} bars from {} windows ({} empty, {} failed)",
    contract.symbol,
    result.series.len(),
    result.windows_requested,
    result.empty_windows,
    result.failures.len()
  );
  Ok(result)
}

/// Collect roughly `total_span` of history ending at `now`.
pub fn fetch_long_range<S: WindowSource + ?Sized>(
  source: &S,
  contract: &Contract,
  total_span: ChronoDuration,
  chunk: DurationUnit,
  options: &HistoryOptions,
  pacing: &Pacing,
  now: DateTime<Utc>,
) -> Result<LongRangeResult, LongRangeError> {
  let target_start = now
    .checked_sub_signed(total_span)
    .ok_or_else(|| LongRangeError::Setup(TwsError::InvalidParameter(format!("Span {} back from {} is out of range", total_span, now))))?;
  fetch_range(source, contract, target_start, now, chunk, options, pacing)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::data::tests::{bar_at, day};
  use crate::data::Bar;
  use crate::fetcher::MockWindowSource;
  use mockall::Sequence;

  fn spy() -> Contract {
    Contract::stock_with_exchange("SPY", "ARCA", "USD")
  }

  fn daily(from: DateTime<Utc>, days: i64) -> Vec<Bar> {
    (0..days).map(|i| bar_at(from + ChronoDuration::days(i), 100.0 + i as f64)).collect()
  }

  #[test]
  fn overlapping_windows_keep_one_bar_per_timestamp() {
    let mut source = MockWindowSource::new();
    source.expect_fetch_window().returning(|_, window, options, _| {
      assert_eq!(options.what_to_show, Some(WhatToShow::Trades));
      let end = window.end.unwrap();
      // 40 days per window against a 28 day step.
      Ok(daily(end - ChronoDuration::days(40), 40))
    });

    let now = day(2024, 2, 20);
    let result =
      fetch_long_range(&source, &spy(), ChronoDuration::days(60), DurationUnit::Month(1), &HistoryOptions::default(), &Pacing::none(), now)
        .unwrap();

    let times: Vec<_> = result.series.bars().iter().map(|b| b.time).collect();
    assert_eq!(times.iter().filter(|t| **t == day(2024, 1, 15)).count(), 1);
    assert!(times.windows(2).all(|w| w[0] < w[1]));
    assert!(result.failures.is_empty());
  }

  #[test]
  fn first_arrival_wins_on_overlap() {
    let mut source = MockWindowSource::new();
    let mut seq = Sequence::new();
    source.expect_fetch_window().times(1).in_sequence(&mut seq).returning(|_, _, _, _| Ok(vec![bar_at(day(2024, 1, 15), 1.0)]));
    source.expect_fetch_window().times(1).in_sequence(&mut seq).returning(|_, _, _, _| Ok(vec![bar_at(day(2024, 1, 15), 2.0)]));
    let result = fetch_range(
      &source,
      &spy(),
      day(2024, 1, 25),
      day(2024, 2, 1),
      DurationUnit::Week(1),
      &HistoryOptions::default(),
      &Pacing { drift_slack: ChronoDuration::days(1), ..Pacing::none() },
    )
    .unwrap();
    assert_eq!(result.windows_requested, 2);
    assert_eq!(result.series.len(), 1);
    assert_eq!(result.series.bars()[0].close, 1.0);
  }

  #[test]
  fn rejected_window_is_recorded_and_the_walk_continues() {
    let mut source = MockWindowSource::new();
    let mut seq = Sequence::new();
    source
      .expect_fetch_window()
      .times(1)
      .in_sequence(&mut seq)
      .returning(|_, _, _, _| Err(TwsError::RequestFatal(354, "Requested market data is not subscribed.".into())));
    source
      .expect_fetch_window()
      .in_sequence(&mut seq)
      .returning(|_, window, _, _| Ok(daily(window.end.unwrap() - ChronoDuration::days(5), 5)));

    let now = day(2024, 3, 1);
    let result =
      fetch_long_range(&source, &spy(), ChronoDuration::days(20), DurationUnit::Week(1), &HistoryOptions::default(), &Pacing::none(), now)
        .unwrap();

    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].end, now);
    assert_eq!(result.failures[0].duration, "1 W");
    assert_eq!(
      result.failures[0].reason,
      WindowFailureReason::Rejected { code: 354, message: "Requested market data is not subscribed.".into() }
    );
    assert!(result.windows_requested > 1);
    assert!(!result.series.is_empty());
  }

  #[test]
  fn timeouts_and_empty_windows_still_advance() {
    let mut source = MockWindowSource::new();
    let mut seq = Sequence::new();
    source.expect_fetch_window().times(1).in_sequence(&mut seq).returning(|_, _, _, _| Ok(Vec::new()));
    source
      .expect_fetch_window()
      .times(1)
      .in_sequence(&mut seq)
      .returning(|_, _, _, _| Err(TwsError::Timeout("no data".into())));
    source.expect_fetch_window().in_sequence(&mut seq).returning(|_, _, _, _| Ok(Vec::new()));

    let now = day(2024, 3, 1);
    // 28 days of target plus 30 of slack, stepping a week: 9 windows.
    let result =
      fetch_long_range(&source, &spy(), ChronoDuration::days(28), DurationUnit::Week(1), &HistoryOptions::default(), &Pacing::none(), now)
        .unwrap();
    assert_eq!(result.windows_requested, 9);
    assert_eq!(result.empty_windows, 8);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].reason, WindowFailureReason::Timeout);
    assert!(result.series.is_empty());
  }

  #[test]
  fn connection_loss_interrupts_with_a_resume_point() {
    let mut source = MockWindowSource::new();
    let mut seq = Sequence::new();
    source
      .expect_fetch_window()
      .times(2)
      .in_sequence(&mut seq)
      .returning(|_, window, _, _| Ok(daily(window.end.unwrap() - ChronoDuration::days(7), 7)));
    source
      .expect_fetch_window()
      .times(1)
      .in_sequence(&mut seq)
      .returning(|_, _, _, _| Err(TwsError::ConnectionFatal(1100, "Connectivity between IB and TWS has been lost".into())));

    let now = day(2024, 3, 1);
    let err =
      fetch_long_range(&source, &spy(), ChronoDuration::days(90), DurationUnit::Week(1), &HistoryOptions::default(), &Pacing::none(), now)
        .unwrap_err();
    match err {
      LongRangeError::Interrupted { error, progress } => {
        assert_eq!(error.code(), Some(1100));
        assert_eq!(progress.resume_end, now - ChronoDuration::days(14));
        assert_eq!(progress.partial.windows_requested, 3);
        assert_eq!(progress.partial.series.len(), 14);
      }
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn invalid_contract_is_rejected_before_any_request() {
    let source = MockWindowSource::new();
    let btc = Contract::crypto("BTC", "SMART", "USD");
    let err = fetch_long_range(
      &source,
      &btc,
      ChronoDuration::days(30),
      DurationUnit::Week(1),
      &HistoryOptions::default(),
      &Pacing::none(),
      day(2024, 3, 1),
    )
    .unwrap_err();
    assert!(matches!(err, LongRangeError::Setup(TwsError::InvalidParameter(_))));
  }

  #[test]
  fn span_past_the_calendar_is_a_setup_error() {
    let source = MockWindowSource::new();
    let err = fetch_long_range(
      &source,
      &spy(),
      ChronoDuration::days(200_000_000),
      DurationUnit::Year(1),
      &HistoryOptions::default(),
      &Pacing::none(),
      day(2024, 3, 1),
    )
    .unwrap_err();
    assert!(matches!(err, LongRangeError::Setup(TwsError::InvalidParameter(_))));
  }

  #[test]
  fn absorb_merges_resumed_runs() {
    let mut first = LongRangeResult::new("SPY");
    first.series.merge(daily(day(2024, 1, 10), 5));
    first.windows_requested = 2;
    let mut second = LongRangeResult::new("SPY");
    second.series.merge(daily(day(2024, 1, 1), 12));
    second.windows_requested = 3;
    second.failures.push(WindowFailure { end: day(2023, 12, 1), duration: "1 M".into(), reason: WindowFailureReason::Timeout });
    first.absorb(second);
    assert_eq!(first.series.len(), 14);
    assert_eq!(first.windows_requested, 5);
    assert_eq!(first.failures.len(), 1);
  }
}
